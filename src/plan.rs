//! Jobs files: the list of dataset specifications a run should stage.
//!
//! ```json
//! {"jobs": [
//!   {"dataset": "reanalysis-era5-land", "format": "grib",
//!    "params": {"variable": ["2m_temperature"], "time": ["00:00", "06:00", "12:00", "18:00"], "area": "czech_republic"},
//!    "days": {"from": "2024-03-01", "to": "2024-03-03"}},
//!   {"dataset": "reanalysis-era5-single-levels", "format": "grib",
//!    "params": {"product_type": "reanalysis", "variable": ["2m_temperature"], "time": ["12:00"]},
//!    "days": {"last": 30}, "refresh_within_days": 10}
//! ]}
//! ```
//!
//! ERA5 publishes preliminary data for recent days and revises it later, so
//! days inside `refresh_within_days` are staged again on every run and
//! replace whatever the cache holds for them.

use std::fs;
use std::path::Path;

use chrono::{Datelike, Days, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::StageError;
use crate::request::DatasetSpec;

#[derive(Debug, Clone, Deserialize)]
pub struct JobFile {
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    #[serde(flatten)]
    pub spec: DatasetSpec,
    /// Expands into one job per calendar day, both ends included.
    #[serde(default)]
    pub days: Option<DaySelection>,
    /// Days no older than this many days before today are always staged
    /// again. Requires `days`.
    #[serde(default)]
    pub refresh_within_days: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DayRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DayRange {
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.from.iter_days().take_while(|day| day <= &self.to)
    }
}

/// Either fixed dates or a window ending today (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DaySelection {
    Between(DayRange),
    /// The last `last` days, today included.
    Recent { last: u32 },
}

impl DaySelection {
    pub fn resolve(&self, today: NaiveDate) -> Result<DayRange, String> {
        match *self {
            DaySelection::Between(range) if range.from > range.to => {
                Err(format!("day range {} .. {} is empty", range.from, range.to))
            }
            DaySelection::Between(range) => Ok(range),
            DaySelection::Recent { last: 0 } => Err("`last` must be at least 1".to_string()),
            DaySelection::Recent { last } => today
                .checked_sub_days(Days::new(u64::from(last - 1)))
                .map(|from| DayRange { from, to: today })
                .ok_or_else(|| format!("`last: {last}` reaches before the calendar starts")),
        }
    }
}

impl JobFile {
    pub fn load(path: &Path) -> Result<Self, StageError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            StageError::Configuration(format!("cannot read jobs file {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, StageError> {
        serde_json::from_str(raw)
            .map_err(|e| StageError::InvalidSpecification(format!("malformed jobs file: {e}")))
    }

    /// Flattens the file into individual specifications, in file order,
    /// with relative days counted back from today (UTC).
    pub fn expand(&self) -> Result<Vec<DatasetSpec>, StageError> {
        self.expand_on(Utc::now().date_naive())
    }

    pub fn expand_on(&self, today: NaiveDate) -> Result<Vec<DatasetSpec>, StageError> {
        let mut specs = Vec::new();
        for (n, entry) in self.jobs.iter().enumerate() {
            let invalid = |msg: String| StageError::InvalidSpecification(format!("job #{}: {msg}", n + 1));

            let Some(selection) = entry.days else {
                if entry.refresh_within_days.is_some() {
                    return Err(invalid("`refresh_within_days` needs `days`".to_string()));
                }
                specs.push(entry.spec.clone());
                continue;
            };

            let range = selection.resolve(today).map_err(invalid)?;
            if let Some(clash) = ["year", "month", "day"]
                .into_iter()
                .find(|p| entry.spec.params.contains_key(*p))
            {
                return Err(invalid(format!(
                    "`days` cannot be combined with an explicit `{clash}`"
                )));
            }
            let refresh_from = entry
                .refresh_within_days
                .map(|n| today.checked_sub_days(Days::new(u64::from(n))).unwrap_or(NaiveDate::MIN));

            for day in range.days() {
                let mut spec = entry.spec.clone();
                spec.params.insert("year".into(), Value::from(day.year()));
                spec.params.insert("month".into(), Value::from(day.month()));
                spec.params.insert("day".into(), Value::from(day.day()));
                if refresh_from.is_some_and(|from| day >= from) {
                    spec.refresh = true;
                }
                specs.push(spec);
            }
        }
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn day_ranges_expand_inclusively() {
        let file = JobFile::from_json(
            r#"{"jobs":[
                {"dataset":"reanalysis-era5-land","format":"netcdf","params":{"variable":"2m_temperature"},
                 "days":{"from":"2024-02-28","to":"2024-03-01"}},
                {"dataset":"reanalysis-era5-single-levels","format":"grib","archive":"zip","params":{"year":2020}}
            ]}"#,
        )
        .unwrap();

        let specs = file.expand().unwrap();
        assert_eq!(specs.len(), 4);
        let days: Vec<_> = specs[..3]
            .iter()
            .map(|s| (s.params["year"].clone(), s.params["month"].clone(), s.params["day"].clone()))
            .collect();
        assert_eq!(
            days,
            vec![
                (json!(2024), json!(2), json!(28)),
                (json!(2024), json!(2), json!(29)),
                (json!(2024), json!(3), json!(1)),
            ]
        );
        assert_eq!(specs[3].archive.as_deref(), Some("zip"));
        assert_eq!(specs[3].params["year"], json!(2020));
    }

    #[test]
    fn backwards_range_is_invalid() {
        let file = JobFile::from_json(
            r#"{"jobs":[{"dataset":"d","format":"grib","days":{"from":"2024-03-02","to":"2024-03-01"}}]}"#,
        )
        .unwrap();
        assert!(matches!(file.expand(), Err(StageError::InvalidSpecification(_))));
    }

    #[test]
    fn days_conflict_with_explicit_calendar_params() {
        let file = JobFile::from_json(
            r#"{"jobs":[{"dataset":"d","format":"grib","params":{"month":3},"days":{"from":"2024-03-01","to":"2024-03-01"}}]}"#,
        )
        .unwrap();
        assert!(matches!(file.expand(), Err(StageError::InvalidSpecification(ref m)) if m.contains("month")));
    }

    #[test]
    fn recent_days_count_back_from_today() {
        let file = JobFile::from_json(
            r#"{"jobs":[{"dataset":"d","format":"grib","params":{"variable":"t"},
                "days":{"last":4},"refresh_within_days":1}]}"#,
        )
        .unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();

        let specs = file.expand_on(today).unwrap();
        let days: Vec<_> = specs
            .iter()
            .map(|s| (s.params["month"].clone(), s.params["day"].clone(), s.refresh))
            .collect();
        assert_eq!(
            days,
            vec![
                (json!(2), json!(28), false),
                (json!(2), json!(29), false),
                (json!(3), json!(1), true),
                (json!(3), json!(2), true),
            ]
        );
    }

    #[test]
    fn refresh_window_applies_to_fixed_ranges() {
        let file = JobFile::from_json(
            r#"{"jobs":[{"dataset":"d","format":"grib",
                "days":{"from":"2024-01-01","to":"2024-01-10"},"refresh_within_days":5}]}"#,
        )
        .unwrap();
        let specs = file.expand_on(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()).unwrap();
        assert_eq!(specs.len(), 10);
        let refreshed: Vec<_> = specs
            .iter()
            .filter(|s| s.refresh)
            .map(|s| s.params["day"].clone())
            .collect();
        assert_eq!(refreshed, (3..=10).map(|d| json!(d)).collect::<Vec<_>>());
    }

    #[test]
    fn empty_or_unanchored_windows_are_invalid() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        for raw in [
            r#"{"jobs":[{"dataset":"d","format":"grib","days":{"last":0}}]}"#,
            r#"{"jobs":[{"dataset":"d","format":"grib","refresh_within_days":3}]}"#,
        ] {
            let file = JobFile::from_json(raw).unwrap();
            assert!(matches!(file.expand_on(today), Err(StageError::InvalidSpecification(_))));
        }
    }

    #[test]
    fn malformed_file_is_reported() {
        assert!(matches!(
            JobFile::from_json(r#"{"jobs":[{"format":"grib"}]}"#),
            Err(StageError::InvalidSpecification(_))
        ));
    }
}
