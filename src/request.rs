//! Dataset specifications, canonical request descriptors and cache keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::Catalog;
use crate::error::StageError;
use crate::util::sha256_hex;

/// What a caller asks for, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub dataset: String,
    pub format: String,
    /// `unarchived` (default) or `zip`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Stage again even if the cache already holds this request, replacing
    /// the cached artifact once the new one is verified. Not part of the key.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refresh: bool,
}

impl DatasetSpec {
    pub fn new(dataset: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            format: format.into(),
            archive: None,
            params: BTreeMap::new(),
            refresh: false,
        }
    }

    pub fn param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn archive(mut self, archive: &str) -> Self {
        self.archive = Some(archive.to_string());
        self
    }

    pub fn refreshed(mut self) -> Self {
        self.refresh = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Grib,
    Netcdf,
}

impl DataFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grib" | "grib2" => Some(DataFormat::Grib),
            "netcdf" | "netcdf4" | "nc" => Some(DataFormat::Netcdf),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataFormat::Grib => "grib",
            DataFormat::Netcdf => "netcdf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Packaging {
    #[default]
    Unarchived,
    Zip,
}

impl Packaging {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unarchived" => Some(Packaging::Unarchived),
            "zip" => Some(Packaging::Zip),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Packaging::Unarchived => "unarchived",
            Packaging::Zip => "zip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputFormat {
    pub data: DataFormat,
    pub packaging: Packaging,
}

const GRIB_MAGIC: &[u8] = b"GRIB";
const HDF5_MAGIC: &[u8] = b"\x89HDF\r\n\x1a\n";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

impl OutputFormat {
    /// File extension of the staged artifact.
    pub fn extension(&self) -> &'static str {
        match (self.packaging, self.data) {
            (Packaging::Zip, _) => "zip",
            (Packaging::Unarchived, DataFormat::Grib) => "grib",
            (Packaging::Unarchived, DataFormat::Netcdf) => "nc",
        }
    }

    /// Whether `head` (the first bytes of a file) looks like this format.
    pub fn matches_header(&self, head: &[u8]) -> bool {
        match (self.packaging, self.data) {
            (Packaging::Zip, _) => head.starts_with(ZIP_MAGIC),
            (Packaging::Unarchived, DataFormat::Grib) => head.starts_with(GRIB_MAGIC),
            (Packaging::Unarchived, DataFormat::Netcdf) => {
                head.starts_with(HDF5_MAGIC)
                    || (head.len() >= 4 && &head[..3] == b"CDF" && matches!(head[3], 1 | 2 | 5))
            }
        }
    }

    /// Number of leading bytes [`OutputFormat::matches_header`] needs.
    pub(crate) const HEADER_LEN: usize = 8;
}

/// Geographic bounding box, serialized in CDS order `[N, W, S, E]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Area {
    pub north: f64,
    pub west: f64,
    pub south: f64,
    pub east: f64,
}

impl From<[f64; 4]> for Area {
    fn from([north, west, south, east]: [f64; 4]) -> Self {
        Self {
            north,
            west,
            south,
            east,
        }
    }
}

impl From<Area> for [f64; 4] {
    fn from(a: Area) -> Self {
        [a.north, a.west, a.south, a.east]
    }
}

impl Area {
    pub fn validate(&self) -> Result<(), String> {
        let coords: [f64; 4] = (*self).into();
        if coords.iter().any(|c| !c.is_finite()) {
            return Err("area coordinates must be finite".to_string());
        }
        if !(-90.0..=90.0).contains(&self.north) || !(-90.0..=90.0).contains(&self.south) {
            return Err("area latitudes must lie within -90..=90".to_string());
        }
        if self.north < self.south {
            return Err(format!(
                "area north ({}) lies south of its south edge ({})",
                self.north, self.south
            ));
        }
        if !(-180.0..=360.0).contains(&self.west) || !(-180.0..=360.0).contains(&self.east) {
            return Err("area longitudes must lie within -180..=360".to_string());
        }
        Ok(())
    }
}

/// A validated, canonical parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Text(String),
    List(Vec<String>),
    Area(Area),
}

impl ParamValue {
    fn to_wire(&self) -> Value {
        match self {
            ParamValue::Integer(n) => Value::from(*n),
            ParamValue::Text(s) => Value::from(s.as_str()),
            ParamValue::List(items) => Value::from(items.clone()),
            ParamValue::Area(area) => Value::from(<[f64; 4]>::from(*area).to_vec()),
        }
    }
}

/// Deterministic identifier of a [`RequestDescriptor`]: hex SHA-256 of its canonical JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated request. Immutable; build it with [`RequestBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    dataset: String,
    params: BTreeMap<String, ParamValue>,
    format: OutputFormat,
    key: CacheKey,
}

#[derive(Serialize)]
struct CanonicalForm<'a> {
    dataset: &'a str,
    format: &'a OutputFormat,
    params: &'a BTreeMap<String, ParamValue>,
}

impl RequestDescriptor {
    pub(crate) fn new(
        dataset: String,
        params: BTreeMap<String, ParamValue>,
        format: OutputFormat,
    ) -> Result<Self, StageError> {
        let canonical = serde_json::to_vec(&CanonicalForm {
            dataset: &dataset,
            format: &format,
            params: &params,
        })
        .map_err(|e| StageError::InvalidSpecification(format!("cannot canonicalize request: {e}")))?;
        let key = CacheKey(sha256_hex(&canonical));

        Ok(Self {
            dataset,
            params,
            format,
            key,
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The request body the CDS API expects for this dataset.
    pub fn to_request_json(&self) -> Value {
        let mut body = Map::new();
        for (name, value) in &self.params {
            body.insert(name.clone(), value.to_wire());
        }
        body.insert("data_format".to_string(), Value::from(self.format.data.as_str()));
        body.insert(
            "download_format".to_string(),
            Value::from(self.format.packaging.as_str()),
        );
        Value::Object(body)
    }

    /// One-line description for reports, e.g. `reanalysis-era5-land year=2020 ... [grib] (3fa1c2...)`.
    pub fn summary(&self) -> String {
        let mut out = self.dataset.clone();
        for (name, value) in &self.params {
            let rendered = match value {
                ParamValue::Integer(n) => n.to_string(),
                ParamValue::Text(s) => s.clone(),
                ParamValue::List(items) if items.len() <= 3 => items.join(","),
                ParamValue::List(items) => format!("{}..({} values)", items[0], items.len()),
                ParamValue::Area(a) => format!("{}/{}/{}/{}", a.north, a.west, a.south, a.east),
            };
            out.push_str(&format!(" {name}={rendered}"));
        }
        out.push_str(&format!(" [{}] ({})", self.format.extension(), self.key.short()));
        out
    }
}

/// Turns [`DatasetSpec`]s into [`RequestDescriptor`]s against a [`Catalog`].
#[derive(Debug, Clone, Copy)]
pub struct RequestBuilder<'a> {
    catalog: &'a Catalog,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn build(&self, spec: &DatasetSpec) -> Result<RequestDescriptor, StageError> {
        let invalid = |msg: String| StageError::InvalidSpecification(format!("{}: {msg}", spec.dataset));

        let definition = self
            .catalog
            .dataset(&spec.dataset)
            .ok_or_else(|| invalid("unknown dataset".to_string()))?;

        let data = DataFormat::parse(&spec.format)
            .ok_or_else(|| invalid(format!("unknown format `{}`", spec.format)))?;
        if !definition.offers(data) {
            return Err(invalid(format!("format `{}` is not offered", data.as_str())));
        }
        let packaging = match spec.archive.as_deref() {
            None => Packaging::Unarchived,
            Some(a) => Packaging::parse(a).ok_or_else(|| invalid(format!("unknown archive `{a}`")))?,
        };

        let mut params = BTreeMap::new();
        for (name, value) in &spec.params {
            if name == "data_format" || name == "download_format" {
                return Err(invalid(format!(
                    "`{name}` is set through `format`/`archive`, not params"
                )));
            }
            let rule = definition
                .rule_for(name)
                .ok_or_else(|| invalid(format!("unknown parameter `{name}`")))?;
            let normalized = rule.normalize(value, self.catalog).map_err(invalid)?;
            params.insert(name.clone(), normalized);
        }

        let missing: Vec<&str> = definition
            .rules()
            .filter(|r| r.required && !params.contains_key(&r.name))
            .map(|r| r.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(invalid(format!(
                "missing required parameter(s): {}",
                missing.join(", ")
            )));
        }

        RequestDescriptor::new(
            spec.dataset.clone(),
            params,
            OutputFormat { data, packaging },
        )
    }
}
