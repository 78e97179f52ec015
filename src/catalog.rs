//! Declared value domains for the datasets this crate knows how to request.
//!
//! A [`Catalog`] is what makes request building fail early: unknown datasets,
//! unknown parameters and out-of-domain values are caught locally instead of
//! after a multi-hour wait in the remote queue.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::request::{Area, DataFormat, ParamValue};

/// Allowed values of a single request parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    /// One of a fixed set of strings.
    Choice(Vec<String>),
    /// Whole numbers in `min..=max`.
    Integer { min: i64, max: i64 },
    /// Time of day as `HH:MM`.
    Hour,
    /// Bounding box `[N, W, S, E]` or the name of a known area.
    Area,
    /// Any non-empty string.
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamRule {
    pub name: String,
    pub domain: Domain,
    pub required: bool,
    pub multiple: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDefinition {
    name: String,
    rules: BTreeMap<String, ParamRule>,
    formats: Vec<DataFormat>,
}

impl DatasetDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: BTreeMap::new(),
            formats: vec![DataFormat::Grib, DataFormat::Netcdf],
        }
    }

    pub fn required(self, name: &str, domain: Domain, multiple: bool) -> Self {
        self.rule(name, domain, true, multiple)
    }

    pub fn optional(self, name: &str, domain: Domain, multiple: bool) -> Self {
        self.rule(name, domain, false, multiple)
    }

    pub fn formats(mut self, formats: &[DataFormat]) -> Self {
        self.formats = formats.to_vec();
        self
    }

    fn rule(mut self, name: &str, domain: Domain, required: bool, multiple: bool) -> Self {
        self.rules.insert(
            name.to_string(),
            ParamRule {
                name: name.to_string(),
                domain,
                required,
                multiple,
            },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rule_for(&self, param: &str) -> Option<&ParamRule> {
        self.rules.get(param)
    }

    pub fn rules(&self) -> impl Iterator<Item = &ParamRule> {
        self.rules.values()
    }

    pub fn offers(&self, format: DataFormat) -> bool {
        self.formats.contains(&format)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    datasets: BTreeMap<String, DatasetDefinition>,
    areas: BTreeMap<String, Area>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// ERA5 hourly datasets on single levels, pressure levels and land, plus
    /// the areas of interest they are usually cut to.
    pub fn era5() -> Self {
        let product_types = choice(&[
            "reanalysis",
            "ensemble_members",
            "ensemble_mean",
            "ensemble_spread",
        ]);

        let single_levels = era5_calendar(DatasetDefinition::new("reanalysis-era5-single-levels"), 1940)
            .required("product_type", product_types.clone(), true)
            .required("variable", Domain::Text, true);

        let pressure_levels =
            era5_calendar(DatasetDefinition::new("reanalysis-era5-pressure-levels"), 1940)
                .required("product_type", product_types, true)
                .required("variable", choice(PRESSURE_LEVEL_VARIABLES), true)
                .required("pressure_level", choice(PRESSURE_LEVELS), true);

        let land = era5_calendar(DatasetDefinition::new("reanalysis-era5-land"), 1950)
            .required("variable", choice(LAND_VARIABLES), true);

        Self::empty()
            .with_dataset(single_levels)
            .with_dataset(pressure_levels)
            .with_dataset(land)
            .with_area(
                "czech_republic",
                Area {
                    north: 51.08,
                    west: 12.07,
                    south: 48.48,
                    east: 19.00,
                },
            )
    }

    pub fn with_dataset(mut self, definition: DatasetDefinition) -> Self {
        self.datasets.insert(definition.name.clone(), definition);
        self
    }

    pub fn with_area(mut self, name: &str, area: Area) -> Self {
        self.areas.insert(name.to_string(), area);
        self
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetDefinition> {
        self.datasets.get(name)
    }

    pub fn area(&self, name: &str) -> Option<Area> {
        self.areas.get(name).copied()
    }
}

impl ParamRule {
    /// Validates `value` against this rule and brings it to canonical form.
    ///
    /// Multi-valued parameters always normalize to a sorted, deduplicated
    /// list, so `"t2m"`, `["t2m"]` and, for integers, `{"start":..,"end":..}`
    /// spellings of the same values are the same request.
    pub fn normalize(&self, value: &Value, catalog: &Catalog) -> Result<ParamValue, String> {
        if self.domain == Domain::Area {
            return self.normalize_area(value, catalog).map(ParamValue::Area);
        }

        match value {
            Value::Array(items) => {
                if !self.multiple {
                    return Err(format!("`{}` takes a single value", self.name));
                }
                if items.is_empty() {
                    return Err(format!("`{}` must not be an empty list", self.name));
                }
                let mut scalars = items
                    .iter()
                    .map(|item| self.normalize_scalar(item))
                    .collect::<Result<Vec<_>, _>>()?;
                self.sort_canonical(&mut scalars);
                scalars.dedup();
                Ok(ParamValue::List(scalars))
            }
            Value::Object(map) => {
                let Domain::Integer { min, max } = self.domain else {
                    return Err(format!("`{}` does not accept a range", self.name));
                };
                if !self.multiple {
                    return Err(format!("`{}` takes a single value", self.name));
                }
                let bound = |field: &str| -> Result<i64, String> {
                    let v = map
                        .get(field)
                        .ok_or_else(|| format!("range for `{}` is missing `{field}`", self.name))?;
                    self.parse_integer(v, min, max)
                };
                let (start, end) = (bound("start")?, bound("end")?);
                if start > end {
                    return Err(format!(
                        "range for `{}` is empty ({start} > {end})",
                        self.name
                    ));
                }
                Ok(ParamValue::List((start..=end).map(|n| n.to_string()).collect()))
            }
            scalar => {
                let text = self.normalize_scalar(scalar)?;
                if self.multiple {
                    Ok(ParamValue::List(vec![text]))
                } else if let Domain::Integer { .. } = self.domain {
                    // normalize_scalar already validated the number
                    text.parse::<i64>()
                        .map(ParamValue::Integer)
                        .map_err(|e| format!("`{}`: {e}", self.name))
                } else {
                    Ok(ParamValue::Text(text))
                }
            }
        }
    }

    fn normalize_scalar(&self, value: &Value) -> Result<String, String> {
        match &self.domain {
            Domain::Integer { min, max } => self.parse_integer(value, *min, *max).map(|n| n.to_string()),
            Domain::Choice(allowed) => {
                let text = scalar_text(value)
                    .ok_or_else(|| format!("`{}` expects text values", self.name))?;
                if allowed.iter().any(|a| a == &text) {
                    Ok(text)
                } else {
                    Err(format!("`{text}` is not a valid value for `{}`", self.name))
                }
            }
            Domain::Hour => {
                let text = scalar_text(value)
                    .ok_or_else(|| format!("`{}` expects `HH:MM` values", self.name))?;
                parse_hour(&text).ok_or_else(|| format!("`{text}` is not a valid time for `{}`", self.name))
            }
            Domain::Text => match scalar_text(value) {
                Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
                _ => Err(format!("`{}` expects non-empty text", self.name)),
            },
            Domain::Area => Err(format!("`{}` is an area, not a list value", self.name)),
        }
    }

    fn parse_integer(&self, value: &Value, min: i64, max: i64) -> Result<i64, String> {
        let n = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| format!("`{}` expects whole numbers, got {value}", self.name))?;
        if n < min || n > max {
            return Err(format!("`{}` value {n} is outside {min}..={max}", self.name));
        }
        Ok(n)
    }

    fn normalize_area(&self, value: &Value, catalog: &Catalog) -> Result<Area, String> {
        match value {
            Value::String(name) => catalog
                .area(name)
                .ok_or_else(|| format!("unknown area of interest `{name}`")),
            Value::Array(items) if items.len() == 4 => {
                let mut coords = [0f64; 4];
                for (slot, item) in coords.iter_mut().zip(items) {
                    *slot = item
                        .as_f64()
                        .ok_or_else(|| format!("`{}` coordinates must be numbers", self.name))?;
                }
                let area = Area::from(coords);
                area.validate().map(|()| area)
            }
            _ => Err(format!(
                "`{}` must be [north, west, south, east] or the name of an area",
                self.name
            )),
        }
    }

    fn sort_canonical(&self, values: &mut [String]) {
        if let Domain::Integer { .. } = self.domain {
            values.sort_by_key(|v| v.parse::<i64>().unwrap_or(i64::MAX));
        } else {
            values.sort();
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_hour(text: &str) -> Option<String> {
    let (h, m) = text.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then(|| format!("{h:02}:{m:02}"))
}

fn choice(values: &[&str]) -> Domain {
    Domain::Choice(values.iter().map(|v| v.to_string()).collect())
}

fn era5_calendar(definition: DatasetDefinition, first_year: i64) -> DatasetDefinition {
    definition
        .required("year", Domain::Integer { min: first_year, max: 2100 }, true)
        .required("month", Domain::Integer { min: 1, max: 12 }, true)
        .required("day", Domain::Integer { min: 1, max: 31 }, true)
        .required("time", Domain::Hour, true)
        .optional("area", Domain::Area, false)
}

const PRESSURE_LEVELS: &[&str] = &[
    "1", "2", "3", "5", "7", "10", "20", "30", "50", "70", "100", "125", "150", "175", "200",
    "225", "250", "300", "350", "400", "450", "500", "550", "600", "650", "700", "750", "775",
    "800", "825", "850", "875", "900", "925", "950", "975", "1000",
];

const PRESSURE_LEVEL_VARIABLES: &[&str] = &[
    "divergence",
    "fraction_of_cloud_cover",
    "geopotential",
    "ozone_mass_mixing_ratio",
    "potential_vorticity",
    "relative_humidity",
    "specific_cloud_ice_water_content",
    "specific_cloud_liquid_water_content",
    "specific_humidity",
    "specific_rain_water_content",
    "specific_snow_water_content",
    "temperature",
    "u_component_of_wind",
    "v_component_of_wind",
    "vertical_velocity",
    "vorticity",
];

const LAND_VARIABLES: &[&str] = &[
    "2m_dewpoint_temperature",
    "2m_temperature",
    "skin_temperature",
    "soil_temperature_level_1",
    "soil_temperature_level_2",
    "soil_temperature_level_3",
    "soil_temperature_level_4",
    "lake_bottom_temperature",
    "lake_ice_depth",
    "lake_ice_temperature",
    "lake_mix_layer_depth",
    "lake_mix_layer_temperature",
    "lake_shape_factor",
    "lake_total_layer_temperature",
    "snow_albedo",
    "snow_cover",
    "snow_density",
    "snow_depth",
    "snow_depth_water_equivalent",
    "snowfall",
    "snowmelt",
    "temperature_of_snow_layer",
    "skin_reservoir_content",
    "volumetric_soil_water_layer_1",
    "volumetric_soil_water_layer_2",
    "volumetric_soil_water_layer_3",
    "volumetric_soil_water_layer_4",
    "forecast_albedo",
    "surface_latent_heat_flux",
    "surface_net_solar_radiation",
    "surface_net_thermal_radiation",
    "surface_sensible_heat_flux",
    "surface_solar_radiation_downwards",
    "surface_thermal_radiation_downwards",
    "evaporation_from_bare_soil",
    "evaporation_from_open_water_surfaces_excluding_oceans",
    "evaporation_from_the_top_of_canopy",
    "evaporation_from_vegetation_transpiration",
    "potential_evaporation",
    "runoff",
    "snow_evaporation",
    "sub_surface_runoff",
    "surface_runoff",
    "total_evaporation",
    "10m_u_component_of_wind",
    "10m_v_component_of_wind",
    "surface_pressure",
    "total_precipitation",
    "leaf_area_index_high_vegetation",
    "leaf_area_index_low_vegetation",
];
