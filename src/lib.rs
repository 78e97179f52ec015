//! Retrieve datasets from the Copernicus Climate Data Store (CDS) and stage
//! them into a local, content-addressed cache.
//!
//! A [`DatasetSpec`] is validated against a [`Catalog`] into a
//! [`RequestDescriptor`] whose [`CacheKey`] is a SHA-256 over its canonical
//! form. If the [`CacheIndex`] already holds that key nothing is sent to the
//! remote. Otherwise the request is submitted, polled until the remote job
//! finishes, streamed into the staging directory, verified and atomically
//! moved into the cache.
//!
//! ## Quick start
//! - Configure authentication via environment variables (`CDSAPI_URL`, `CDSAPI_KEY`) or a
//!   `.cdsapirc` file (supported in the current directory and in your home directory).
//! - Build a [`Pipeline`] around a [`CdsClient`] and call [`Pipeline::run`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use cdsstage::{CancelToken, Catalog, CdsClient, Credentials, DatasetSpec, Pipeline, PipelineConfig};
//! use serde_json::json;
//!
//! fn main() -> Result<()> {
//!     let client = CdsClient::new(&Credentials::from_env()?)?;
//!     let pipeline = Pipeline::new(Arc::new(client), Catalog::era5(), &PipelineConfig::from_env()?)?;
//!     let spec = DatasetSpec::new("reanalysis-era5-pressure-levels", "grib")
//!         .param("product_type", "reanalysis")
//!         .param("variable", json!(["geopotential"]))
//!         .param("pressure_level", json!(["1000"]))
//!         .param("year", 2024)
//!         .param("month", 3)
//!         .param("day", 1)
//!         .param("time", "13:00");
//!     let outcome = pipeline.run(&spec, &CancelToken::new())?;
//!     println!("{}", outcome.artifact().path.display());
//!     Ok(())
//! }
//! ```
//!
//! For full usage and configuration details, see the crate README.

#![forbid(unsafe_code)]

mod backoff;
mod cache;
mod catalog;
mod client;
mod clock;
mod config;
mod error;
mod job;
mod legacy;
mod pipeline;
mod plan;
mod poll;
mod processing;
mod remote;
mod request;
mod settings;
mod stage;
mod submit;
mod util;

pub use backoff::{Backoff, BackoffPolicy};
pub use cache::{CacheIndex, INDEX_FILE, StagedArtifact};
pub use catalog::{Catalog, DatasetDefinition, Domain, ParamRule};
pub use client::CdsClient;
pub use clock::{CancelToken, Clock, ManualClock, SystemClock};
pub use config::{AuthScheme, CredentialOverrides, Credentials};
pub use error::{ErrorKind, StageError};
pub use job::{InvalidTransition, JobStatus};
pub use pipeline::{JobReport, Outcome, Pipeline, PipelineFailure, TrackedJob};
pub use plan::{DayRange, DaySelection, JobEntry, JobFile};
pub use poll::{PollConfig, Poller};
pub use remote::{JobHandle, RemoteApi, RemoteArtifact, RemoteStatus};
pub use request::{
    Area, CacheKey, DataFormat, DatasetSpec, OutputFormat, Packaging, ParamValue, RequestBuilder,
    RequestDescriptor,
};
pub use settings::{LONGEST_WAIT, PipelineConfig};
pub use stage::{StageConfig, StageManager, VerifiedDownload};
pub use submit::SubmissionClient;
