//! A small Rust client for the USGS EarthExplorer Machine-to-Machine (M2M) API.
//!
//! This crate implements the bulk retrieval flow of M2M:
//! search scenes, order their products, poll until they are staged, then
//! download the files concurrently with size checks and resumability.
//!
//! ## Quick start
//! - Configure credentials via environment variables (`M2M_USERNAME`, `M2M_TOKEN`,
//!   optionally `M2M_URL`) or a `.m2mrc` file (current directory or home directory).
//! - Build [`SearchCriteria`], call [`Client::search_scenes`], then hand the
//!   hits to [`Client::retrieve_scenes`].
//!
//! ```no_run
//! use anyhow::Result;
//! use chrono::NaiveDate;
//! use m2mapi::{Client, RetrieveOptions, SearchCriteria, Spatial};
//!
//! fn main() -> Result<()> {
//!     let mut client = Client::from_env()?;
//!     let criteria = SearchCriteria::new("landsat_ot_c2_l1")
//!         .with_dates(NaiveDate::from_ymd_opt(2020, 8, 1), NaiveDate::from_ymd_opt(2020, 8, 31))
//!         .with_spatial(Spatial::bbox(-126.47, -112.43, 32.14, 42.40))
//!         .with_max_results(3);
//!
//!     let scenes = client.search_scenes(&criteria)?;
//!     let meta = client.retrieve_scenes(
//!         "landsat_ot_c2_l1",
//!         &scenes.results,
//!         &RetrieveOptions::default().with_output_dir("ingest"),
//!     )?;
//!     println!("{} download(s)", meta.len());
//!     client.logout()?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

mod cancel;
mod client;
mod config;
mod download;
mod error;
mod filter;
mod gateway;
mod order;
mod util;

pub use cancel::CancelToken;
pub use client::{Client, ClientConfig, Dataset};
pub use download::{ByteSource, FetchJob, Fetched, Fetcher, HttpSource, available_locally};
pub use error::{DownloadFailure, Error, Result};
pub use filter::{
    CloudCover, DEFAULT_START_DATE, DatasetFilterField, FieldCatalog, FilterDocument, GeoJson,
    MetadataFilter, Predicate, SearchCriteria, Spatial, compile_dataset_search,
    compile_scene_search, load_geometry,
};
pub use gateway::{AUTH_HEADER, Gateway, HttpReply, HttpTransport, Transport, TransportError};
pub use order::{
    DEFAULT_LABEL, DownloadMeta, DownloadMetaMap, DownloadOption, DownloadStatus, OptionFilter,
    OptionPredicate, OrderState, RetrieveOptions, SceneRecord, SceneSearchResults,
    TemporalCoverage,
};
