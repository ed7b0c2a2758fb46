//! Nodelink ETL - bulk geospatial loading pipeline
//!
//! Loads large delimited or shapefile road-network datasets (the MOCT
//! standard node-link network: a national road-node shapefile set and a
//! road-link CSV table) into a PostgreSQL/PostGIS store, with declared
//! source encodings, explicit coordinate reprojection, batched atomic
//! inserts, idempotent index creation, and post-load verification.
//!
//! # Pipeline
//!
//! ```text
//! RecordSource -> SchemaMapper -> Loader -> IndexBuilder -> Verifier
//! ```
//!
//! Each stage depends only on the previous stage's output contract. The
//! target store sits behind the [`store::SpatialStore`] trait; production
//! runs use [`store::PgStore`], tests use [`store::MemStore`].
//!
//! # Example
//!
//! ```no_run
//! use nodelink_etl::descriptor::{DatasetDescriptor, LoadMode};
//! use nodelink_etl::pipeline::{Pipeline, PipelineOptions};
//! use nodelink_etl::store::PgStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let descriptor = DatasetDescriptor::from_toml_path("config/moct_link.toml")?;
//!     let config = nodelink_etl::config::DbConfig::load()?;
//!     let store = Arc::new(PgStore::connect(&config).await?);
//!     let pipeline = Pipeline::new(store);
//!     let report = pipeline
//!         .run(&[descriptor], &PipelineOptions::new(LoadMode::Overwrite))
//!         .await;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod descriptor;
pub mod geom;
pub mod index;
pub mod loader;
pub mod mapper;
pub mod pipeline;
pub mod proj;
pub mod report;
pub mod source;
pub mod store;
pub mod verify;

pub use nodelink_common::{EtlError, Result};
