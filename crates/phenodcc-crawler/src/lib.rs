//! PhenoDCC file-source crawler
//!
//! Periodic, multi-source ingestion pipeline: discovers archived
//! submissions on the contributing centres' file servers, downloads them
//! reliably, extracts and validates their contents, and drives each
//! document through the serialisation, integrity, context and overview
//! stages. Per-artifact state lives in the shared tracker database; a
//! filesystem lock serialises pipeline runs against the same tracker.

pub mod config;
pub mod discovery;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod lock;
pub mod postingest;
pub mod progress;
pub mod session;
pub mod source;

pub use config::{CrawlerConfig, Settings};
pub use error::{CrawlerError, Result};
pub use lock::{InstanceLock, LockError};
pub use session::SessionOrchestrator;

use std::path::PathBuf;

use clap::Parser;

/// PhenoDCC file source crawler
#[derive(Parser, Debug)]
#[command(name = "phenodcc-crawler")]
#[command(about = "Crawls centre file sources and tracks submission processing")]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Number of parallel downloaders to use
    #[arg(short = 'a', value_name = "NUM", default_value_t = 1)]
    pub downloaders: usize,

    /// Maximum number of download retries per file source
    #[arg(short = 'm', value_name = "NUM", default_value_t = 1)]
    pub max_retries: u32,

    /// Maximum size of the discovery and extraction pools
    #[arg(short = 't', value_name = "NUM", default_value_t = 10)]
    pub pool_size: usize,

    /// Delay in hours for periodic runs; zero runs once and exits
    #[arg(short = 'p', value_name = "HOURS", default_value_t = 0)]
    pub periodic_delay: u64,

    /// Directory where downloaded archives are stored
    #[arg(short = 'd', value_name = "DIR", default_value = config::DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Email id to send the session report to
    #[arg(short = 'r', value_name = "EMAIL")]
    pub report_email: Option<String>,

    /// Crawler properties file
    #[arg(short = 'c', value_name = "FILE", required = true)]
    pub crawler_props: PathBuf,

    /// XML serialiser properties file
    #[arg(short = 's', value_name = "FILE")]
    pub serializer_props: Option<PathBuf>,

    /// XML validator properties file
    #[arg(short = 'v', value_name = "FILE")]
    pub validator_props: Option<PathBuf>,

    /// XML validation resources properties file
    #[arg(short = 'x', value_name = "FILE")]
    pub validation_resources_props: Option<PathBuf>,

    /// Context builder properties file
    #[arg(short = 'o', value_name = "FILE")]
    pub context_props: Option<PathBuf>,
}
