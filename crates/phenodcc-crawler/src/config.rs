//! Crawler settings
//!
//! The `-c` properties file supplies the tracker location, the filename
//! patterns, and the external tool commands; the remaining command-line
//! flags carry the bounded runtime parameters. The properties files for
//! the tools themselves (`-s`, `-v`, `-x`, `-o`) are opaque to the
//! crawler: they are only checked readable here and handed to the
//! subprocesses verbatim.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CrawlerError, Result};
use crate::Cli;
use phenodcc_tracker::tokenizer::{DEFAULT_XML_PATTERN, DEFAULT_ZIP_PATTERN};

pub const DEFAULT_DATA_DIR: &str = "backup";
pub const MIN_PARALLEL_DOWNLOADS: usize = 1;
pub const MAX_PARALLEL_DOWNLOADS: usize = 10;
pub const MIN_MAX_RETRIES: u32 = 1;
pub const MAX_MAX_RETRIES: u32 = 5;
pub const MIN_POOL_SIZE: usize = 1;
pub const MAX_POOL_SIZE: usize = 10;

/// Contents of the `-c` crawler properties file.
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Tracker database location (a path, or a `sqlite:` URL).
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamingConfig {
    #[serde(default = "default_zip_pattern")]
    pub zip_pattern: String,
    #[serde(default = "default_xml_pattern")]
    pub xml_pattern: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            zip_pattern: default_zip_pattern(),
            xml_pattern: default_xml_pattern(),
        }
    }
}

fn default_zip_pattern() -> String {
    DEFAULT_ZIP_PATTERN.to_string()
}

fn default_xml_pattern() -> String {
    DEFAULT_XML_PATTERN.to_string()
}

/// External tool commands. A tool left unset is skipped with a warning
/// wherever the pipeline would have invoked it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    /// XML serialiser run during the upload phase.
    pub serializer: Option<PathBuf>,
    /// Data integrity checker run during the data phase.
    pub integrity_checker: Option<PathBuf>,
    /// Context builder run after a successful integrity check.
    pub context_builder: Option<PathBuf>,
    /// Schema validator for specimen documents.
    pub specimen_validator: Option<PathBuf>,
    /// Schema validator for experiment documents.
    pub experiment_validator: Option<PathBuf>,
    /// Overview builder shell tool, run once per session.
    pub overview_builder: Option<PathBuf>,
    /// Database name handed to the overview builder.
    pub overview_database: Option<String>,
}

impl CrawlerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|_| CrawlerError::UnreadableProperties(path.to_path_buf()))?;
        let config: CrawlerConfig = toml::from_str(&text)?;
        Ok(config)
    }
}

/// Validated runtime settings, owned by the session orchestrator and
/// handed to workers as an explicit dependency.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backup_dir: PathBuf,
    pub num_downloaders: usize,
    pub pool_size: usize,
    pub max_retries: u32,
    pub periodic_delay_hours: u64,
    pub report_email: Option<String>,
    pub tracker_url: String,
    pub zip_pattern: String,
    pub xml_pattern: String,
    pub tools: ToolsConfig,
    pub serializer_props: Option<PathBuf>,
    pub validator_props: Option<PathBuf>,
    pub validation_resources_props: Option<PathBuf>,
    pub context_props: Option<PathBuf>,
}

impl Settings {
    /// Validate the command line and load the crawler properties.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if !(MIN_PARALLEL_DOWNLOADS..=MAX_PARALLEL_DOWNLOADS).contains(&cli.downloaders) {
            return Err(CrawlerError::config(format!(
                "The number of parallel downloads must be between {MIN_PARALLEL_DOWNLOADS} \
                 and {MAX_PARALLEL_DOWNLOADS}"
            )));
        }
        if !(MIN_MAX_RETRIES..=MAX_MAX_RETRIES).contains(&cli.max_retries) {
            return Err(CrawlerError::config(format!(
                "The maximum number of download retries must be between {MIN_MAX_RETRIES} \
                 and {MAX_MAX_RETRIES}"
            )));
        }
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&cli.pool_size) {
            return Err(CrawlerError::config(format!(
                "The pool size must be between {MIN_POOL_SIZE} and {MAX_POOL_SIZE}"
            )));
        }
        if cli.data_dir.as_os_str().is_empty() {
            return Err(CrawlerError::config("The data directory must not be empty"));
        }
        if let Some(email) = &cli.report_email {
            if email.is_empty() {
                return Err(CrawlerError::config("The supplied email id is invalid"));
            }
        }

        let config = CrawlerConfig::load(&readable_file(&cli.crawler_props)?)?;
        let serializer_props = cli.serializer_props.as_deref().map(readable_file).transpose()?;
        let validator_props = cli.validator_props.as_deref().map(readable_file).transpose()?;
        let validation_resources_props = cli
            .validation_resources_props
            .as_deref()
            .map(readable_file)
            .transpose()?;
        let context_props = cli.context_props.as_deref().map(readable_file).transpose()?;

        Ok(Self {
            backup_dir: cli.data_dir.clone(),
            num_downloaders: cli.downloaders,
            pool_size: cli.pool_size,
            max_retries: cli.max_retries,
            periodic_delay_hours: cli.periodic_delay,
            report_email: cli.report_email.clone(),
            tracker_url: config.tracker.url,
            zip_pattern: config.naming.zip_pattern,
            xml_pattern: config.naming.xml_pattern,
            tools: config.tools,
            serializer_props,
            validator_props,
            validation_resources_props,
            context_props,
        })
    }

    /// Canonical location of a downloaded archive.
    pub fn archive_path(&self, todo: &str, zip_name: &str) -> PathBuf {
        self.backup_dir.join(todo).join(zip_name)
    }

    /// Create the required `add`/`edit`/`delete` directories under the
    /// data directory.
    pub fn create_required_directories(&self) -> Result<()> {
        for todo in phenodcc_tracker::entities::todo::ALL {
            fs::create_dir_all(self.backup_dir.join(todo))?;
        }
        Ok(())
    }
}

fn readable_file(path: &Path) -> Result<PathBuf> {
    if path.is_file() && fs::File::open(path).is_ok() {
        Ok(path.to_path_buf())
    } else {
        Err(CrawlerError::UnreadableProperties(path.to_path_buf()))
    }
}

/// Extraction directory for an archive: the archive path with a
/// `.contents` suffix, treated as canonical by all downstream stages.
pub fn contents_dir(archive_path: &Path) -> PathBuf {
    let mut name = archive_path.as_os_str().to_os_string();
    name.push(".contents");
    PathBuf::from(name)
}

/// Tokenizer built from the configured patterns over the known centres.
pub fn build_tokenizer(
    settings: &Settings,
    centres: HashMap<String, i64>,
) -> Result<phenodcc_tracker::FilenameTokenizer> {
    phenodcc_tracker::FilenameTokenizer::new(&settings.zip_pattern, &settings.xml_pattern, centres)
        .map_err(|e| CrawlerError::config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_props(dir: &TempDir, text: &str) -> PathBuf {
        let path = dir.path().join("crawler.toml");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        path
    }

    #[test]
    fn minimal_properties_parse_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_props(&dir, "[tracker]\nurl = \"tracker.db\"\n");
        let config = CrawlerConfig::load(&path).unwrap();
        assert_eq!(config.tracker.url, "tracker.db");
        assert_eq!(config.naming.zip_pattern, DEFAULT_ZIP_PATTERN);
        assert!(config.tools.serializer.is_none());
    }

    #[test]
    fn tool_paths_are_optional_sections() {
        let dir = TempDir::new().unwrap();
        let path = write_props(
            &dir,
            "[tracker]\nurl = \"tracker.db\"\n\
             [tools]\noverview_builder = \"/opt/dcc/overviews.sh\"\n\
             overview_database = \"phenodcc_overviews\"\n",
        );
        let config = CrawlerConfig::load(&path).unwrap();
        assert_eq!(
            config.tools.overview_builder.as_deref(),
            Some(Path::new("/opt/dcc/overviews.sh"))
        );
        assert_eq!(
            config.tools.overview_database.as_deref(),
            Some("phenodcc_overviews")
        );
    }

    #[test]
    fn missing_properties_file_is_rejected() {
        let missing = Path::new("/nonexistent/crawler.toml");
        assert!(matches!(
            CrawlerConfig::load(missing),
            Err(CrawlerError::UnreadableProperties(_))
        ));
    }

    #[test]
    fn contents_dir_appends_suffix() {
        assert_eq!(
            contents_dir(Path::new("backup/add/ABCD_20140115_1.zip")),
            Path::new("backup/add/ABCD_20140115_1.zip.contents")
        );
    }
}
