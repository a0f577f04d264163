//! File-source drivers
//!
//! A driver is the abstract capability the pipeline needs from a remote
//! file source: list the archives in a directory, and stream one file
//! into a local sink. Drivers are synchronous (the underlying protocol
//! libraries are blocking) and always used from `spawn_blocking`
//! contexts; the factory seam lets tests substitute in-memory sources.

pub mod ftp;
pub mod sftp;

use std::io::Write;
use std::time::Duration;

use thiserror::Error;

use phenodcc_tracker::entities::protocol;
use phenodcc_tracker::FileSource;

/// Per-connection I/O timeout for newly established connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to '{host}': {message}")]
    Connect { host: String, message: String },

    #[error("Authentication with '{host}' failed: {message}")]
    Auth { host: String, message: String },

    #[error("Failed to list '{path}': {message}")]
    List { path: String, message: String },

    #[error("Failed to fetch '{path}': {message}")]
    Fetch { path: String, message: String },

    #[error("Unsupported file transfer protocol '{0}'")]
    UnsupportedProtocol(String),
}

impl TransportError {
    /// Stable short-name used when interning error-log rows.
    pub fn short_name(&self) -> &'static str {
        match self {
            TransportError::Connect { .. } => "ConnectException",
            TransportError::Auth { .. } => "AuthenticationException",
            TransportError::List { .. } => "ListException",
            TransportError::Fetch { .. } => "FetchException",
            TransportError::UnsupportedProtocol(_) => "UnsupportedProtocolException",
        }
    }
}

/// A remote directory entry that survived the `*.zip` filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
}

/// Blocking view of one live connection to a file source.
pub trait SourceDriver: Send {
    /// List the zip archives directly inside a remote directory.
    fn list_archives(&mut self, dir: &str) -> TransportResult<Vec<RemoteEntry>>;

    /// Stream a remote file into the sink.
    fn fetch(&mut self, path: &str, sink: &mut dyn Write) -> TransportResult<()>;

    /// Close the connection; errors during shutdown are ignored.
    fn close(&mut self) {}
}

/// Connection seam between workers and the transport libraries.
pub trait DriverFactory: Send + Sync {
    fn connect(&self, source: &FileSource) -> TransportResult<Box<dyn SourceDriver>>;
}

/// Production factory dispatching on the source's protocol row.
#[derive(Debug)]
pub struct StandardDriverFactory {
    pub connect_timeout: Duration,
}

impl Default for StandardDriverFactory {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl DriverFactory for StandardDriverFactory {
    fn connect(&self, source: &FileSource) -> TransportResult<Box<dyn SourceDriver>> {
        match source.protocol.as_str() {
            protocol::FTP => Ok(Box::new(ftp::FtpDriver::connect(source, self.connect_timeout)?)),
            protocol::SFTP => {
                Ok(Box::new(sftp::SftpDriver::connect(source, self.connect_timeout)?))
            }
            other => Err(TransportError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Remote directory for a processing type: `<base_path><todo>`.
pub fn remote_dir(source: &FileSource, todo: &str) -> String {
    format!("{}{}", source.base_path, todo)
}

/// Remote path of an archive: `<base_path><todo>/<name>`.
pub fn remote_path(source: &FileSource, todo: &str, name: &str) -> String {
    format!("{}{}/{}", source.base_path, todo, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(protocol: &str) -> FileSource {
        FileSource {
            id: 1,
            centre_id: 1,
            protocol: protocol.to_string(),
            hostname: "files.example.org".to_string(),
            base_path: "/impc/".to_string(),
            username: "anonymous".to_string(),
            accesskey: "secret".to_string(),
        }
    }

    #[test]
    fn http_sources_are_unsupported() {
        let factory = StandardDriverFactory::default();
        match factory.connect(&source("http")) {
            Err(TransportError::UnsupportedProtocol(p)) => assert_eq!(p, "http"),
            other => panic!("expected UnsupportedProtocol, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn remote_paths_follow_the_layout() {
        let s = source("ftp");
        assert_eq!(remote_dir(&s, "add"), "/impc/add");
        assert_eq!(
            remote_path(&s, "add", "ABCD_20140115_1.zip"),
            "/impc/add/ABCD_20140115_1.zip"
        );
    }
}
