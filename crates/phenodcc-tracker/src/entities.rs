//! Row types and enumeration short-names for the tracker schema
//!
//! Workers hold ids and plain value copies only; every navigation between
//! entities goes back through the [`Tracker`](crate::store::Tracker).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Pipeline phase short-names; ids follow this temporal order.
pub mod phase {
    pub const DOWNLOAD: &str = "download";
    pub const ZIP_NAME: &str = "zip_name";
    pub const ZIP_MD5: &str = "zip_md5";
    pub const UNZIP: &str = "unzip";
    pub const XML_NAME: &str = "xml_name";
    pub const XSD: &str = "xsd";
    pub const UPLOAD: &str = "upload";
    pub const DATA: &str = "data";
    pub const CONTEXT: &str = "context";
    pub const OVERVIEW: &str = "overview";
    pub const QC: &str = "qc";

    pub const ALL: [&str; 11] = [
        DOWNLOAD, ZIP_NAME, ZIP_MD5, UNZIP, XML_NAME, XSD, UPLOAD, DATA, CONTEXT, OVERVIEW, QC,
    ];
}

/// Status short-names; ids follow this severity order.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const DONE: &str = "done";
    pub const CANCELLED: &str = "cancelled";
    pub const FAILED: &str = "failed";

    pub const ALL: [&str; 5] = [PENDING, RUNNING, DONE, CANCELLED, FAILED];
}

/// Processing types, named after the directory the archive was found in.
pub mod todo {
    pub const ADD: &str = "add";
    pub const EDIT: &str = "edit";
    pub const DELETE: &str = "delete";

    pub const ALL: [&str; 3] = [ADD, EDIT, DELETE];
}

pub mod protocol {
    pub const FTP: &str = "ftp";
    pub const SFTP: &str = "sftp";
    pub const HTTP: &str = "http";

    pub const ALL: [&str; 3] = [FTP, SFTP, HTTP];
}

pub mod resource_state {
    pub const AVAILABLE: &str = "available";
    pub const MAINTENANCE: &str = "maintenance";
    pub const REMOVED: &str = "removed";

    pub const ALL: [&str; 3] = [AVAILABLE, MAINTENANCE, REMOVED];
}

/// A data-producing institution.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Centre {
    pub id: i64,
    pub short_name: String,
    pub full_name: String,
    pub is_active: bool,
}

/// A remote endpoint hosting a centre's archives, joined with its
/// protocol short-name so workers can dispatch a driver without a
/// second lookup.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileSource {
    pub id: i64,
    pub centre_id: i64,
    pub protocol: String,
    pub hostname: String,
    pub base_path: String,
    pub username: String,
    pub accesskey: String,
}

/// A named archive ever seen on any source. Unique by filename.
#[derive(Debug, Clone, FromRow)]
pub struct ZipFile {
    pub id: i64,
    pub file_name: String,
    pub centre_id: Option<i64>,
    pub created: Option<NaiveDate>,
    pub inc: Option<i64>,
    pub size_bytes: i64,
}

/// A (ZipFile, ProcessingType) pair carrying the current phase/status.
#[derive(Debug, Clone, FromRow)]
pub struct ZipAction {
    pub id: i64,
    pub zip_id: i64,
    pub todo_id: i64,
    pub phase_id: i64,
    pub status_id: i64,
}

/// A claimable action joined with the fields a downloader needs to build
/// local and remote paths.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimableAction {
    pub id: i64,
    pub zip_id: i64,
    pub zip_name: String,
    pub todo: String,
    pub producer_centre_id: Option<i64>,
    pub size_bytes: i64,
}

/// A candidate hosting relation joined with the source connection details
/// and the archive's producing centre, ready for rating.
#[derive(Debug, Clone, FromRow)]
pub struct SourceCandidate {
    pub fsz_id: i64,
    pub source_id: i64,
    pub source_centre_id: i64,
    pub protocol: String,
    pub hostname: String,
    pub base_path: String,
    pub username: String,
    pub accesskey: String,
    pub producer_centre_id: Option<i64>,
    pub rating: i64,
}

impl SourceCandidate {
    /// The connection-relevant view of the hosting source, for driver
    /// factories and per-worker connection caches.
    pub fn file_source(&self) -> FileSource {
        FileSource {
            id: self.source_id,
            centre_id: self.source_centre_id,
            protocol: self.protocol.clone(),
            hostname: self.hostname.clone(),
            base_path: self.base_path.clone(),
            username: self.username.clone(),
            accesskey: self.accesskey.clone(),
        }
    }
}

/// One download attempt of a FileSourceHasZip.
#[derive(Debug, Clone, FromRow)]
pub struct ZipDownload {
    pub id: i64,
    pub fsz_id: i64,
    pub started_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub downloaded_size_bytes: i64,
    pub phase_id: i64,
    pub status_id: i64,
}

/// An inner document of a downloaded archive.
#[derive(Debug, Clone, FromRow)]
pub struct XmlFile {
    pub id: i64,
    pub zip_download_id: i64,
    pub fname: String,
    pub centre_id: Option<i64>,
    pub created: Option<NaiveDate>,
    pub inc: Option<i64>,
    pub size_bytes: i64,
    pub last_update: DateTime<Utc>,
    pub phase_id: i64,
    pub status_id: i64,
}

/// One pipeline invocation.
#[derive(Debug, Clone, FromRow)]
pub struct CrawlingSession {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: Option<i64>,
}

/// One subprocess invocation inside a session.
#[derive(Debug, Clone, FromRow)]
pub struct SessionTask {
    pub id: i64,
    pub session_id: i64,
    pub phase_id: i64,
    pub comment: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_status: Option<i64>,
}

/// Session closed without any document failing at any stage.
pub const SESSION_SUCCESS: i64 = 0;
/// At least one document or tool failed during the session.
pub const SESSION_FAILURE: i64 = 1;
