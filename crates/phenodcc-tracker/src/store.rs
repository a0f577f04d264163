//! Tracker store
//!
//! The tracker database is the source of truth and work queue for the
//! whole pipeline. Every operation here acquires a pooled connection,
//! performs one short transaction, and releases it; workers hold ids and
//! value copies only, never open transactions across network I/O, and
//! coordinate exclusively through the claim protocol and the escalation
//! matrix.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use crate::entities::{
    phase, protocol, resource_state, status, todo, Centre, ClaimableAction, CrawlingSession,
    FileSource, SessionTask, SourceCandidate, XmlFile, ZipAction, ZipDownload, ZipFile,
};
use crate::error::{Result, TrackerError};
use crate::escalation::{self, Outcome, PhaseStatus};
use crate::tokenizer::FilenameTokens;

const SCHEMA: &str = include_str!("../schema.sql");

/// Five attempts to connect with the tracker database, waiting 5 minutes
/// before the first retry and five times longer before each subsequent
/// one. Exhausting the attempts is fatal to the process.
pub const MAX_CONNECTION_ATTEMPTS: u32 = 5;
pub const CONNECTION_RETRY_WAIT: Duration = Duration::from_secs(5 * 60);
pub const CONNECTION_RETRY_MULTIPLIER: u32 = 5;

/// Cached enumeration ids, loaded once at connect time.
#[derive(Debug)]
struct EnumIds {
    phases: HashMap<String, i64>,
    statuses: HashMap<String, i64>,
    todos: HashMap<String, i64>,
    phase_names: HashMap<i64, String>,
    status_names: HashMap<i64, String>,
    failed: i64,
}

/// Handle to the tracker database. Cheap to clone; every worker gets one.
#[derive(Clone)]
pub struct Tracker {
    pool: SqlitePool,
    enums: Arc<EnumIds>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker").finish_non_exhaustive()
    }
}

impl Tracker {
    /// Connect to the tracker database with the configured back-off.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_backoff(url, MAX_CONNECTION_ATTEMPTS, CONNECTION_RETRY_WAIT).await
    }

    /// Connect, retrying with exponential back-off. Factored out so tests
    /// can drive the retry loop with short waits.
    pub async fn connect_with_backoff(
        url: &str,
        max_attempts: u32,
        initial_wait: Duration,
    ) -> Result<Self> {
        let mut wait = initial_wait;
        for attempt in 1..=max_attempts {
            match Self::open(url).await {
                Ok(tracker) => {
                    if attempt > 1 {
                        info!(attempt, "Established connection with the tracker database");
                    }
                    return Ok(tracker);
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        error = %e,
                        "Failed to establish connection with the tracker database; \
                         will wait {}s before the next attempt",
                        wait.as_secs()
                    );
                    tokio::time::sleep(wait).await;
                    wait *= CONNECTION_RETRY_MULTIPLIER;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Final connection attempt failed");
                    return Err(TrackerError::ConnectionExhausted {
                        attempts: max_attempts,
                    });
                }
            }
        }
        Err(TrackerError::ConnectionExhausted {
            attempts: max_attempts,
        })
    }

    /// An in-memory tracker, used by tests and one-off tooling.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // A pooled in-memory database is per-connection state; keep one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::initialise(pool).await
    }

    async fn open(url: &str) -> Result<Self> {
        let options = if url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(url)?
        } else {
            SqliteConnectOptions::new().filename(url)
        }
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::initialise(pool).await
    }

    async fn initialise(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        let enums = Self::load_enums(&pool).await?;
        Ok(Self {
            pool,
            enums: Arc::new(enums),
        })
    }

    async fn load_enums(pool: &SqlitePool) -> Result<EnumIds> {
        let phases = Self::load_enum(pool, "phase", &phase::ALL).await?;
        let statuses = Self::load_enum(pool, "a_status", &status::ALL).await?;
        let todos = Self::load_enum(pool, "processing_type", &todo::ALL).await?;
        Self::load_enum(pool, "source_protocol", &protocol::ALL).await?;
        Self::load_enum(pool, "resource_state", &resource_state::ALL).await?;
        let failed = statuses[status::FAILED];
        let phase_names = phases.iter().map(|(n, id)| (*id, n.clone())).collect();
        let status_names = statuses.iter().map(|(n, id)| (*id, n.clone())).collect();
        Ok(EnumIds {
            phases,
            statuses,
            todos,
            phase_names,
            status_names,
            failed,
        })
    }

    async fn load_enum(
        pool: &SqlitePool,
        table: &'static str,
        required: &[&str],
    ) -> Result<HashMap<String, i64>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as(&format!("SELECT id, short_name FROM {table}"))
                .fetch_all(pool)
                .await?;
        let map: HashMap<String, i64> = rows.into_iter().map(|(id, name)| (name, id)).collect();
        for name in required {
            if !map.contains_key(*name) {
                return Err(TrackerError::missing_seed(table, *name));
            }
        }
        Ok(map)
    }

    pub fn phase_id(&self, name: &str) -> Result<i64> {
        self.enums
            .phases
            .get(name)
            .copied()
            .ok_or_else(|| TrackerError::missing_seed("phase", name))
    }

    pub fn status_id(&self, name: &str) -> Result<i64> {
        self.enums
            .statuses
            .get(name)
            .copied()
            .ok_or_else(|| TrackerError::missing_seed("a_status", name))
    }

    fn todo_id(&self, name: &str) -> Result<i64> {
        self.enums
            .todos
            .get(name)
            .copied()
            .ok_or_else(|| TrackerError::missing_seed("processing_type", name))
    }

    pub fn phase_name(&self, id: i64) -> &str {
        self.enums.phase_names.get(&id).map(String::as_str).unwrap_or("?")
    }

    pub fn status_name(&self, id: i64) -> &str {
        self.enums.status_names.get(&id).map(String::as_str).unwrap_or("?")
    }

    // ------------------------------------------------------------------
    // Centres and file sources
    // ------------------------------------------------------------------

    /// All active contributing centres.
    pub async fn active_centres(&self) -> Result<Vec<Centre>> {
        let centres = sqlx::query_as::<_, Centre>(
            "SELECT id, short_name, full_name, is_active FROM centre \
             WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(centres)
    }

    /// Map of centre short-name to id, for the filename tokenizer.
    pub async fn centre_map(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT short_name, id FROM centre")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Available file sources owned by a centre, with protocol resolved.
    pub async fn file_sources(&self, centre_id: i64) -> Result<Vec<FileSource>> {
        let sources = sqlx::query_as::<_, FileSource>(
            "SELECT fs.id, fs.centre_id, sp.short_name AS protocol, fs.hostname, \
                    fs.base_path, fs.username, fs.accesskey \
             FROM file_source fs \
             JOIN source_protocol sp ON sp.id = fs.protocol_id \
             JOIN resource_state rs ON rs.id = fs.state_id \
             WHERE fs.centre_id = ? AND rs.short_name = ? \
             ORDER BY fs.id",
        )
        .bind(centre_id)
        .bind(resource_state::AVAILABLE)
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    /// Provision a contributing centre. Enumeration-like rows are seeded
    /// by operators, not by the pipeline; this exists for provisioning
    /// tooling and tests.
    pub async fn add_centre(&self, short_name: &str, full_name: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO centre (short_name, full_name, is_active) VALUES (?, ?, 1)",
        )
        .bind(short_name)
        .bind(full_name)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Provision an available file source for a centre.
    pub async fn add_file_source(
        &self,
        centre_id: i64,
        protocol: &str,
        hostname: &str,
        base_path: &str,
        username: &str,
        accesskey: &str,
    ) -> Result<i64> {
        let protocol_id: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM source_protocol WHERE short_name = ?")
                .bind(protocol)
                .fetch_optional(&self.pool)
                .await?;
        let (protocol_id,) =
            protocol_id.ok_or_else(|| TrackerError::missing_seed("source_protocol", protocol))?;
        let result = sqlx::query(
            "INSERT INTO file_source \
             (centre_id, protocol_id, hostname, base_path, username, accesskey, state_id) \
             SELECT ?, ?, ?, ?, ?, ?, id FROM resource_state WHERE short_name = ?",
        )
        .bind(centre_id)
        .bind(protocol_id)
        .bind(hostname)
        .bind(base_path)
        .bind(username)
        .bind(accesskey)
        .bind(resource_state::AVAILABLE)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    // ------------------------------------------------------------------
    // Discovery get-or-create
    // ------------------------------------------------------------------

    /// Idempotent under concurrent discoverers: the unique filename
    /// constraint absorbs the race and every caller observes the same
    /// row. A tokenizer miss still creates the row, with null
    /// centre/date/increment, so the naming failure can be recorded.
    pub async fn get_or_create_zip_file(
        &self,
        file_name: &str,
        tokens: Option<&FilenameTokens>,
        size_bytes: i64,
    ) -> Result<ZipFile> {
        sqlx::query(
            "INSERT OR IGNORE INTO zip_file (file_name, centre_id, created, inc, size_bytes) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(file_name)
        .bind(tokens.map(|t| t.centre_id))
        .bind(tokens.map(|t| t.created))
        .bind(tokens.map(|t| t.inc))
        .bind(size_bytes)
        .execute(&self.pool)
        .await?;

        let zip = sqlx::query_as::<_, ZipFile>(
            "SELECT id, file_name, centre_id, created, inc, size_bytes \
             FROM zip_file WHERE file_name = ?",
        )
        .bind(file_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(zip)
    }

    /// Created in phase `zip_name`/`running`; unique per (zip, todo).
    pub async fn get_or_create_zip_action(&self, zip_id: i64, todo: &str) -> Result<ZipAction> {
        let todo_id = self.todo_id(todo)?;
        let phase_id = self.phase_id(phase::ZIP_NAME)?;
        let status_id = self.status_id(status::RUNNING)?;
        sqlx::query(
            "INSERT OR IGNORE INTO zip_action (zip_id, todo_id, phase_id, status_id, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(zip_id)
        .bind(todo_id)
        .bind(phase_id)
        .bind(status_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let action = sqlx::query_as::<_, ZipAction>(
            "SELECT id, zip_id, todo_id, phase_id, status_id \
             FROM zip_action WHERE zip_id = ? AND todo_id = ?",
        )
        .bind(zip_id)
        .bind(todo_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(action)
    }

    /// Record that a file source hosts this action's archive.
    pub async fn get_or_create_source_has_zip(&self, source_id: i64, za_id: i64) -> Result<i64> {
        sqlx::query(
            "INSERT OR IGNORE INTO file_source_has_zip (file_source_id, za_id, rating) \
             VALUES (?, ?, 0)",
        )
        .bind(source_id)
        .bind(za_id)
        .execute(&self.pool)
        .await?;

        let (id,): (i64,) = sqlx::query_as(
            "SELECT id FROM file_source_has_zip WHERE file_source_id = ? AND za_id = ?",
        )
        .bind(source_id)
        .bind(za_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Phase/status updates and escalation
    // ------------------------------------------------------------------

    pub async fn set_zip_action_phase_status(
        &self,
        za_id: i64,
        phase: &str,
        status: &str,
    ) -> Result<()> {
        let proposed = self.pair(phase, status)?;
        let mut tx = self.pool.begin().await?;
        self.apply_pair(&mut tx, "zip_action", za_id, proposed).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Update a download and escalate the pair up to its action.
    pub async fn set_zip_download_phase_status(
        &self,
        download_id: i64,
        phase: &str,
        status: &str,
    ) -> Result<()> {
        let proposed = self.pair(phase, status)?;
        let mut tx = self.pool.begin().await?;
        self.apply_pair(&mut tx, "zip_download", download_id, proposed)
            .await?;
        if let Some(za_id) = Self::action_of_download(&mut tx, download_id).await? {
            self.apply_pair(&mut tx, "zip_action", za_id, proposed).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Update a document and escalate through its download to its action.
    pub async fn set_xml_file_phase_status(
        &self,
        xml_id: i64,
        phase: &str,
        status: &str,
    ) -> Result<()> {
        let proposed = self.pair(phase, status)?;
        let mut tx = self.pool.begin().await?;
        self.apply_pair(&mut tx, "xml_file", xml_id, proposed).await?;
        sqlx::query("UPDATE xml_file SET last_update = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(xml_id)
            .execute(&mut *tx)
            .await?;
        let download_id: Option<(i64,)> =
            sqlx::query_as("SELECT zip_download_id FROM xml_file WHERE id = ?")
                .bind(xml_id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some((download_id,)) = download_id {
            self.apply_pair(&mut tx, "zip_download", download_id, proposed)
                .await?;
            if let Some(za_id) = Self::action_of_download(&mut tx, download_id).await? {
                self.apply_pair(&mut tx, "zip_action", za_id, proposed).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    fn pair(&self, phase: &str, status: &str) -> Result<PhaseStatus> {
        Ok(PhaseStatus::new(self.phase_id(phase)?, self.status_id(status)?))
    }

    async fn action_of_download(
        tx: &mut Transaction<'_, Sqlite>,
        download_id: i64,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT fsz.za_id FROM zip_download zd \
             JOIN file_source_has_zip fsz ON fsz.id = zd.fsz_id \
             WHERE zd.id = ?",
        )
        .bind(download_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Read-resolve-write one row inside the caller's transaction. The
    /// matrix decides whether the proposed pair may replace the stored
    /// one; a missing row is logged and skipped, matching the tracker's
    /// mark-and-continue policy.
    async fn apply_pair(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        table: &'static str,
        id: i64,
        proposed: PhaseStatus,
    ) -> Result<()> {
        let row: Option<(i64, i64)> = sqlx::query_as(&format!(
            "SELECT phase_id, status_id FROM {table} WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        let Some((phase_id, status_id)) = row else {
            warn!(table, id, "No row to update phase/status on");
            return Ok(());
        };
        let current = PhaseStatus::new(phase_id, status_id);
        let outcome = escalation::resolve(current, proposed, self.enums.failed);
        if outcome == Outcome::Ignore {
            return Ok(());
        }
        let next = escalation::apply(current, proposed, outcome);
        debug!(
            table,
            id,
            from = %format!("{}/{}", self.phase_name(current.phase), self.status_name(current.status)),
            to = %format!("{}/{}", self.phase_name(next.phase), self.status_name(next.status)),
            "Phase/status update"
        );
        sqlx::query(&format!(
            "UPDATE {table} SET phase_id = ?, status_id = ? WHERE id = ?"
        ))
        .bind(next.phase)
        .bind(next.status)
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Download claims and progress
    // ------------------------------------------------------------------

    /// Any action currently claimable by a downloader, joined with the
    /// fields needed to build paths and rate sources.
    pub async fn claimable_zip_action(&self) -> Result<Option<ClaimableAction>> {
        let action = sqlx::query_as::<_, ClaimableAction>(
            "SELECT za.id, za.zip_id, z.file_name AS zip_name, pt.short_name AS todo, \
                    z.centre_id AS producer_centre_id, z.size_bytes \
             FROM zip_action za \
             JOIN zip_file z ON z.id = za.zip_id \
             JOIN processing_type pt ON pt.id = za.todo_id \
             WHERE za.phase_id = ? AND za.status_id = ? \
             ORDER BY za.id LIMIT 1",
        )
        .bind(self.phase_id(phase::ZIP_NAME)?)
        .bind(self.status_id(status::DONE)?)
        .fetch_optional(&self.pool)
        .await?;
        Ok(action)
    }

    /// Atomically claim a download job. The conditional update ensures
    /// at most one of any number of concurrent callers observes `true`
    /// while the action sits in (`zip_name`, `done`).
    pub async fn take_download_job(&self, za_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE zip_action SET phase_id = ?, status_id = ? \
             WHERE id = ? AND phase_id = ? AND status_id = ?",
        )
        .bind(self.phase_id(phase::DOWNLOAD)?)
        .bind(self.status_id(status::RUNNING)?)
        .bind(za_id)
        .bind(self.phase_id(phase::ZIP_NAME)?)
        .bind(self.status_id(status::DONE)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Candidate sources hosting this action's archive.
    pub async fn source_candidates(&self, za_id: i64) -> Result<Vec<SourceCandidate>> {
        let candidates = sqlx::query_as::<_, SourceCandidate>(
            "SELECT fsz.id AS fsz_id, fs.id AS source_id, fs.centre_id AS source_centre_id, \
                    sp.short_name AS protocol, fs.hostname, fs.base_path, fs.username, \
                    fs.accesskey, z.centre_id AS producer_centre_id, fsz.rating \
             FROM file_source_has_zip fsz \
             JOIN file_source fs ON fs.id = fsz.file_source_id \
             JOIN source_protocol sp ON sp.id = fs.protocol_id \
             JOIN zip_action za ON za.id = fsz.za_id \
             JOIN zip_file z ON z.id = za.zip_id \
             WHERE fsz.za_id = ?",
        )
        .bind(za_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(candidates)
    }

    /// Persist a computed rating on the hosting relation.
    pub async fn set_source_rating(&self, fsz_id: i64, rating: i64) -> Result<()> {
        sqlx::query("UPDATE file_source_has_zip SET rating = ? WHERE id = ?")
            .bind(rating)
            .bind(fsz_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Open a download attempt row at (`download`, `running`).
    pub async fn download_begins(&self, fsz_id: i64) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO zip_download \
             (fsz_id, started_at, received_at, downloaded_size_bytes, phase_id, status_id) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(fsz_id)
        .bind(now)
        .bind(now)
        .bind(self.phase_id(phase::DOWNLOAD)?)
        .bind(self.status_id(status::RUNNING)?)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Mark a completed transfer and escalate to the action.
    pub async fn download_done(&self, download_id: i64) -> Result<()> {
        self.finish_download(download_id, status::DONE).await
    }

    /// Mark a failed transfer and escalate to the action.
    pub async fn download_failed(&self, download_id: i64) -> Result<()> {
        self.finish_download(download_id, status::FAILED).await
    }

    async fn finish_download(&self, download_id: i64, status_name: &str) -> Result<()> {
        let status_id = self.status_id(status_name)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE zip_download SET status_id = ?, received_at = ? WHERE id = ?")
            .bind(status_id)
            .bind(Utc::now())
            .bind(download_id)
            .execute(&mut *tx)
            .await?;
        // The transfer outcome is authoritative for the action: a retry
        // that eventually succeeds clears the failed status left by the
        // earlier attempts, so the status is written directly instead of
        // escalated.
        if let Some(za_id) = Self::action_of_download(&mut tx, download_id).await? {
            sqlx::query("UPDATE zip_action SET status_id = ? WHERE id = ?")
                .bind(status_id)
                .bind(za_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Progress update from the meter; bytes and last-received time.
    pub async fn set_download_progress(&self, download_id: i64, byte_count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE zip_download SET downloaded_size_bytes = ?, received_at = ? WHERE id = ?",
        )
        .bind(byte_count)
        .bind(Utc::now())
        .bind(download_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn zip_download(&self, download_id: i64) -> Result<ZipDownload> {
        let download = sqlx::query_as::<_, ZipDownload>(
            "SELECT id, fsz_id, started_at, received_at, downloaded_size_bytes, \
                    phase_id, status_id \
             FROM zip_download WHERE id = ?",
        )
        .bind(download_id)
        .fetch_optional(&self.pool)
        .await?;
        download.ok_or(TrackerError::RowMissing {
            entity: "zip_download",
            id: download_id,
        })
    }

    /// Archive name and todo of the action behind a download, for
    /// rebuilding the canonical local paths.
    pub async fn download_location(&self, download_id: i64) -> Result<(String, String)> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT z.file_name, pt.short_name \
             FROM zip_download zd \
             JOIN file_source_has_zip fsz ON fsz.id = zd.fsz_id \
             JOIN zip_action za ON za.id = fsz.za_id \
             JOIN zip_file z ON z.id = za.zip_id \
             JOIN processing_type pt ON pt.id = za.todo_id \
             WHERE zd.id = ?",
        )
        .bind(download_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(TrackerError::RowMissing {
            entity: "zip_download",
            id: download_id,
        })
    }

    /// Every download attempt recorded against an action, oldest first.
    pub async fn downloads_for_action(&self, za_id: i64) -> Result<Vec<ZipDownload>> {
        let downloads = sqlx::query_as::<_, ZipDownload>(
            "SELECT zd.id, zd.fsz_id, zd.started_at, zd.received_at, \
                    zd.downloaded_size_bytes, zd.phase_id, zd.status_id \
             FROM zip_download zd \
             JOIN file_source_has_zip fsz ON fsz.id = zd.fsz_id \
             WHERE fsz.za_id = ? ORDER BY zd.id",
        )
        .bind(za_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(downloads)
    }

    /// Documents extracted from a download, oldest first.
    pub async fn xml_files_of_download(&self, download_id: i64) -> Result<Vec<XmlFile>> {
        let files = sqlx::query_as::<_, XmlFile>(
            "SELECT id, zip_download_id, fname, centre_id, created, inc, size_bytes, \
                    last_update, phase_id, status_id \
             FROM xml_file WHERE zip_download_id = ? ORDER BY id",
        )
        .bind(download_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    pub async fn zip_action(&self, za_id: i64) -> Result<ZipAction> {
        let action = sqlx::query_as::<_, ZipAction>(
            "SELECT id, zip_id, todo_id, phase_id, status_id FROM zip_action WHERE id = ?",
        )
        .bind(za_id)
        .fetch_optional(&self.pool)
        .await?;
        action.ok_or(TrackerError::RowMissing {
            entity: "zip_action",
            id: za_id,
        })
    }

    // ------------------------------------------------------------------
    // Inner documents
    // ------------------------------------------------------------------

    /// Created at (`xml_name`, `running`); unique per (download, name).
    pub async fn get_or_create_xml_file(
        &self,
        download_id: i64,
        fname: &str,
        tokens: Option<&FilenameTokens>,
        size_bytes: i64,
    ) -> Result<XmlFile> {
        sqlx::query(
            "INSERT OR IGNORE INTO xml_file \
             (zip_download_id, fname, centre_id, created, inc, size_bytes, last_update, \
              phase_id, status_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(download_id)
        .bind(fname)
        .bind(tokens.map(|t| t.centre_id))
        .bind(tokens.map(|t| t.created))
        .bind(tokens.map(|t| t.inc))
        .bind(size_bytes)
        .bind(Utc::now())
        .bind(self.phase_id(phase::XML_NAME)?)
        .bind(self.status_id(status::RUNNING)?)
        .execute(&self.pool)
        .await?;

        let xml = sqlx::query_as::<_, XmlFile>(
            "SELECT id, zip_download_id, fname, centre_id, created, inc, size_bytes, \
                    last_update, phase_id, status_id \
             FROM xml_file WHERE zip_download_id = ? AND fname = ?",
        )
        .bind(download_id)
        .bind(fname)
        .fetch_one(&self.pool)
        .await?;
        Ok(xml)
    }

    pub async fn xml_file(&self, xml_id: i64) -> Result<XmlFile> {
        let xml = sqlx::query_as::<_, XmlFile>(
            "SELECT id, zip_download_id, fname, centre_id, created, inc, size_bytes, \
                    last_update, phase_id, status_id \
             FROM xml_file WHERE id = ?",
        )
        .bind(xml_id)
        .fetch_optional(&self.pool)
        .await?;
        xml.ok_or(TrackerError::RowMissing {
            entity: "xml_file",
            id: xml_id,
        })
    }

    /// Documents in a (phase, status) whose name matches a LIKE pattern,
    /// in ascending created order. The post-ingest driver relies on this
    /// ordering to preserve the contributor's intended sequence.
    pub async fn xml_files_by_phase_status_like(
        &self,
        phase: &str,
        status: &str,
        pattern: &str,
    ) -> Result<Vec<XmlFile>> {
        let files = sqlx::query_as::<_, XmlFile>(
            "SELECT id, zip_download_id, fname, centre_id, created, inc, size_bytes, \
                    last_update, phase_id, status_id \
             FROM xml_file \
             WHERE phase_id = ? AND status_id = ? AND fname LIKE ? \
             ORDER BY created ASC, id ASC",
        )
        .bind(self.phase_id(phase)?)
        .bind(self.status_id(status)?)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    // ------------------------------------------------------------------
    // Error logs
    // ------------------------------------------------------------------

    async fn intern_exception(&self, short_name: &str) -> Result<i64> {
        sqlx::query("INSERT OR IGNORE INTO an_exception (short_name) VALUES (?)")
            .bind(short_name)
            .execute(&self.pool)
            .await?;
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM an_exception WHERE short_name = ?")
            .bind(short_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn add_zip_log(
        &self,
        download_id: i64,
        exception: &str,
        message: &str,
    ) -> Result<()> {
        let exception_id = self.intern_exception(exception).await?;
        sqlx::query(
            "INSERT INTO zip_log (zip_download_id, exception_id, message, logged_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(download_id)
        .bind(exception_id)
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_xml_log(
        &self,
        xml_id: i64,
        exception: &str,
        message: &str,
        line: Option<i64>,
        column: Option<i64>,
    ) -> Result<()> {
        let exception_id = self.intern_exception(exception).await?;
        sqlx::query(
            "INSERT INTO xml_log \
             (xml_file_id, exception_id, message, line_number, column_number, logged_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(xml_id)
        .bind(exception_id)
        .bind(message)
        .bind(line)
        .bind(column)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count of error annotations on a document, used by tests and the
    /// session report.
    pub async fn xml_log_count(&self, xml_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM xml_log WHERE xml_file_id = ?")
                .bind(xml_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Count of error annotations on a download attempt.
    pub async fn zip_log_count(&self, download_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM zip_log WHERE zip_download_id = ?")
                .bind(download_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Sessions and session tasks
    // ------------------------------------------------------------------

    pub async fn begin_session(&self) -> Result<i64> {
        let result = sqlx::query("INSERT INTO crawling_session (started_at) VALUES (?)")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn finish_session(&self, session_id: i64, session_status: i64) -> Result<()> {
        sqlx::query("UPDATE crawling_session SET finished_at = ?, status = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(session_status)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn session(&self, session_id: i64) -> Result<CrawlingSession> {
        let session = sqlx::query_as::<_, CrawlingSession>(
            "SELECT id, started_at, finished_at, status FROM crawling_session WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        session.ok_or(TrackerError::RowMissing {
            entity: "crawling_session",
            id: session_id,
        })
    }

    pub async fn begin_session_task(
        &self,
        session_id: i64,
        phase: &str,
        comment: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO session_task (session_id, phase_id, comment, started_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(self.phase_id(phase)?)
        .bind(comment)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn finish_session_task(&self, task_id: i64, exit_status: i64) -> Result<()> {
        sqlx::query("UPDATE session_task SET finished_at = ?, exit_status = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(exit_status)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn session_tasks(&self, session_id: i64) -> Result<Vec<SessionTask>> {
        let tasks = sqlx::query_as::<_, SessionTask>(
            "SELECT id, session_id, phase_id, comment, started_at, finished_at, exit_status \
             FROM session_task WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::TokenKind;
    use chrono::NaiveDate;

    async fn tracker() -> Tracker {
        Tracker::in_memory().await.unwrap()
    }

    async fn seed_centre(t: &Tracker, short: &str) -> i64 {
        sqlx::query("INSERT INTO centre (short_name, full_name, is_active) VALUES (?, ?, 1)")
            .bind(short)
            .bind(format!("{short} Research Centre"))
            .execute(&t.pool)
            .await
            .unwrap()
            .last_insert_rowid()
    }

    async fn seed_source(t: &Tracker, centre_id: i64, host: &str) -> i64 {
        sqlx::query(
            "INSERT INTO file_source \
             (centre_id, protocol_id, hostname, base_path, username, accesskey, state_id) \
             VALUES (?, 1, ?, '/impc/', 'anonymous', 'secret', 1)",
        )
        .bind(centre_id)
        .bind(host)
        .execute(&t.pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    fn zip_tokens(centre_id: i64) -> FilenameTokens {
        FilenameTokens {
            centre_id,
            created: NaiveDate::from_ymd_opt(2014, 1, 15).unwrap(),
            inc: 1,
            kind: TokenKind::Zip,
        }
    }

    #[tokio::test]
    async fn seeds_are_present_and_ordered() {
        let t = tracker().await;
        assert!(t.phase_id(phase::DOWNLOAD).unwrap() < t.phase_id(phase::ZIP_NAME).unwrap());
        assert!(t.phase_id(phase::XSD).unwrap() < t.phase_id(phase::UPLOAD).unwrap());
        assert!(t.status_id(status::RUNNING).unwrap() < t.status_id(status::FAILED).unwrap());
    }

    #[tokio::test]
    async fn zip_file_get_or_create_is_idempotent() {
        let t = tracker().await;
        let centre = seed_centre(&t, "ABCD").await;
        let tokens = zip_tokens(centre);
        let a = t
            .get_or_create_zip_file("ABCD_20140115_1.zip", Some(&tokens), 1024)
            .await
            .unwrap();
        let b = t
            .get_or_create_zip_file("ABCD_20140115_1.zip", Some(&tokens), 1024)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.centre_id, Some(centre));
    }

    #[tokio::test]
    async fn zip_action_unique_per_zip_and_todo() {
        let t = tracker().await;
        let centre = seed_centre(&t, "ABCD").await;
        let tokens = zip_tokens(centre);
        let zip = t
            .get_or_create_zip_file("ABCD_20140115_1.zip", Some(&tokens), 0)
            .await
            .unwrap();
        let a = t.get_or_create_zip_action(zip.id, todo::ADD).await.unwrap();
        let b = t.get_or_create_zip_action(zip.id, todo::ADD).await.unwrap();
        let c = t.get_or_create_zip_action(zip.id, todo::EDIT).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn take_download_job_claims_exactly_once() {
        let t = tracker().await;
        let centre = seed_centre(&t, "ABCD").await;
        let tokens = zip_tokens(centre);
        let zip = t
            .get_or_create_zip_file("ABCD_20140115_1.zip", Some(&tokens), 0)
            .await
            .unwrap();
        let action = t.get_or_create_zip_action(zip.id, todo::ADD).await.unwrap();
        t.set_zip_action_phase_status(action.id, phase::ZIP_NAME, status::DONE)
            .await
            .unwrap();

        let mut claimed = 0;
        for _ in 0..4 {
            if t.take_download_job(action.id).await.unwrap() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);

        let row = t.zip_action(action.id).await.unwrap();
        assert_eq!(row.phase_id, t.phase_id(phase::DOWNLOAD).unwrap());
        assert_eq!(row.status_id, t.status_id(status::RUNNING).unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_yield_a_single_winner() {
        let t = tracker().await;
        let centre = seed_centre(&t, "ABCD").await;
        let tokens = zip_tokens(centre);
        let zip = t
            .get_or_create_zip_file("ABCD_20140115_1.zip", Some(&tokens), 0)
            .await
            .unwrap();
        let action = t.get_or_create_zip_action(zip.id, todo::ADD).await.unwrap();
        t.set_zip_action_phase_status(action.id, phase::ZIP_NAME, status::DONE)
            .await
            .unwrap();

        let mut claims = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let t = t.clone();
            let id = action.id;
            claims.spawn(async move { t.take_download_job(id).await.unwrap() });
        }
        let mut winners = 0;
        while let Some(result) = claims.join_next().await {
            if result.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn escalation_walks_the_whole_chain() {
        let t = tracker().await;
        let centre = seed_centre(&t, "ABCD").await;
        let source = seed_source(&t, centre, "ftp.abcd.org").await;
        let tokens = zip_tokens(centre);
        let zip = t
            .get_or_create_zip_file("ABCD_20140115_1.zip", Some(&tokens), 0)
            .await
            .unwrap();
        let action = t.get_or_create_zip_action(zip.id, todo::ADD).await.unwrap();
        t.set_zip_action_phase_status(action.id, phase::ZIP_NAME, status::DONE)
            .await
            .unwrap();
        assert!(t.take_download_job(action.id).await.unwrap());
        let fsz = t
            .get_or_create_source_has_zip(source, action.id)
            .await
            .unwrap();
        let dl = t.download_begins(fsz).await.unwrap();
        t.download_done(dl).await.unwrap();

        let xml = t
            .get_or_create_xml_file(dl, "ABCD_20140115_1_specimen.xml", None, 64)
            .await
            .unwrap();
        t.set_xml_file_phase_status(xml.id, phase::XSD, status::FAILED)
            .await
            .unwrap();

        let failed = t.status_id(status::FAILED).unwrap();
        let xsd = t.phase_id(phase::XSD).unwrap();
        assert_eq!(t.xml_file(xml.id).await.unwrap().status_id, failed);
        let download = t.zip_download(dl).await.unwrap();
        assert_eq!((download.phase_id, download.status_id), (xsd, failed));
        let action = t.zip_action(action.id).await.unwrap();
        assert_eq!((action.phase_id, action.status_id), (xsd, failed));
    }

    #[tokio::test]
    async fn earliest_failure_is_preserved_across_documents() {
        let t = tracker().await;
        let centre = seed_centre(&t, "ABCD").await;
        let source = seed_source(&t, centre, "ftp.abcd.org").await;
        let tokens = zip_tokens(centre);
        let zip = t
            .get_or_create_zip_file("ABCD_20140115_1.zip", Some(&tokens), 0)
            .await
            .unwrap();
        let action = t.get_or_create_zip_action(zip.id, todo::ADD).await.unwrap();
        let fsz = t
            .get_or_create_source_has_zip(source, action.id)
            .await
            .unwrap();
        let dl = t.download_begins(fsz).await.unwrap();

        let first = t
            .get_or_create_xml_file(dl, "ABCD_20140115_1_specimen.xml", None, 0)
            .await
            .unwrap();
        let second = t
            .get_or_create_xml_file(dl, "ABCD_20140115_2_specimen.xml", None, 0)
            .await
            .unwrap();
        t.set_xml_file_phase_status(first.id, phase::XSD, status::FAILED)
            .await
            .unwrap();
        t.set_xml_file_phase_status(second.id, phase::DATA, status::FAILED)
            .await
            .unwrap();

        let download = t.zip_download(dl).await.unwrap();
        assert_eq!(download.phase_id, t.phase_id(phase::XSD).unwrap());
        assert_eq!(download.status_id, t.status_id(status::FAILED).unwrap());
    }

    #[tokio::test]
    async fn exception_names_are_interned_once() {
        let t = tracker().await;
        let a = t.intern_exception("TransportError").await.unwrap();
        let b = t.intern_exception("TransportError").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn session_lifecycle_round_trips() {
        let t = tracker().await;
        let session = t.begin_session().await.unwrap();
        let task = t
            .begin_session_task(session, phase::UPLOAD, "XML file: a.xml")
            .await
            .unwrap();
        t.finish_session_task(task, 0).await.unwrap();
        t.finish_session(session, crate::entities::SESSION_SUCCESS)
            .await
            .unwrap();

        let row = t.session(session).await.unwrap();
        assert_eq!(row.status, Some(crate::entities::SESSION_SUCCESS));
        assert!(row.finished_at.is_some());
        let tasks = t.session_tasks(session).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].exit_status, Some(0));
    }

    #[tokio::test]
    async fn post_ingest_ordering_is_by_created_then_id() {
        let t = tracker().await;
        let centre = seed_centre(&t, "ABCD").await;
        let source = seed_source(&t, centre, "ftp.abcd.org").await;
        let tokens = zip_tokens(centre);
        let zip = t
            .get_or_create_zip_file("ABCD_20140115_1.zip", Some(&tokens), 0)
            .await
            .unwrap();
        let action = t.get_or_create_zip_action(zip.id, todo::ADD).await.unwrap();
        let fsz = t
            .get_or_create_source_has_zip(source, action.id)
            .await
            .unwrap();
        let dl = t.download_begins(fsz).await.unwrap();

        let later = FilenameTokens {
            created: NaiveDate::from_ymd_opt(2014, 2, 1).unwrap(),
            ..zip_tokens(centre)
        };
        let earlier = FilenameTokens {
            created: NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            ..zip_tokens(centre)
        };
        let b = t
            .get_or_create_xml_file(dl, "ABCD_20140201_1_specimen.xml", Some(&later), 0)
            .await
            .unwrap();
        let a = t
            .get_or_create_xml_file(dl, "ABCD_20140101_1_specimen.xml", Some(&earlier), 0)
            .await
            .unwrap();
        for id in [a.id, b.id] {
            t.set_xml_file_phase_status(id, phase::XSD, status::DONE)
                .await
                .unwrap();
        }

        let files = t
            .xml_files_by_phase_status_like(phase::XSD, status::DONE, "%specimen%")
            .await
            .unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.fname.as_str()).collect();
        assert_eq!(
            names,
            vec!["ABCD_20140101_1_specimen.xml", "ABCD_20140201_1_specimen.xml"]
        );
    }
}
