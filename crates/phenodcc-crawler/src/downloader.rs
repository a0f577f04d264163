//! Download workers
//!
//! A fixed pool of workers races over claimable actions. Each worker
//! repeatedly claims an action through the tracker, rates and orders the
//! candidate sources, and attempts each source up to the configured
//! retry count, streaming the archive through the progress meter into
//! the canonical backup location. A successful download submits an
//! extraction task onto the shared extraction pool. Connections are
//! cached per worker, keyed by hostname, and closed when the worker
//! exits; caches are never shared across workers.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::extractor::{extract_archive, ExtractionJob, ExtractionPool, ExtractorContext};
use crate::progress::{ProgressMeter, ProgressUpdate};
use crate::source::{remote_path, DriverFactory, SourceDriver, TransportError, TransportResult};
use phenodcc_tracker::{sort_by_preference, ClaimableAction, FileSource, SourceCandidate, SourceRater, Tracker};

/// Per-worker cache of live connections, keyed by protocol and
/// hostname. A fetch failure evicts the connection so the next attempt
/// reconnects instead of reusing a broken stream.
pub struct ConnectionCache {
    factory: Arc<dyn DriverFactory>,
    connections: HashMap<String, Box<dyn SourceDriver>>,
}

impl ConnectionCache {
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory,
            connections: HashMap::new(),
        }
    }

    fn key(source: &FileSource) -> String {
        format!("{}://{}", source.protocol, source.hostname)
    }

    /// Ensure a live, reusable connection to the source's host.
    pub fn ensure(&mut self, source: &FileSource) -> TransportResult<()> {
        let key = Self::key(source);
        if !self.connections.contains_key(&key) {
            let driver = self.factory.connect(source)?;
            self.connections.insert(key, driver);
        }
        Ok(())
    }

    /// Stream a remote file through the cached connection.
    pub fn fetch(
        &mut self,
        source: &FileSource,
        path: &str,
        sink: &mut dyn std::io::Write,
    ) -> TransportResult<()> {
        let key = Self::key(source);
        let driver = self
            .connections
            .get_mut(&key)
            .ok_or_else(|| TransportError::Connect {
                host: source.hostname.clone(),
                message: "no cached connection".to_string(),
            })?;
        let result = driver.fetch(path, sink);
        if result.is_err() {
            if let Some(mut broken) = self.connections.remove(&key) {
                broken.close();
            }
        }
        result
    }

    /// Close every cached connection.
    pub fn close_all(&mut self) {
        for (key, mut driver) in self.connections.drain() {
            driver.close();
            debug!(connection = %key, "Downloader has disconnected");
        }
    }
}

enum Attempt {
    Success(i64),
    TransferFailed,
    ConnectFailed,
}

/// The download stage: a fixed pool of claim-and-fetch workers.
#[derive(Clone)]
pub struct DownloadRunner {
    pub tracker: Tracker,
    pub factory: Arc<dyn DriverFactory>,
    pub rater: Arc<dyn SourceRater>,
    pub settings: Arc<Settings>,
    pub progress: tokio::sync::mpsc::UnboundedSender<ProgressUpdate>,
    pub extractor: ExtractorContext,
    pub pool: ExtractionPool,
}

impl DownloadRunner {
    /// Start the configured number of workers and wait for all of them
    /// to run out of claimable work.
    pub async fn run(&self) -> Result<()> {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.settings.num_downloaders {
            let runner = self.clone();
            workers.spawn(async move { runner.worker(worker_id).await });
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Download worker failed"),
                Err(e) => error!(error = %e, "Download worker panicked"),
            }
        }
        Ok(())
    }

    async fn worker(&self, worker_id: usize) -> Result<()> {
        debug!(worker_id, "Download worker started");
        let mut cache = ConnectionCache::new(Arc::clone(&self.factory));

        loop {
            let Some(action) = self.tracker.claimable_zip_action().await? else {
                info!(worker_id, "No download pending; downloader will now exit");
                break;
            };
            if !self.tracker.take_download_job(action.id).await? {
                // Another worker grabbed it between the query and the claim.
                continue;
            }
            debug!(
                worker_id,
                zip = %action.zip_name,
                todo = %action.todo,
                "Claimed download job"
            );

            let candidates = self.tracker.source_candidates(action.id).await?;
            if candidates.is_empty() {
                error!(
                    zip = %action.zip_name,
                    todo = %action.todo,
                    "None of the file sources host this zip file"
                );
                continue;
            }
            let ordered = sort_by_preference(&*self.rater, candidates);
            for candidate in &ordered {
                if let Err(e) = self
                    .tracker
                    .set_source_rating(candidate.fsz_id, candidate.rating)
                    .await
                {
                    warn!(error = %e, "Failed to persist source rating");
                }
            }

            let mut downloaded = None;
            'sources: for candidate in ordered {
                for _ in 0..self.settings.max_retries {
                    let (returned, outcome) =
                        self.attempt(cache, &action, &candidate).await?;
                    cache = returned;
                    if let Attempt::Success(download_id) = outcome {
                        downloaded = Some(download_id);
                        break 'sources;
                    }
                }
            }

            match downloaded {
                Some(download_id) => {
                    debug!(zip = %action.zip_name, "Successfully downloaded; will now extract contents");
                    let job = ExtractionJob {
                        download_id,
                        archive_path: self.settings.archive_path(&action.todo, &action.zip_name),
                    };
                    let ctx = self.extractor.clone();
                    self.pool.submit(extract_archive(ctx, job));
                }
                None => {
                    error!(
                        zip = %action.zip_name,
                        todo = %action.todo,
                        "Failed to download from every hosting source"
                    );
                }
            }
        }

        task::spawn_blocking(move || cache.close_all())
            .await
            .context("Connection shutdown task panicked")?;
        Ok(())
    }

    /// One download attempt against one source: ensure a connection,
    /// open the attempt row, stream the file through the meter.
    async fn attempt(
        &self,
        cache: ConnectionCache,
        action: &ClaimableAction,
        candidate: &SourceCandidate,
    ) -> Result<(ConnectionCache, Attempt)> {
        let source = candidate.file_source();

        let mut cache = cache;
        let ensure_source = source.clone();
        let (returned, ensured) = task::spawn_blocking(move || {
            let result = cache.ensure(&ensure_source);
            (cache, result)
        })
        .await
        .context("Connect task panicked")?;
        cache = returned;
        if let Err(e) = ensured {
            warn!(
                zip = %action.zip_name,
                hostname = %source.hostname,
                error = %e,
                "Could not prepare connection for download"
            );
            return Ok((cache, Attempt::ConnectFailed));
        }

        let download_id = self.tracker.download_begins(candidate.fsz_id).await?;
        let remote = remote_path(&source, &action.todo, &action.zip_name);
        let dest = self.settings.archive_path(&action.todo, &action.zip_name);
        let total = action.size_bytes.max(0) as u64;
        let progress = self.progress.clone();

        let (returned, result) = task::spawn_blocking(move || {
            let result = (|| -> TransportResult<()> {
                let file = fs::File::create(&dest).map_err(|e| TransportError::Fetch {
                    path: remote.clone(),
                    message: format!("cannot create '{}': {e}", dest.display()),
                })?;
                let mut meter = ProgressMeter::new(file, download_id, total, progress);
                cache.fetch(&source, &remote, &mut meter)
            })();
            (cache, result)
        })
        .await
        .context("Transfer task panicked")?;
        cache = returned;

        match result {
            Ok(()) => {
                debug!(zip = %action.zip_name, todo = %action.todo, "Download complete");
                self.tracker.download_done(download_id).await?;
                Ok((cache, Attempt::Success(download_id)))
            }
            Err(e) => {
                error!(
                    zip = %action.zip_name,
                    hostname = %candidate.hostname,
                    error = %e,
                    "Download attempt failed"
                );
                self.tracker.download_failed(download_id).await?;
                self.tracker
                    .add_zip_log(download_id, e.short_name(), &e.to_string())
                    .await?;
                Ok((cache, Attempt::TransferFailed))
            }
        }
    }
}
