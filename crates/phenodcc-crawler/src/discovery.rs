//! Discovery workers
//!
//! One task per (centre, file source), bounded to the configured pool
//! size. Each task connects, walks the `add`, `edit` and `delete`
//! directories under the source's base path, and populates the tracker
//! with the archives it finds. Remote listing happens on a blocking
//! thread; the tracker writes happen afterwards, so no transaction is
//! ever held across network I/O.

use std::sync::Arc;

use anyhow::Context;
use futures::stream::{self, StreamExt};
use tokio::task;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::source::{remote_dir, DriverFactory, RemoteEntry};
use phenodcc_tracker::entities::{phase, status, todo};
use phenodcc_tracker::{Centre, FileSource, FilenameTokenizer, TokenKind, Tracker};

/// Discovery stage over every active centre's available sources.
pub struct Discovery {
    tracker: Tracker,
    tokenizer: Arc<FilenameTokenizer>,
    factory: Arc<dyn DriverFactory>,
    pool_size: usize,
}

impl Discovery {
    pub fn new(
        tracker: Tracker,
        tokenizer: Arc<FilenameTokenizer>,
        factory: Arc<dyn DriverFactory>,
        pool_size: usize,
    ) -> Self {
        Self {
            tracker,
            tokenizer,
            factory,
            pool_size,
        }
    }

    /// Fan out one crawl per (centre, source) and drain the pool.
    pub async fn run(&self) -> Result<()> {
        let mut jobs: Vec<(Centre, FileSource)> = Vec::new();
        for centre in self.tracker.active_centres().await? {
            let sources = self.tracker.file_sources(centre.id).await?;
            for source in sources {
                jobs.push((centre.clone(), source));
            }
        }
        info!(sources = jobs.len(), "Starting discovery");

        stream::iter(jobs)
            .for_each_concurrent(self.pool_size, |(centre, source)| async move {
                if let Err(e) = self.crawl_source(&centre, source).await {
                    error!(error = %e, "Discovery task failed");
                }
            })
            .await;
        Ok(())
    }

    /// Crawl one source: list the three todo directories remotely, then
    /// queue every archive into the tracker.
    async fn crawl_source(&self, centre: &Centre, source: FileSource) -> Result<()> {
        debug!(
            hostname = %source.hostname,
            centre = %centre.short_name,
            "Starting crawler for file source"
        );

        let factory = Arc::clone(&self.factory);
        let listing_source = source.clone();
        let listings = task::spawn_blocking(move || list_source(&*factory, &listing_source))
            .await
            .context("Crawl listing task panicked")?;

        let listings = match listings {
            Ok(listings) => listings,
            Err(e) => {
                error!(
                    hostname = %source.hostname,
                    centre = %centre.short_name,
                    error = %e,
                    "Crawler could not establish connection with server"
                );
                return Ok(());
            }
        };

        for (todo, entries) in listings {
            for entry in entries {
                self.queue_file(&source, todo, &entry).await?;
            }
        }
        debug!(hostname = %source.hostname, "Crawling has finished");
        Ok(())
    }

    /// Register one discovered archive: the zip file row, its action for
    /// the walked directory, and the hosting relation.
    async fn queue_file(&self, source: &FileSource, todo: &str, entry: &RemoteEntry) -> Result<()> {
        let tokens = self
            .tokenizer
            .tokenize(&entry.name)
            .filter(|t| t.kind == TokenKind::Zip);
        let zip = self
            .tracker
            .get_or_create_zip_file(&entry.name, tokens.as_ref(), entry.size as i64)
            .await?;
        let action = self.tracker.get_or_create_zip_action(zip.id, todo).await?;

        if zip.centre_id.is_none() {
            error!(
                name = %zip.file_name,
                "Zip file does not conform to the naming convention"
            );
            self.tracker
                .set_zip_action_phase_status(action.id, phase::ZIP_NAME, status::FAILED)
                .await?;
        } else {
            self.tracker
                .set_zip_action_phase_status(action.id, phase::ZIP_NAME, status::DONE)
                .await?;
        }

        self.tracker
            .get_or_create_source_has_zip(source.id, action.id)
            .await?;
        Ok(())
    }
}

/// Blocking half of a crawl: connect and list each todo directory. A
/// directory that fails to list is logged and skipped; the others are
/// still walked.
fn list_source(
    factory: &dyn DriverFactory,
    source: &FileSource,
) -> crate::source::TransportResult<Vec<(&'static str, Vec<RemoteEntry>)>> {
    let mut driver = factory.connect(source)?;
    let mut listings = Vec::new();
    for todo in todo::ALL {
        let dir = remote_dir(source, todo);
        match driver.list_archives(&dir) {
            Ok(entries) => {
                debug!(dir = %dir, count = entries.len(), "Listed remote directory");
                listings.push((todo, entries));
            }
            Err(e) => {
                error!(dir = %dir, error = %e, "Failed to list remote directory");
            }
        }
    }
    driver.close();
    Ok(listings)
}
