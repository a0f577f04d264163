//! Session orchestration
//!
//! Every pipeline run happens inside a crawling session row: discovery
//! fully drains, then downloads and their attendant extractions fully
//! drain, then the single-threaded post-ingest stages run, and the
//! session closes with the aggregate status. With a non-zero periodic
//! delay the orchestrator re-runs on an interval whose missed ticks are
//! skipped, so a tick that finds the previous run still active never
//! piles up behind it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::config::Settings;
use crate::discovery::Discovery;
use crate::downloader::DownloadRunner;
use crate::error::Result;
use crate::extractor::{ExtractionPool, ExtractorContext};
use crate::postingest::PostIngest;
use crate::progress::spawn_progress_writer;
use crate::source::DriverFactory;
use phenodcc_tracker::{
    FilenameTokenizer, SourceRater, Tracker, SESSION_FAILURE, SESSION_SUCCESS,
};

const HOUR_SECS: u64 = 3600;

/// Owns the dependency-injected services and drives complete sessions.
pub struct SessionOrchestrator {
    tracker: Tracker,
    tokenizer: Arc<FilenameTokenizer>,
    factory: Arc<dyn DriverFactory>,
    rater: Arc<dyn SourceRater>,
    settings: Arc<Settings>,
}

impl SessionOrchestrator {
    pub fn new(
        tracker: Tracker,
        tokenizer: Arc<FilenameTokenizer>,
        factory: Arc<dyn DriverFactory>,
        rater: Arc<dyn SourceRater>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            tracker,
            tokenizer,
            factory,
            rater,
            settings,
        }
    }

    /// Run once, or periodically when a delay was configured.
    pub async fn run(&self) -> Result<()> {
        if self.settings.periodic_delay_hours > 0 {
            let period = Duration::from_secs(self.settings.periodic_delay_hours * HOUR_SECS);
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                self.run_once().await?;
            }
        } else {
            self.run_once().await?;
            info!("Application will now exit");
            Ok(())
        }
    }

    /// One complete crawling session; returns the aggregate status that
    /// was recorded on the session row.
    pub async fn run_once(&self) -> Result<i64> {
        let session_id = self.tracker.begin_session().await?;
        info!(session_id, "Crawling session started");

        Discovery::new(
            self.tracker.clone(),
            Arc::clone(&self.tokenizer),
            Arc::clone(&self.factory),
            self.settings.pool_size,
        )
        .run()
        .await?;

        let (progress, progress_writer) = spawn_progress_writer(self.tracker.clone());
        let pool = ExtractionPool::new();
        let runner = DownloadRunner {
            tracker: self.tracker.clone(),
            factory: Arc::clone(&self.factory),
            rater: Arc::clone(&self.rater),
            settings: Arc::clone(&self.settings),
            progress: progress.clone(),
            extractor: ExtractorContext {
                tracker: self.tracker.clone(),
                tokenizer: Arc::clone(&self.tokenizer),
                tools: self.settings.tools.clone(),
            },
            pool: pool.clone(),
        };
        runner.run().await?;
        pool.drain().await;

        // All meters are gone once downloads and extractions finish;
        // dropping the remaining senders lets the writer task exit.
        drop(runner);
        drop(progress);
        let _ = progress_writer.await;

        let any_failures = PostIngest::new(
            self.tracker.clone(),
            Arc::clone(&self.settings),
            session_id,
        )
        .run()
        .await?;

        let session_status = if any_failures {
            SESSION_FAILURE
        } else {
            SESSION_SUCCESS
        };
        self.tracker.finish_session(session_id, session_status).await?;

        if let Some(email) = &self.settings.report_email {
            info!(email = %email, session_id, session_status, "Send session report");
        }
        info!(session_id, session_status, "Crawling session finished");
        Ok(session_status)
    }
}
