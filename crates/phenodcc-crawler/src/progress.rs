//! Download progress metering
//!
//! Wraps the local byte sink of an in-flight transfer and reports the
//! cumulative count into the tracker whenever it crosses a 1 MiB
//! boundary, or when the declared total is reached. The meter runs on a
//! blocking transfer thread, so updates are handed over a channel to an
//! async forwarder; a tracker error is logged and swallowed and can
//! never fail the download itself.

use std::io::{self, Write};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::warn;

use phenodcc_tracker::Tracker;

pub const MEBIBYTE: u64 = 1_048_576;

#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub download_id: i64,
    pub byte_count: i64,
}

/// Forwarder task applying meter updates to the tracker.
pub fn spawn_progress_writer(
    tracker: Tracker,
) -> (UnboundedSender<ProgressUpdate>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let handle = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            if let Err(e) = tracker
                .set_download_progress(update.download_id, update.byte_count)
                .await
            {
                warn!(
                    download_id = update.download_id,
                    error = %e,
                    "Failed to record download progress"
                );
            }
        }
    });
    (tx, handle)
}

/// Byte sink wrapper that intercepts every write.
pub struct ProgressMeter<W: Write> {
    inner: W,
    download_id: i64,
    total_bytes: u64,
    bytes: u64,
    mebibytes_done: u64,
    updates: UnboundedSender<ProgressUpdate>,
}

impl<W: Write> ProgressMeter<W> {
    pub fn new(
        inner: W,
        download_id: i64,
        total_bytes: u64,
        updates: UnboundedSender<ProgressUpdate>,
    ) -> Self {
        Self {
            inner,
            download_id,
            total_bytes,
            bytes: 0,
            mebibytes_done: 0,
            updates,
        }
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes as f64 * 100.0) / self.total_bytes as f64
    }

    fn record(&mut self) {
        if self.bytes == self.total_bytes || self.bytes / MEBIBYTE > self.mebibytes_done {
            self.mebibytes_done += 1;
            let _ = self.updates.send(ProgressUpdate {
                download_id: self.download_id,
                byte_count: self.bytes as i64,
            });
        }
    }
}

impl<W: Write> Write for ProgressMeter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.bytes += written as u64;
        self.record();
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn updates_fire_on_mebibyte_boundaries_and_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let total = 2 * MEBIBYTE + 512;
        let mut meter = ProgressMeter::new(Vec::new(), 1, total, tx);

        let chunk = vec![0u8; 256 * 1024];
        let mut written = 0u64;
        while written < total {
            let n = ((total - written) as usize).min(chunk.len());
            meter.write_all(&chunk[..n]).unwrap();
            written += n as u64;
        }

        assert_eq!(meter.bytes_so_far(), total);
        assert!((meter.percent_complete() - 100.0).abs() < f64::EPSILON);

        let mut counts = Vec::new();
        while let Ok(update) = rx.try_recv() {
            assert_eq!(update.download_id, 1);
            counts.push(update.byte_count as u64);
        }
        // One update per crossed MiB boundary plus the final byte count.
        assert!(counts.contains(&total));
        assert!(counts.len() >= 2);
        assert!(counts.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn small_transfers_report_only_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut meter = ProgressMeter::new(Vec::new(), 2, 100, tx);
        meter.write_all(&[1u8; 100]).unwrap();

        let update = rx.try_recv().unwrap();
        assert_eq!(update.byte_count, 100);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_never_fails_the_write() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut meter = ProgressMeter::new(Vec::new(), 3, 10, tx);
        meter.write_all(&[0u8; 10]).unwrap();
        assert_eq!(meter.bytes_so_far(), 10);
    }
}
