//! Extractor workers
//!
//! One task per successfully downloaded archive. The archive is
//! unpacked into `<archive>.contents/`; each conforming inner document
//! gets an XmlFile row driven through the `xml_name` and `unzip` phases,
//! and a schema-validation task on an inner pool which the extractor
//! drains before returning. Failures escalate to the download and its
//! action through the tracker.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::process::Command;
use tokio::task::{self, JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::config::{contents_dir, ToolsConfig};
use crate::error::Result;
use phenodcc_tracker::entities::{phase, status};
use phenodcc_tracker::{FilenameTokenizer, TokenKind, Tracker};

/// Shared, dynamically-sized pool of extraction tasks. Downloaders
/// submit into it as archives land; the session orchestrator drains it
/// after the download pool exits.
#[derive(Clone, Default)]
pub struct ExtractionPool {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ExtractionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(future);
        self.handles.lock().expect("extraction pool poisoned").push(handle);
    }

    /// Wait for every submitted extraction, including any submitted
    /// while draining.
    pub async fn drain(&self) {
        loop {
            let handle = self.handles.lock().expect("extraction pool poisoned").pop();
            match handle {
                Some(handle) => {
                    if let Err(e) = handle.await {
                        error!(error = %e, "Extraction task panicked");
                    }
                }
                None => break,
            }
        }
    }
}

/// Dependencies an extraction task needs.
#[derive(Clone)]
pub struct ExtractorContext {
    pub tracker: Tracker,
    pub tokenizer: Arc<FilenameTokenizer>,
    pub tools: ToolsConfig,
}

/// One extraction job, produced by a downloader.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub download_id: i64,
    pub archive_path: PathBuf,
}

/// Result of pulling one entry out of the archive on the blocking side.
/// `written` is `None` when the name failed the convention and the
/// entry's bytes were never extracted.
struct ExtractedDoc {
    name: String,
    size: u64,
    tokens: Option<phenodcc_tracker::FilenameTokens>,
    written: Option<std::result::Result<(), String>>,
}

/// Unpack one downloaded archive and validate its documents.
pub async fn extract_archive(ctx: ExtractorContext, job: ExtractionJob) {
    if let Err(e) = run(&ctx, &job).await {
        error!(
            archive = %job.archive_path.display(),
            error = %e,
            "Extraction failed with a tracker error"
        );
    }
}

async fn run(ctx: &ExtractorContext, job: &ExtractionJob) -> Result<()> {
    let tracker = &ctx.tracker;
    let contents = contents_dir(&job.archive_path);
    debug!(archive = %job.archive_path.display(), "Starting extraction");

    tracker
        .set_zip_download_phase_status(job.download_id, phase::UNZIP, status::RUNNING)
        .await?;

    if let Err(e) = fs::create_dir_all(&contents) {
        error!(
            contents = %contents.display(),
            error = %e,
            "Failed to prepare extraction directory"
        );
        tracker
            .set_zip_download_phase_status(job.download_id, phase::UNZIP, status::FAILED)
            .await?;
        return Ok(());
    }

    let archive_path = job.archive_path.clone();
    let contents_path = contents.clone();
    let tokenizer = Arc::clone(&ctx.tokenizer);
    let docs = task::spawn_blocking(move || unpack(&archive_path, &contents_path, &tokenizer))
        .await
        .context("Archive extraction task panicked")?;

    let docs = match docs {
        Ok(docs) => docs,
        Err(message) => {
            error!(archive = %job.archive_path.display(), error = %message, "Failed to decompress zip file");
            tracker
                .set_zip_download_phase_status(job.download_id, phase::UNZIP, status::FAILED)
                .await?;
            tracker
                .add_zip_log(job.download_id, "ZipException", &message)
                .await?;
            return Ok(());
        }
    };

    let mut validations = JoinSet::new();
    for doc in docs {
        let xml = tracker
            .get_or_create_xml_file(
                job.download_id,
                &doc.name,
                doc.tokens.as_ref(),
                doc.size as i64,
            )
            .await?;

        if xml.centre_id.is_none() {
            error!(
                name = %doc.name,
                "Xml file does not conform to the naming convention"
            );
            tracker
                .set_xml_file_phase_status(xml.id, phase::XML_NAME, status::FAILED)
                .await?;
            continue;
        }
        tracker
            .set_xml_file_phase_status(xml.id, phase::XML_NAME, status::DONE)
            .await?;

        tracker
            .set_xml_file_phase_status(xml.id, phase::UNZIP, status::RUNNING)
            .await?;
        match doc.written {
            Some(Ok(())) => {
                tracker
                    .set_xml_file_phase_status(xml.id, phase::UNZIP, status::DONE)
                    .await?;
                let ctx = ctx.clone();
                let document_path = contents.join(&doc.name);
                let name = doc.name.clone();
                validations
                    .spawn(async move { validate_document(ctx, xml.id, name, document_path).await });
            }
            Some(Err(message)) => {
                error!(name = %doc.name, error = %message, "Failed to extract file");
                tracker
                    .set_xml_file_phase_status(xml.id, phase::UNZIP, status::FAILED)
                    .await?;
            }
            None => {}
        }
    }

    // The inner validation pool must drain before this task returns.
    while let Some(result) = validations.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Validation task panicked");
        }
    }

    // An archive with zero valid entries still finishes extraction; the
    // matrix ignores this when a document has already moved further or
    // failed.
    tracker
        .set_zip_download_phase_status(job.download_id, phase::UNZIP, status::DONE)
        .await?;
    Ok(())
}

/// Blocking half: tokenize and write every conforming entry into the
/// extraction directory. Directories, non-xml entries and names
/// containing a path separator are skipped; entries whose name fails
/// the convention are recorded but never extracted.
fn unpack(
    archive_path: &Path,
    contents: &Path,
    tokenizer: &FilenameTokenizer,
) -> std::result::Result<Vec<ExtractedDoc>, String> {
    let file = fs::File::open(archive_path).map_err(|e| e.to_string())?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;

    let mut docs = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| e.to_string())?;
        if entry.is_dir() {
            warn!(name = %entry.name(), "Ignoring directory in zip file");
            continue;
        }
        let name = entry.name().to_string();
        if !name.ends_with(".xml") || name.contains('/') {
            continue;
        }
        let size = entry.size();
        let tokens = tokenizer.tokenize(&name).filter(|t| t.kind != TokenKind::Zip);
        let written = tokens.is_some().then(|| {
            let mut bytes = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut bytes).map_err(|e| e.to_string())?;
            fs::write(contents.join(&name), bytes).map_err(|e| e.to_string())
        });
        docs.push(ExtractedDoc {
            name,
            size,
            tokens,
            written,
        });
    }
    Ok(docs)
}

/// Validate one extracted document with the configured schema validator.
/// Issues are reported by the tool one per stdout line as
/// `line:column:message`.
async fn validate_document(ctx: ExtractorContext, xml_id: i64, name: String, path: PathBuf) {
    if let Err(e) = validate(&ctx, xml_id, &name, &path).await {
        error!(name = %name, error = %e, "Validation failed with a tracker error");
    }
}

async fn validate(ctx: &ExtractorContext, xml_id: i64, name: &str, path: &Path) -> Result<()> {
    let tracker = &ctx.tracker;
    let validator = if name.contains("experiment") {
        ctx.tools.experiment_validator.as_ref()
    } else {
        ctx.tools.specimen_validator.as_ref()
    };
    let Some(validator) = validator else {
        warn!(
            document = %name,
            "Skipping schema validation: no validator tool configured"
        );
        return Ok(());
    };

    debug!(document = %path.display(), "Starting validation");
    tracker
        .set_xml_file_phase_status(xml_id, phase::XSD, status::RUNNING)
        .await?;

    let output = match Command::new(validator).arg(path).output().await {
        Ok(output) => output,
        Err(e) => {
            error!(document = %name, error = %e, "Could not launch schema validator");
            tracker
                .add_xml_log(xml_id, "ValidatorLaunchException", &e.to_string(), None, None)
                .await?;
            tracker
                .set_xml_file_phase_status(xml_id, phase::XSD, status::FAILED)
                .await?;
            return Ok(());
        }
    };

    if output.status.success() {
        debug!(document = %name, "Xml document is valid");
        tracker
            .set_xml_file_phase_status(xml_id, phase::XSD, status::DONE)
            .await?;
        return Ok(());
    }

    debug!(document = %name, "Xml document is invalid");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut logged = 0;
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let (line_number, column, message) = parse_issue(line);
        tracker
            .add_xml_log(xml_id, "SchemaValidationException", &message, line_number, column)
            .await?;
        logged += 1;
    }
    if logged == 0 {
        let message = format!(
            "Schema validation failed with exit code {}",
            output.status.code().unwrap_or(-1)
        );
        tracker
            .add_xml_log(xml_id, "SchemaValidationException", &message, None, None)
            .await?;
    }
    tracker
        .set_xml_file_phase_status(xml_id, phase::XSD, status::FAILED)
        .await?;
    Ok(())
}

/// Split a validator issue line into (line, column, message). Lines that
/// do not carry positions become message-only log rows.
fn parse_issue(issue: &str) -> (Option<i64>, Option<i64>, String) {
    let mut parts = issue.splitn(3, ':');
    let first = parts.next().unwrap_or_default();
    let second = parts.next();
    let rest = parts.next();
    match (first.trim().parse::<i64>().ok(), second, rest) {
        (Some(line), Some(column), Some(message)) => match column.trim().parse::<i64>() {
            Ok(column) => (Some(line), Some(column), message.trim().to_string()),
            Err(_) => (None, None, issue.trim().to_string()),
        },
        _ => (None, None, issue.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_lines_with_positions_are_split() {
        let (line, column, message) = parse_issue("12:34: element 'specimen' is not expected");
        assert_eq!(line, Some(12));
        assert_eq!(column, Some(34));
        assert_eq!(message, "element 'specimen' is not expected");
    }

    #[test]
    fn issue_lines_without_positions_are_kept_whole() {
        let (line, column, message) = parse_issue("could not resolve schema location");
        assert_eq!(line, None);
        assert_eq!(column, None);
        assert_eq!(message, "could not resolve schema location");
    }

    #[test]
    fn malformed_positions_fall_back_to_whole_line() {
        let (line, column, message) = parse_issue("12:xy: broken");
        assert_eq!(line, None);
        assert_eq!(column, None);
        assert_eq!(message, "12:xy: broken");
    }
}
