//! Post-ingest driver
//!
//! Downstream stages may carry implicit inter-document data
//! dependencies, so this stage is strictly single-threaded: specimen
//! documents always precede experiment documents of the same phase, and
//! within each group documents are processed in ascending created
//! order. Each external tool runs as a subprocess whose exit code is
//! interpreted here and recorded on a SessionTask row; a tool that was
//! not supplied is skipped with a warning and treated as success.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::{contents_dir, Settings};
use crate::error::Result;
use phenodcc_tracker::entities::{phase, status};
use phenodcc_tracker::{Tracker, XmlFile};

const SUCCESS: i32 = 0;
const FAILURE: i32 = 1;
const PARSE_ARGS_FAIL: i32 = 100;
const DB_PROPERTIES_FILE_NOT_FOUND: i32 = 101;
const MISSING_XML_FILE_PATH: i32 = 102;
const DB_ERROR_CONNECTION: i32 = 103;
const DB_ERROR_SERIALIZING: i32 = 104;

const SPECIMEN_PATTERN: &str = "%specimen%";
const EXPERIMENT_PATTERN: &str = "%experiment%";

/// Single-threaded stage driving serialisation, integrity checking,
/// context building and overview building over newly validated
/// documents.
pub struct PostIngest {
    tracker: Tracker,
    settings: Arc<Settings>,
    session_id: i64,
}

impl PostIngest {
    pub fn new(tracker: Tracker, settings: Arc<Settings>, session_id: i64) -> Self {
        Self {
            tracker,
            settings,
            session_id,
        }
    }

    /// Run every post-ingest stage; `true` when any document or tool
    /// failed.
    pub async fn run(&self) -> Result<bool> {
        info!("Will attempt to update the QC database");
        let mut any_failures = false;

        info!("Uploading data from XML documents");
        any_failures |= self.upload_documents(SPECIMEN_PATTERN, true).await?;
        any_failures |= self.upload_documents(EXPERIMENT_PATTERN, false).await?;

        info!("Validating recently uploaded data");
        any_failures |= self.validate_documents(SPECIMEN_PATTERN).await?;
        any_failures |= self.validate_documents(EXPERIMENT_PATTERN).await?;

        info!("Building overviews");
        any_failures |= self.build_overviews().await?;

        if any_failures {
            warn!("Finished updating the QC database with errors");
        } else {
            info!("Finished updating the QC database without errors");
        }
        Ok(any_failures)
    }

    /// Full path of an extracted document, from the canonical layout.
    async fn document_path(&self, xml: &XmlFile) -> Result<PathBuf> {
        let (zip_name, todo) = self.tracker.download_location(xml.zip_download_id).await?;
        let archive = self.settings.archive_path(&todo, &zip_name);
        Ok(contents_dir(&archive).join(&xml.fname))
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    async fn upload_documents(&self, pattern: &str, specimen_mode: bool) -> Result<bool> {
        let files = self
            .tracker
            .xml_files_by_phase_status_like(phase::XSD, status::DONE, pattern)
            .await?;
        if files.is_empty() {
            info!(pattern, "Did not find any schema-validated XML documents");
            return Ok(false);
        }

        let mut failed = 0;
        for xml in &files {
            self.tracker
                .set_xml_file_phase_status(xml.id, phase::UPLOAD, status::RUNNING)
                .await?;
            let exit = self.serialize_document(xml, specimen_mode).await?;
            if exit == SUCCESS {
                self.tracker
                    .set_xml_file_phase_status(xml.id, phase::DATA, status::PENDING)
                    .await?;
            } else {
                self.tracker
                    .set_xml_file_phase_status(xml.id, phase::UPLOAD, status::FAILED)
                    .await?;
                self.log_serializer_error(xml.id, exit).await?;
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(failed, total = files.len(), pattern, "Documents failed upload");
        }
        Ok(failed > 0)
    }

    async fn serialize_document(&self, xml: &XmlFile, specimen_mode: bool) -> Result<i32> {
        let (Some(tool), Some(props)) = (
            self.settings.tools.serializer.as_ref(),
            self.settings.serializer_props.as_ref(),
        ) else {
            warn!("Skipping serialisation: serialiser tool or properties file was not supplied");
            return Ok(SUCCESS);
        };
        let path = self.document_path(xml).await?;
        let args = vec![
            "-t".to_string(),
            xml.id.to_string(),
            "-r".to_string(),
            xml.last_update.format("%Y-%m-%dT%H:%M:%S%z").to_string(),
            "-d".to_string(),
            props.display().to_string(),
            (if specimen_mode { "-s" } else { "-p" }).to_string(),
            path.display().to_string(),
        ];

        let task = self
            .tracker
            .begin_session_task(
                self.session_id,
                phase::UPLOAD,
                &format!("XML file: {}", path.display()),
            )
            .await?;
        let exit = run_tool(tool, &args).await;
        self.tracker.finish_session_task(task, exit as i64).await?;
        Ok(exit)
    }

    async fn log_serializer_error(&self, xml_id: i64, exit: i32) -> Result<()> {
        let message = match exit {
            PARSE_ARGS_FAIL => "Unable to parse data inserter invocation arguments".to_string(),
            DB_PROPERTIES_FILE_NOT_FOUND => {
                "Unable to find or access database properties file".to_string()
            }
            MISSING_XML_FILE_PATH => {
                "Path of the XML document to process must be specified".to_string()
            }
            DB_ERROR_CONNECTION => {
                "Unable to establish a connection with the database".to_string()
            }
            DB_ERROR_SERIALIZING => "Unable to serialise the XML data to database".to_string(),
            other => format!("Serialisation failed with exit code {other}"),
        };
        self.tracker
            .add_xml_log(xml_id, "DataInsertionException", &message, None, None)
            .await
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Integrity and context
    // ------------------------------------------------------------------

    async fn validate_documents(&self, pattern: &str) -> Result<bool> {
        let files = self
            .tracker
            .xml_files_by_phase_status_like(phase::DATA, status::PENDING, pattern)
            .await?;
        if files.is_empty() {
            info!(pattern, "Did not find newly uploaded documents");
            return Ok(false);
        }

        let mut failed = 0;
        for xml in &files {
            self.tracker
                .set_xml_file_phase_status(xml.id, phase::DATA, status::RUNNING)
                .await?;
            let exit = self.check_data_integrity(xml.id).await?;
            if exit != SUCCESS {
                self.tracker
                    .set_xml_file_phase_status(xml.id, phase::DATA, status::FAILED)
                    .await?;
                failed += 1;
                continue;
            }

            self.tracker
                .set_xml_file_phase_status(xml.id, phase::CONTEXT, status::RUNNING)
                .await?;
            let exit = self.build_context(xml.id).await?;
            if exit == SUCCESS {
                self.tracker
                    .set_xml_file_phase_status(xml.id, phase::OVERVIEW, status::PENDING)
                    .await?;
            } else {
                self.tracker
                    .set_xml_file_phase_status(xml.id, phase::CONTEXT, status::FAILED)
                    .await?;
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(failed, total = files.len(), pattern, "Documents failed data validation");
        }
        Ok(failed > 0)
    }

    async fn check_data_integrity(&self, xml_id: i64) -> Result<i32> {
        let (Some(tool), Some(vprops), Some(xprops)) = (
            self.settings.tools.integrity_checker.as_ref(),
            self.settings.validator_props.as_ref(),
            self.settings.validation_resources_props.as_ref(),
        ) else {
            warn!("Skipping data integrity check: validator tool or properties were not supplied");
            return Ok(SUCCESS);
        };
        let args = vec![
            "-t".to_string(),
            xml_id.to_string(),
            "-f".to_string(),
            vprops.display().to_string(),
            "-h".to_string(),
            xprops.display().to_string(),
        ];

        let task = self
            .tracker
            .begin_session_task(self.session_id, phase::DATA, &format!("XML file id: {xml_id}"))
            .await?;
        let exit = run_tool(tool, &args).await;
        self.tracker.finish_session_task(task, exit as i64).await?;
        Ok(exit)
    }

    async fn build_context(&self, xml_id: i64) -> Result<i32> {
        let (Some(tool), Some(props)) = (
            self.settings.tools.context_builder.as_ref(),
            self.settings.context_props.as_ref(),
        ) else {
            warn!("Skipping context building: context builder tool or properties were not supplied");
            return Ok(SUCCESS);
        };
        let args = vec![
            "-x".to_string(),
            xml_id.to_string(),
            "-r".to_string(),
            props.display().to_string(),
        ];

        let task = self
            .tracker
            .begin_session_task(
                self.session_id,
                phase::CONTEXT,
                &format!("XML file id: {xml_id}"),
            )
            .await?;
        let exit = run_tool(tool, &args).await;
        self.tracker.finish_session_task(task, exit as i64).await?;
        Ok(exit)
    }

    // ------------------------------------------------------------------
    // Overviews
    // ------------------------------------------------------------------

    async fn build_overviews(&self) -> Result<bool> {
        let (Some(tool), Some(database)) = (
            self.settings.tools.overview_builder.as_ref(),
            self.settings.tools.overview_database.as_ref(),
        ) else {
            warn!("Skipping overview building: overview builder or target database not configured");
            return Ok(false);
        };

        let mut collected = self
            .tracker
            .xml_files_by_phase_status_like(phase::OVERVIEW, status::PENDING, SPECIMEN_PATTERN)
            .await?;
        collected.extend(
            self.tracker
                .xml_files_by_phase_status_like(
                    phase::OVERVIEW,
                    status::PENDING,
                    EXPERIMENT_PATTERN,
                )
                .await?,
        );
        if collected.is_empty() {
            return Ok(false);
        }

        let task = self
            .tracker
            .begin_session_task(
                self.session_id,
                phase::OVERVIEW,
                &format!("Total number of XML files: {}", collected.len()),
            )
            .await?;
        for xml in &collected {
            self.tracker
                .set_xml_file_phase_status(xml.id, phase::OVERVIEW, status::RUNNING)
                .await?;
        }
        let exit = run_tool(tool, &[database.clone()]).await;
        self.tracker.finish_session_task(task, exit as i64).await?;

        let outcome = if exit == SUCCESS { status::DONE } else { status::FAILED };
        for xml in &collected {
            self.tracker
                .set_xml_file_phase_status(xml.id, phase::OVERVIEW, outcome)
                .await?;
        }
        Ok(exit != SUCCESS)
    }
}

/// Launch one external tool and fold its output into the log. A tool
/// that cannot be launched counts as a generic failure.
async fn run_tool(tool: &Path, args: &[String]) -> i32 {
    info!(tool = %tool.display(), args = %args.join(" "), "Launching tool");
    let output = Command::new(tool)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;
    match output {
        Ok(output) => {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                info!(tool = %tool.display(), "{line}");
            }
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                warn!(tool = %tool.display(), "{line}");
            }
            output.status.code().unwrap_or(FAILURE)
        }
        Err(e) => {
            error!(tool = %tool.display(), error = %e, "Failed to launch tool");
            FAILURE
        }
    }
}
