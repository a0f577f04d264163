//! Tracker store and shared state machine for the PhenoDCC file-source
//! crawler
//!
//! The tracker database couples the persistent status of three
//! hierarchically linked entities (package action, package download,
//! inner document) with a strict earliest-failure-wins escalation rule.
//! Workers coordinate through it with at-most-one-worker-per-job claim
//! semantics; it is the only mutable state shared across the pipeline.

pub mod entities;
pub mod error;
pub mod escalation;
pub mod rating;
pub mod store;
pub mod tokenizer;

pub use entities::{
    Centre, ClaimableAction, CrawlingSession, FileSource, SessionTask, SourceCandidate, XmlFile,
    ZipAction, ZipDownload, ZipFile, SESSION_FAILURE, SESSION_SUCCESS,
};
pub use error::{Result, TrackerError};
pub use escalation::{resolve, Outcome, PhaseStatus};
pub use rating::{sort_by_preference, AffinityRater, SourceRater, AFFINITY_WEIGHT};
pub use store::Tracker;
pub use tokenizer::{FilenameTokenizer, FilenameTokens, TokenKind};
