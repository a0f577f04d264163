//! Filename tokenizing for archives and their inner documents
//!
//! Submissions follow the IMPC naming convention: the producing centre's
//! short-name, a release date, and an increment number, with inner
//! documents additionally marked as specimen or experiment data. The two
//! patterns are compiled once from the crawler configuration; the default
//! patterns accept names such as `ABCD_20140115_1.zip` and
//! `ABCD_20140115_1_specimen.xml`.

use std::collections::HashMap;

use chrono::NaiveDate;
use regex::Regex;

use crate::error::Result;

/// Default pattern for archive names.
pub const DEFAULT_ZIP_PATTERN: &str = r"^([A-Za-z0-9]+)[._-](\d{4})(\d{2})(\d{2})[._-](\d+)\.zip$";

/// Default pattern for inner document names; the sixth group separates
/// specimen documents from everything else.
pub const DEFAULT_XML_PATTERN: &str =
    r"^([A-Za-z0-9]+)[._-](\d{4})(\d{2})(\d{2})[._-](\d+)[._-]([a-z]+)\.xml$";

/// What kind of name matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Zip,
    Specimen,
    Experiment,
}

/// Tokens recognised from a conforming file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTokens {
    /// Centre that produced the data (not the hosting centre).
    pub centre_id: i64,
    /// Date on which the data was released.
    pub created: NaiveDate,
    /// Increment number within that release date.
    pub inc: i64,
    pub kind: TokenKind,
}

impl FilenameTokens {
    pub fn is_specimen(&self) -> bool {
        self.kind == TokenKind::Specimen
    }
}

/// Tokenizer over the two configured patterns and the set of known
/// centres. Pure and thread-safe once constructed.
#[derive(Debug)]
pub struct FilenameTokenizer {
    zip: Regex,
    xml: Regex,
    centres: HashMap<String, i64>,
}

impl FilenameTokenizer {
    /// Compile the supplied patterns over a (short-name, id) centre map.
    pub fn new(
        zip_pattern: &str,
        xml_pattern: &str,
        centres: HashMap<String, i64>,
    ) -> Result<Self> {
        Ok(Self {
            zip: Regex::new(zip_pattern)?,
            xml: Regex::new(xml_pattern)?,
            centres,
        })
    }

    /// Tokenize with the default naming convention.
    pub fn with_defaults(centres: HashMap<String, i64>) -> Result<Self> {
        Self::new(DEFAULT_ZIP_PATTERN, DEFAULT_XML_PATTERN, centres)
    }

    /// Try the zip pattern, then the xml pattern; `None` when neither
    /// matches or the captured values are out of range.
    pub fn tokenize(&self, filename: &str) -> Option<FilenameTokens> {
        if let Some(caps) = self.zip.captures(filename) {
            return self.build(&caps, TokenKind::Zip);
        }
        if let Some(caps) = self.xml.captures(filename) {
            let kind = if caps.get(6).map(|m| m.as_str()) == Some("specimen") {
                TokenKind::Specimen
            } else {
                TokenKind::Experiment
            };
            return self.build(&caps, kind);
        }
        None
    }

    fn build(&self, caps: &regex::Captures<'_>, kind: TokenKind) -> Option<FilenameTokens> {
        let centre_id = *self.centres.get(caps.get(1)?.as_str())?;
        let year: i32 = caps.get(2)?.as_str().parse().ok()?;
        let month: u32 = caps.get(3)?.as_str().parse().ok()?;
        let day: u32 = caps.get(4)?.as_str().parse().ok()?;
        let inc: i64 = caps.get(5)?.as_str().parse().ok()?;
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) || inc < 0 {
            return None;
        }
        let created = NaiveDate::from_ymd_opt(year, month, day)?;
        Some(FilenameTokens {
            centre_id,
            created,
            inc,
            kind,
        })
    }
}
