//! Filename convention: configuration-supplied regex mapping incoming
//! files to their group and sub-band.

use regex::Regex;
use tracing::warn;

use crate::error::{PipelineError, Result};

/// Parsed identity of one incoming file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubbandKey {
    pub group_id: String,
    pub subband_index: u32,
}

/// Compiled filename convention.
///
/// The pattern must define named captures `group` and `subband`; the
/// latter must capture a decimal integer. Everything else about the
/// pattern is deployment-specific.
#[derive(Clone, Debug)]
pub struct FilenamePattern {
    regex: Regex,
}

impl FilenamePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            PipelineError::ConstraintViolation(format!("invalid filename_regex: {e}"))
        })?;
        let names: Vec<&str> = regex.capture_names().flatten().collect();
        for required in ["group", "subband"] {
            if !names.contains(&required) {
                return Err(PipelineError::ConstraintViolation(format!(
                    "filename_regex must define a named capture `{required}`"
                )));
            }
        }
        Ok(Self { regex })
    }

    /// Map a file name to its group and sub-band. Non-matching names
    /// return `None` and are ignored by the watcher.
    pub fn parse(&self, file_name: &str) -> Option<SubbandKey> {
        let captures = self.regex.captures(file_name)?;
        let group_id = captures.name("group")?.as_str().to_string();
        let raw_subband = captures.name("subband")?.as_str();
        let subband_index = match raw_subband.parse::<u32>() {
            Ok(index) => index,
            Err(_) => {
                warn!(file_name, raw_subband, "subband capture is not an integer; ignoring file");
                return None;
            }
        };
        Some(SubbandKey {
            group_id,
            subband_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> FilenamePattern {
        FilenamePattern::new(
            r"^(?P<group>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})_sb(?P<subband>\d+)\.hdf5$",
        )
        .unwrap()
    }

    #[test]
    fn matching_names_yield_group_and_subband() {
        let key = pattern().parse("2024-02-25T12:00:00_sb07.hdf5").unwrap();
        assert_eq!(key.group_id, "2024-02-25T12:00:00");
        assert_eq!(key.subband_index, 7);
    }

    #[test]
    fn non_matching_names_are_ignored() {
        assert!(pattern().parse("README.md").is_none());
        assert!(pattern().parse("2024-02-25T12:00:00_sbXX.hdf5").is_none());
    }

    #[test]
    fn missing_named_captures_are_rejected() {
        let err = FilenamePattern::new(r"^(?P<group>\d+)\.hdf5$").unwrap_err();
        assert!(matches!(err, PipelineError::ConstraintViolation(_)));
    }
}
