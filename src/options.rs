//! Request-side download options and their validation rules.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;

/// Folder names a template's literal prefix is allowed to use before its
/// first `{placeholder}`.
const ALLOWED_ROOT_FOLDERS: [&str; 4] = ["audio", "video", "playlist", "data"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevelOption {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelOption> for crate::event::LogLevel {
    fn from(value: LogLevelOption) -> Self {
        match value {
            LogLevelOption::Debug => crate::event::LogLevel::Debug,
            LogLevelOption::Info => crate::event::LogLevel::Info,
            LogLevelOption::Warn => crate::event::LogLevel::Warn,
            LogLevelOption::Error => crate::event::LogLevel::Error,
        }
    }
}

/// The request-side `on-duplicate` policy. Wider than `arbiter::Decision`:
/// `Prompt`/`PromptAll` ask the core to go interactive instead of naming a
/// final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    Prompt,
    Overwrite,
    Skip,
    Rename,
    PromptAll,
    OverwriteAll,
    SkipAll,
    RenameAll,
}

impl DuplicatePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompt" => Some(Self::Prompt),
            "overwrite" => Some(Self::Overwrite),
            "skip" => Some(Self::Skip),
            "rename" => Some(Self::Rename),
            "prompt_all" => Some(Self::PromptAll),
            "overwrite_all" => Some(Self::OverwriteAll),
            "skip_all" => Some(Self::SkipAll),
            "rename_all" => Some(Self::RenameAll),
            _ => None,
        }
    }

    /// A policy either resolves every conflict without asking (returns the
    /// fixed decision the Executor should apply), or requires interactive
    /// resolution via the arbiter.
    pub fn pre_resolved(self) -> Option<crate::arbiter::Decision> {
        use crate::arbiter::Decision;
        match self {
            Self::Overwrite => Some(Decision::Overwrite),
            Self::Skip => Some(Decision::Skip),
            Self::Rename => Some(Decision::Rename),
            Self::OverwriteAll => Some(Decision::OverwriteAll),
            Self::SkipAll => Some(Decision::SkipAll),
            Self::RenameAll => Some(Decision::RenameAll),
            Self::Prompt | Self::PromptAll => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DownloadOptions {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub itag: i64,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub jobs: u32,
    #[serde(default)]
    pub timeout: u32,
    #[serde(default)]
    pub quiet: bool,
    #[serde(rename = "log-level", default)]
    pub log_level: Option<LogLevelOption>,
    #[serde(rename = "on-duplicate", default)]
    pub on_duplicate: Option<String>,
}

impl DownloadOptions {
    /// Parses and validates the `on-duplicate` field, defaulting to `Skip`
    /// when the caller omitted it: the arbiter's own contract already
    /// defaults unanswered prompts to `skip`, so treating an absent policy
    /// the same way keeps the two consistent.
    pub fn duplicate_policy(&self) -> Result<DuplicatePolicy, CoreError> {
        match &self.on_duplicate {
            None => Ok(DuplicatePolicy::Skip),
            Some(raw) => DuplicatePolicy::parse(raw).ok_or_else(|| {
                CoreError::InvalidInput(format!("invalid 'on-duplicate' value: {raw}"))
            }),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.output.is_empty() {
            validate_output_template(&self.output)?;
        }
        self.duplicate_policy()?;
        Ok(())
    }
}

/// Validates an output filename template: rejects `..`, absolute paths,
/// Windows drive prefixes, and any literal prefix before the first `{`
/// placeholder whose leading path segment is not one of the permitted
/// media-root folder names.
pub fn validate_output_template(template: &str) -> Result<(), CoreError> {
    if template.contains("..") {
        return Err(CoreError::InvalidInput(
            "output template must not contain '..'".to_string(),
        ));
    }
    if template.starts_with('/') {
        return Err(CoreError::InvalidInput(
            "output template must not be an absolute path".to_string(),
        ));
    }
    let bytes = template.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(CoreError::InvalidInput(
            "output template must not carry a drive prefix".to_string(),
        ));
    }

    let prefix = match template.find('{') {
        Some(idx) => &template[..idx],
        None => template,
    };

    if let Some(sep_idx) = prefix.find(['/', '\\']) {
        let folder = &prefix[..sep_idx];
        if !ALLOWED_ROOT_FOLDERS.contains(&folder) {
            return Err(CoreError::InvalidInput(format!(
                "output template root '{folder}' is not one of the permitted media folders"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_traversal() {
        assert!(validate_output_template("../x").is_err());
    }

    #[test]
    fn rejects_absolute_path() {
        assert!(validate_output_template("/abs").is_err());
    }

    #[test]
    fn rejects_windows_drive_prefix() {
        assert!(validate_output_template("C:\\abs").is_err());
    }

    #[test]
    fn rejects_unapproved_nested_root() {
        assert!(validate_output_template("nested/path/{title}").is_err());
    }

    #[test]
    fn accepts_allowed_root_folder() {
        assert!(validate_output_template("audio/{title}.{ext}").is_ok());
    }

    #[test]
    fn accepts_bare_template_with_no_folder() {
        assert!(validate_output_template("{title}.{ext}").is_ok());
    }

    #[test]
    fn duplicate_policy_parses_full_closed_set() {
        for (raw, expected) in [
            ("prompt", DuplicatePolicy::Prompt),
            ("overwrite", DuplicatePolicy::Overwrite),
            ("skip", DuplicatePolicy::Skip),
            ("rename", DuplicatePolicy::Rename),
            ("prompt_all", DuplicatePolicy::PromptAll),
            ("overwrite_all", DuplicatePolicy::OverwriteAll),
            ("skip_all", DuplicatePolicy::SkipAll),
            ("rename_all", DuplicatePolicy::RenameAll),
        ] {
            assert_eq!(DuplicatePolicy::parse(raw), Some(expected));
        }
        assert_eq!(DuplicatePolicy::parse("bogus"), None);
    }
}
