// Admission checks applied before a job exists.
// Anything rejected here never reaches the queue or a worker.

use crate::config::EngineConfig;
use crate::languages::LanguageTable;
use crate::types::{ExecutionRequest, Language};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("code size {size} bytes exceeds maximum of {max} bytes")]
    CodeTooLarge { size: usize, max: usize },

    #[error("input size {size} bytes exceeds maximum of {max} bytes")]
    InputTooLarge { size: usize, max: usize },

    #[error("malformed request body: {0}")]
    Malformed(String),
}

/// Raw submission as it arrives over HTTP. Fields are optional so missing
/// ones can be reported precisely instead of as a generic decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, alias = "stdin")]
    pub input: Option<String>,
}

/// Size limits and enabled languages consulted at admission.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy<'a> {
    pub languages: &'a LanguageTable,
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
}

impl<'a> AdmissionPolicy<'a> {
    pub fn new(config: &EngineConfig, languages: &'a LanguageTable) -> Self {
        Self {
            languages,
            max_code_bytes: config.max_code_bytes,
            max_input_bytes: config.max_input_bytes,
        }
    }

    /// Turn a raw submission into an admitted request or say why not.
    pub fn admit(&self, submission: Submission) -> Result<ExecutionRequest, ValidationError> {
        let code = submission
            .code
            .filter(|c| !c.trim().is_empty())
            .ok_or(ValidationError::MissingField("code"))?;
        let language_name = submission
            .language
            .filter(|l| !l.trim().is_empty())
            .ok_or(ValidationError::MissingField("language"))?;

        let language = language_name
            .parse::<Language>()
            .ok()
            .filter(|l| self.languages.is_enabled(*l))
            .ok_or_else(|| ValidationError::UnsupportedLanguage(language_name.trim().to_string()))?;

        if code.len() > self.max_code_bytes {
            return Err(ValidationError::CodeTooLarge {
                size: code.len(),
                max: self.max_code_bytes,
            });
        }

        let stdin = submission.input.filter(|i| !i.is_empty());
        if let Some(input) = &stdin {
            if input.len() > self.max_input_bytes {
                return Err(ValidationError::InputTooLarge {
                    size: input.len(),
                    max: self.max_input_bytes,
                });
            }
        }

        Ok(ExecutionRequest {
            code,
            language,
            stdin,
        })
    }
}
