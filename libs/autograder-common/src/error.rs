//! Error taxonomy shared by the grader.
//!
//! Only [`SandboxError::Unavailable`] and [`GradeError::Store`] halt a grading
//! pass. Fetch failures abort one assignment, spec parse failures degrade to
//! an empty spec, and everything that happens inside a sandbox run ends up as
//! an `Outcome`.

use crate::types::SpecKind;

#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    /// Assignment markup or problem config unreachable or malformed.
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// Grading store refused a request.
    #[error("grading store error: {message}")]
    Store { message: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// No registered runner can handle the spec kind.
    #[error("no runner supports {kind} specs (language: {language})")]
    Configuration { kind: SpecKind, language: String },
}

impl GradeError {
    pub fn fetch(url: impl Into<String>, message: impl ToString) -> Self {
        GradeError::Fetch {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Whether the whole grading pass has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GradeError::Store { .. } | GradeError::Sandbox(SandboxError::Unavailable { .. })
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The isolation substrate (process spawner, Docker daemon) cannot be reached.
    #[error("sandbox unavailable: {message}")]
    Unavailable { message: String },

    /// Rejected before reaching the substrate.
    #[error("{what} exceeds maximum size of {limit} bytes")]
    TooLarge { what: &'static str, limit: usize },
}

impl SandboxError {
    pub fn unavailable(message: impl ToString) -> Self {
        SandboxError::Unavailable {
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("question index {index} out of range ({available} questions)")]
    QuestionOutOfRange { index: usize, available: usize },

    #[error("test case segment {position} has no `]]]` separator")]
    MissingSeparator { position: usize },

    #[error("assignment url has no problem id: {0}")]
    NoProblemId(String),

    #[error("invalid problem config: {0}")]
    InvalidProblem(String),
}
