//! Error kinds surfaced by the content-filtering core.
//!
//! Every variant is recoverable from the host application's point of view:
//! the worst outcome is that blocking is reported as unavailable.

use std::path::PathBuf;

use crate::host::SurfaceId;

/// A single filter-list line that could not be turned into a rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {reason}")]
pub struct RuleParseError {
    /// 1-based line number inside the list, 0 when parsed standalone.
    pub line: usize,
    pub reason: String,
}

impl RuleParseError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            line: 0,
            reason: reason.into(),
        }
    }

    pub(crate) fn at_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdBlockError {
    /// A filter list could not be fetched; the previous text is kept.
    #[error("filter list source unreachable: {uri}: {reason}")]
    SourceUnreachable { uri: String, reason: String },

    /// Malformed rule text.
    #[error("parse error in list '{list}': {source}")]
    Parse {
        list: String,
        #[source]
        source: RuleParseError,
    },

    /// The matching subsystem rejected a merged rule set.
    #[error("rule set '{identifier}' rejected: {reason}")]
    Compilation { identifier: String, reason: String },

    /// Even the bundled minimal rules failed to compile.
    #[error("ad blocking unavailable: {0}")]
    DegradedModeEntered(String),

    /// Settings could not be read or written.
    #[error("settings persistence failed for {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },

    #[error("unknown filter list '{0}'")]
    UnknownList(String),

    #[error("filter list '{0}' already registered")]
    DuplicateList(String),

    #[error("invalid domain '{0}'")]
    InvalidDomain(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The browsing-surface host refused to install a rule set.
    #[error("surface {surface}: {reason}")]
    Surface { surface: SurfaceId, reason: String },

    /// The coordinator's owner task is gone.
    #[error("ad block coordinator has shut down")]
    ShutDown,
}

impl AdBlockError {
    pub fn compilation(identifier: &str, reason: impl ToString) -> Self {
        Self::Compilation {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the error kind as a short stable name.
    pub fn kind(&self) -> &'static str {
        match self {
            AdBlockError::SourceUnreachable { .. } => "SourceUnreachable",
            AdBlockError::Parse { .. } => "ParseError",
            AdBlockError::Compilation { .. } => "CompilationError",
            AdBlockError::DegradedModeEntered(_) => "DegradedModeEntered",
            AdBlockError::Persistence { .. } => "PersistenceError",
            AdBlockError::UnknownList(_) => "UnknownList",
            AdBlockError::DuplicateList(_) => "DuplicateList",
            AdBlockError::InvalidDomain(_) => "InvalidDomain",
            AdBlockError::InvalidUrl(_) => "InvalidUrl",
            AdBlockError::Surface { .. } => "Surface",
            AdBlockError::ShutDown => "ShutDown",
        }
    }
}

pub type Result<T, E = AdBlockError> = std::result::Result<T, E>;
