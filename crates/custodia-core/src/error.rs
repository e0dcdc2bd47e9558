use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::{ScopeName, ScopeSet};

/// Every failure the engine can report.
///
/// `AccessDenied` deliberately carries nothing: a caller must not be able to
/// tell a denied pair from one that never existed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CustodiaError {
    #[error("validation failed: {}", render_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("access denied")]
    AccessDenied,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("conflicting concurrent update: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CustodiaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CustodiaError::Validation(_) => ErrorKind::Validation,
            CustodiaError::AccessDenied => ErrorKind::AccessDenied,
            CustodiaError::Configuration(_) => ErrorKind::Configuration,
            CustodiaError::Conflict(_) => ErrorKind::Conflict,
            CustodiaError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn validation(issue: ValidationIssue) -> Self {
        CustodiaError::Validation(vec![issue])
    }

    /// Issues carried by a `Validation` error, empty for every other kind.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            CustodiaError::Validation(issues) => issues,
            _ => &[],
        }
    }
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A single reason a submission or decision was rejected. Safe to show to
/// the data owner so the form can be re-prompted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    UnknownScope { scope: ScopeName },
    EmptyValue { scope: ScopeName },
    ValueTooLong { scope: ScopeName, max_len: usize },
    EmptySubmission,
    UnsatisfiedScopes { missing: ScopeSet },
    ScopeNotDeclared { scope: ScopeName },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::UnknownScope { scope } => write!(f, "unknown scope '{}'", scope),
            ValidationIssue::EmptyValue { scope } => write!(f, "empty value for '{}'", scope),
            ValidationIssue::ValueTooLong { scope, max_len } => {
                write!(f, "value for '{}' exceeds {} characters", scope, max_len)
            }
            ValidationIssue::EmptySubmission => write!(f, "nothing submitted"),
            ValidationIssue::UnsatisfiedScopes { missing } => {
                write!(f, "scopes still missing: {}", missing.to_scope_string())
            }
            ValidationIssue::ScopeNotDeclared { scope } => {
                write!(f, "scope '{}' is not declared by the application", scope)
            }
        }
    }
}

/// Discriminator for CustodiaError variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AccessDenied,
    Configuration,
    Conflict,
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::AccessDenied => write!(f, "access_denied"),
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Storage => write!(f, "storage"),
        }
    }
}

pub type CustodiaResult<T> = Result<T, CustodiaError>;
