// src/error.rs

//! Error types for tsuku
//!
//! Errors fall into five families: parameter errors raised while reading
//! step parameters, validation errors collected by preflight, trust errors
//! (checksums, signatures, fingerprints), platform errors that carry a
//! remediation command, and environment errors wrapping I/O or process
//! failures with enough context to diagnose them.

use thiserror::Error;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A required step parameter is absent
    #[error("{action} action requires '{param}' parameter")]
    MissingParameter { action: String, param: String },

    /// A step parameter is present but malformed
    #[error("{action}: invalid '{param}' parameter: {reason}")]
    InvalidParameter {
        action: String,
        param: String,
        reason: String,
    },

    /// Mutually exclusive parameters were combined (or none of a required set given)
    #[error("{action}: {reason}")]
    ConflictingParameters { action: String, reason: String },

    /// Action name not present in the registry
    #[error("unknown action '{name}'{}", format_suggestions(.suggestions))]
    UnknownAction {
        name: String,
        suggestions: Vec<String>,
    },

    /// Action is neither a primitive nor decomposable
    #[error("action '{0}' cannot be decomposed")]
    NotDecomposable(String),

    /// Decomposition revisited an (action, params) pair already on the chain
    #[error("cycle detected: action '{0}' has already been visited in this decomposition chain")]
    DecompositionCycle(String),

    /// Decomposition exceeded the nesting limit
    #[error("decomposition exceeded maximum depth of {0}")]
    DecompositionTooDeep(usize),

    /// Wraps a decomposition failure with the composite that failed
    #[error("failed to decompose '{action}': {source}")]
    Decomposition {
        action: String,
        #[source]
        source: Box<Error>,
    },

    /// A plan step failed during execution
    #[error("step {step} ({action}) failed: {source}")]
    StepFailed {
        step: usize,
        action: String,
        #[source]
        source: Box<Error>,
    },

    /// Post-install verification did not pass
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Preflight reported one or more fatal errors
    #[error("{action}: {message}")]
    PreflightFailed { action: String, message: String },

    /// A URL did not use https
    #[error("refusing non-HTTPS URL: {0}")]
    InsecureUrl(String),

    /// Server sent a compressed body after identity was requested
    #[error("unexpected Content-Encoding '{0}' (expected identity)")]
    UnexpectedContentEncoding(String),

    /// Response exceeded a hard size cap
    #[error("response from {url} exceeds {limit} bytes")]
    ResponseTooLarge { url: String, limit: u64 },

    /// Downloaded content does not hash to the expected value
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Detached signature did not verify against the pinned key
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    /// A key's computed fingerprint differs from the pinned one
    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// Fingerprint string is not 40 hex digits
    #[error("invalid fingerprint '{0}': expected 40 hexadecimal characters")]
    InvalidFingerprint(String),

    /// A required system package is not installed
    #[error("missing system dependency: {library} (install with: {command})")]
    DependencyMissing {
        library: String,
        package: String,
        command: String,
        family: String,
    },

    /// Eval-time tools absent from the tools directory
    #[error("missing eval-time dependencies: {} (install with: tsuku install {})", .0.join(", "), .0.first().map(String::as_str).unwrap_or_default())]
    MissingEvalDependencies(Vec<String>),

    /// Two steps pinned the same dependency to different versions
    #[error("conflicting versions for dependency '{name}': {first} vs {second}")]
    DependencyConflict {
        name: String,
        first: String,
        second: String,
    },

    /// A dependency (transitively) depends on itself
    #[error("dependency cycle detected: {0}")]
    DependencyCycle(String),

    /// Required executable not found
    #[error("required tool not found: {0}")]
    ToolNotFound(String),

    /// External command exited unsuccessfully
    #[error("command '{command}' failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    /// Operation aborted by its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Path escapes its sandbox
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    /// Path is malformed for its use
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// HTTP status other than success
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("download failed: {0}")]
    DownloadError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("not found: {0}")]
    NotFoundError(String),

    #[error("initialization failed: {0}")]
    InitError(String),

    /// I/O failure with added context
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

impl Error {
    pub fn missing_param(action: &str, param: &str) -> Self {
        Self::MissingParameter {
            action: action.to_string(),
            param: param.to_string(),
        }
    }

    pub fn invalid_param(action: &str, param: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            action: action.to_string(),
            param: param.to_string(),
            reason: reason.into(),
        }
    }

    pub fn conflict(action: &str, reason: impl Into<String>) -> Self {
        Self::ConflictingParameters {
            action: action.to_string(),
            reason: reason.into(),
        }
    }

    /// True for checksum, signature, fingerprint and transport-integrity failures.
    ///
    /// These abort the whole installation and are never retried or downgraded.
    pub fn is_trust_failure(&self) -> bool {
        match self {
            Self::ChecksumMismatch { .. }
            | Self::SignatureVerificationFailed(_)
            | Self::FingerprintMismatch { .. }
            | Self::InvalidFingerprint(_)
            | Self::InsecureUrl(_)
            | Self::UnexpectedContentEncoding(_) => true,
            Self::Decomposition { source, .. } | Self::StepFailed { source, .. } => {
                source.is_trust_failure()
            }
            _ => false,
        }
    }

    pub fn is_dependency_missing(&self) -> bool {
        match self {
            Self::DependencyMissing { .. } => true,
            Self::StepFailed { source, .. } => source.is_dependency_missing(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_action_message() {
        let err = Error::UnknownAction {
            name: "downlod".to_string(),
            suggestions: vec!["download".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "unknown action 'downlod' (did you mean: download?)"
        );

        let err = Error::UnknownAction {
            name: "zzz".to_string(),
            suggestions: vec![],
        };
        assert_eq!(err.to_string(), "unknown action 'zzz'");
    }

    #[test]
    fn test_dependency_missing_carries_command() {
        let err = Error::DependencyMissing {
            library: "zlib".to_string(),
            package: "zlib-dev".to_string(),
            command: "sudo apk add zlib-dev".to_string(),
            family: "alpine".to_string(),
        };
        assert!(err.is_dependency_missing());
        assert!(err.to_string().contains("sudo apk add zlib-dev"));
    }

    #[test]
    fn test_trust_failure_classification() {
        let err = Error::ChecksumMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(err.is_trust_failure());

        let wrapped = Error::Decomposition {
            action: "download".to_string(),
            source: Box::new(err),
        };
        assert!(wrapped.is_trust_failure());

        let step = Error::StepFailed {
            step: 2,
            action: "download_file".to_string(),
            source: Box::new(wrapped),
        };
        assert!(step.is_trust_failure());
        assert!(step.to_string().starts_with("step 2 (download_file) failed: "));

        assert!(!Error::Cancelled.is_trust_failure());
    }

    #[test]
    fn test_missing_eval_deps_message() {
        let err = Error::MissingEvalDependencies(vec!["nodejs".to_string(), "go".to_string()]);
        assert_eq!(
            err.to_string(),
            "missing eval-time dependencies: nodejs, go (install with: tsuku install nodejs)"
        );
    }
}
