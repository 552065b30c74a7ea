//! Error handling for the shadow-execution transformer
//!
//! Structured, per-phase error types with source coordinates, following §7
//! of the design: annotation errors, semantic errors, capability errors and
//! verifier errors are kept distinct so callers can match on failure mode.

use std::fmt;
use thiserror::Error;

/// Source location information for error reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(file: String, line: usize, column: usize) -> Self {
        Self { file, line, column }
    }

    pub fn unknown() -> Self {
        Self {
            file: "<unknown>".to_string(),
            line: 0,
            column: 0,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Errors in the two annotation strings every transformable function must
/// open with (§3: adjacency string, parameter-distances string) and in the
/// per-`Lap` sampling annotation.
#[derive(Error, Debug, Clone)]
pub enum AnnotationError {
    #[error("function body must begin with two string-literal annotations at {location}")]
    MissingParameterAnnotation { location: SourceLocation },

    #[error("adjacency annotation must be ALL_DIFFER or ONE_DIFFER, found '{found}' at {location}")]
    InvalidAdjacency { found: String, location: SourceLocation },

    #[error("malformed parameter distance annotation '{text}' at {location}")]
    IllegalParameterAnnotation { text: String, location: SourceLocation },

    #[error("annotated aligned and shadow distances must be identical for parameter '{name}' ({aligned} != {shadow}) at {location}")]
    AsymmetricParameterDistance {
        name: String,
        aligned: String,
        shadow: String,
        location: SourceLocation,
    },

    #[error("parameter '{name}' was not annotated with a distance at {location}")]
    UnannotatedParameter { name: String, location: SourceLocation },

    #[error("Lap(..) call is missing its selector/eta-distance string annotation at {location}")]
    MissingSamplingAnnotation { location: SourceLocation },

    #[error("malformed sampling annotation '{text}' at {location}")]
    IllegalSamplingAnnotation { text: String, location: SourceLocation },
}

/// Errors raised by the typing rules themselves (§4.7 failure modes).
#[derive(Error, Debug, Clone)]
pub enum SemanticError {
    #[error("aligned distance of returned expression '{expr}' is not zero (got {distance}) at {location}")]
    ReturnDistanceNotZero {
        expr: String,
        distance: String,
        location: SourceLocation,
    },

    #[error("sampling command under a diverging path condition is not permitted at {location}")]
    SamplingMisplaced { location: SourceLocation },

    #[error("eta-distance annotation '{eta_distance}' is not injective under the adjacency precondition at {location}")]
    NonInjectiveAnnotation {
        eta_distance: String,
        location: SourceLocation,
    },
}

/// Errors for language constructs outside the restricted AST of §3.
#[derive(Error, Debug, Clone)]
pub enum CapabilityError {
    #[error("unsupported construct: {construct} at {location}")]
    UnsupportedConstruct { construct: String, location: SourceLocation },

    #[error("arrays are only supported as the read-only query parameter, not inside branch bodies, at {location}")]
    ArrayInBranch { location: SourceLocation },

    #[error("parent of statement is not a Compound block ({parent_kind}) at {location}")]
    NonCompoundParent { parent_kind: String, location: SourceLocation },

    #[error("function calls are restricted to Lap/assume/assert/havoc, found '{name}' at {location}")]
    UnsupportedCall { name: String, location: SourceLocation },
}

/// Errors surfaced by the external verifier (§6.3, §7).
#[derive(Error, Debug, Clone)]
pub enum VerifierError {
    #[error("verifier backend '{backend}' timed out after {seconds}s")]
    Timeout { backend: String, seconds: u64 },

    #[error("no configured verifier backend is available")]
    Unavailable,

    #[error("verifier backend '{backend}' failed: {diagnostics}")]
    BackendFailed { backend: String, diagnostics: String },
}

/// Top-level error type unifying every phase (mirrors a compiler's top-level
/// error enum: each phase's errors convert in via `#[from]`).
#[derive(Error, Debug, Clone)]
pub enum TransformError {
    #[error("annotation error: {0}")]
    Annotation(#[from] AnnotationError),

    #[error("semantic error: {0}")]
    Semantic(#[from] SemanticError),

    #[error("unsupported construct: {0}")]
    Capability(#[from] CapabilityError),

    #[error("verifier error: {0}")]
    Verifier(#[from] VerifierError),

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<std::io::Error> for TransformError {
    fn from(err: std::io::Error) -> Self {
        TransformError::Io {
            message: err.to_string(),
        }
    }
}

/// Diagnostic severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// A diagnostic message with location and severity, used by the CLI to
/// render `TransformError`s consistently.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: Option<SourceLocation>,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn error(message: String, location: Option<SourceLocation>) -> Self {
        Self {
            severity: Severity::Error,
            message,
            location,
            help: None,
        }
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }
}

/// Renders a `TransformError` to stderr, optionally with ANSI colors.
pub struct ErrorReporter {
    use_colors: bool,
}

impl ErrorReporter {
    pub fn new(use_colors: bool) -> Self {
        Self { use_colors }
    }

    pub fn report(&self, error: &TransformError) {
        let diagnostic = self.to_diagnostic(error);
        self.report_diagnostic(&diagnostic);
    }

    fn to_diagnostic(&self, error: &TransformError) -> Diagnostic {
        match error {
            TransformError::Annotation(e) => Diagnostic::error(e.to_string(), None)
                .with_help("the first two statements of the function body must be string literals".to_string()),
            TransformError::Semantic(e) => Diagnostic::error(e.to_string(), None),
            TransformError::Capability(e) => Diagnostic::error(e.to_string(), None),
            TransformError::Verifier(e) => Diagnostic::error(e.to_string(), None),
            TransformError::Io { message } => Diagnostic::error(message.clone(), None),
            TransformError::Internal { message } => {
                Diagnostic::error(format!("internal error: {}", message), None)
                    .with_help("this is a bug in the transformer, please report it".to_string())
            }
        }
    }

    fn report_diagnostic(&self, diagnostic: &Diagnostic) {
        let severity_color = if self.use_colors {
            match diagnostic.severity {
                Severity::Error => "\x1b[31m",
                Severity::Warning => "\x1b[33m",
                Severity::Info => "\x1b[34m",
            }
        } else {
            ""
        };
        let reset = if self.use_colors { "\x1b[0m" } else { "" };

        if let Some(loc) = &diagnostic.location {
            eprintln!("{}{}{}: {} {}", severity_color, diagnostic.severity, reset, loc, diagnostic.message);
        } else {
            eprintln!("{}{}{}: {}", severity_color, diagnostic.severity, reset, diagnostic.message);
        }

        if let Some(help) = &diagnostic.help {
            eprintln!("  {} help: {}", if self.use_colors { "\x1b[32m=" } else { "=" }, help);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_location_display() {
        let loc = SourceLocation::new("noisy_max.c".to_string(), 10, 5);
        assert_eq!(loc.to_string(), "noisy_max.c:10:5");
    }

    #[test]
    fn transform_error_from_annotation() {
        let err: TransformError = AnnotationError::MissingParameterAnnotation {
            location: SourceLocation::unknown(),
        }
        .into();
        assert!(matches!(err, TransformError::Annotation(_)));
    }
}
