use std::path::PathBuf;
use thiserror::Error;

/// Error raised while evaluating template expressions and runtime
/// functions. Message-only; the interpreter attaches template context
/// when it surfaces one of these as a [`RenderError`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        EvalError {
            message: message.into(),
        }
    }
}

/// Result alias used by runtime functions and the interpreter core.
pub type EvalResult = Result<crate::value::Value, EvalError>;

/// Errors produced while turning an AST file into an executable
/// program.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("cannot read template file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode template AST {path}: {source}")]
    Ast {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An embedded expression could not be parsed or lowered.
    #[error("expression error in {template}: {message}")]
    Expression { template: String, message: String },

    /// The generated template text failed to parse. Carries the
    /// line-numbered source listing for diagnosis.
    #[error("template parse error in {template}: {message}\n{source_dump}")]
    Parse {
        template: String,
        message: String,
        source_dump: String,
    },

    /// A mixin was called but never defined. Fatal in interactive
    /// mode only; production compiles log a warning instead.
    #[error("mixin {name:?} called but not found in {template}")]
    UnresolvedMixin { template: String, name: String },
}

/// Errors produced while rendering a compiled template.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template {0} not found")]
    TemplateNotFound(String),

    /// Execution failed; the message carries the failing template's
    /// line-numbered source when the engine has it.
    #[error("execution of {template} failed: {message}\n{source_dump}")]
    Exec {
        template: String,
        message: String,
        source_dump: String,
    },

    /// The render was abandoned, either while waiting for an execution
    /// slot or because its deadline passed mid-render.
    #[error("render of {0} cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Compile(#[from] CompileError),
}
