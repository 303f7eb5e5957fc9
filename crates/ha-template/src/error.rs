//! Error types for template rendering

use thiserror::Error;

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors that can occur while compiling or rendering a template
///
/// Errors are plain messages so a failed render can be stored and compared
/// like any other result: two errors are equal when their messages are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum TemplateError {
    /// The template source does not parse
    #[error("invalid template syntax: {0}")]
    Syntax(String),

    /// The template parsed but failed while rendering
    #[error("failed to render template: {0}")]
    Render(String),
}

impl TemplateError {
    pub fn is_syntax(&self) -> bool {
        matches!(self, TemplateError::Syntax(_))
    }

    /// The underlying message without the category prefix
    pub fn message(&self) -> &str {
        match self {
            TemplateError::Syntax(message) | TemplateError::Render(message) => message,
        }
    }
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        let message = match err.detail() {
            Some(detail) => format!("{}: {}", err.kind(), detail),
            None => err.kind().to_string(),
        };
        match err.kind() {
            minijinja::ErrorKind::SyntaxError => TemplateError::Syntax(message),
            _ => TemplateError::Render(message),
        }
    }
}
