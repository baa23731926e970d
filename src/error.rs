use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ScrnaseqError {
    #[error("not found: {0}")]
    #[diagnostic(code(scrnaseq::not_found))]
    NotFound(String),

    #[error("validation failed: {0}")]
    #[diagnostic(code(scrnaseq::validation))]
    Validation(String),

    #[error("unsupported object type: {0}")]
    #[diagnostic(code(scrnaseq::unsupported_type))]
    UnsupportedType(String),

    #[error("invalid dataset name: {0}")]
    InvalidName(String),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("gypsum request failed: {0}")]
    Http(String),

    #[error("gypsum returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("upload failed: {0}")]
    #[diagnostic(help("set abort_failed to false to keep the session open for diagnosis"))]
    Upload(String),

    #[error("metadata database error: {0}")]
    Database(String),

    #[error("object codec error: {0}")]
    Codec(String),

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
