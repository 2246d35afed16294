// src/error.rs
//! Error handling for the whole crate.
//!
//! - One enum for every failure the paint shop and the car cache can report.
//! - `is_*` helpers so callers can branch on the kind without matching.
//! - Context chaining through [`Error::context`] and the [`crate::context`] traits.

use std::fmt;
use thiserror::Error;

/// Main error type. Send + Sync + 'static so it crosses the blocking decode pool.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A named texture entry or input slot has no data (or no model is loaded to read from).
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A model-targeted operation needed a loaded car and there is none.
    #[error("no model loaded")]
    NoModelLoaded,

    /// Container parse or GPU construction failed while loading a car.
    #[error("failed to load car `{id}`: {reason}")]
    LoadFailure { id: String, reason: String },

    /// An asynchronous load was cancelled or superseded.
    #[error("operation cancelled")]
    Cancelled,

    /// Image bytes could not be decoded or encoded.
    #[error("image error: {0}")]
    Decode(#[from] image::ImageError),

    /// I/O errors (bake output, container files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend failure: missing handle, readback failure, device loss.
    #[error("GPU error: {0}")]
    Gpu(String),

    /// A recipe that cannot be evaluated (bad layer reference, zero size).
    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),

    /// Configuration (de)serialization failures.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a custom error message.
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Create a formatted custom error (like `format!` but returns `Error`).
    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    #[inline]
    pub fn source_unavailable<S: Into<String>>(what: S) -> Self {
        Self::SourceUnavailable(what.into())
    }

    #[inline]
    pub fn gpu<S: Into<String>>(what: S) -> Self {
        Self::Gpu(what.into())
    }

    #[inline]
    pub fn load_failure<I: Into<String>, R: fmt::Display>(id: I, reason: R) -> Self {
        Self::LoadFailure {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// Add context to any error.
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Strips every layer of context and returns the underlying error.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    #[inline]
    pub fn is_source_unavailable(&self) -> bool {
        matches!(self.root(), Error::SourceUnavailable(_))
    }

    #[inline]
    pub fn is_no_model_loaded(&self) -> bool {
        matches!(self.root(), Error::NoModelLoaded)
    }

    #[inline]
    pub fn is_load_failure(&self) -> bool {
        matches!(self.root(), Error::LoadFailure { .. })
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self.root(), Error::Io(_))
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
