//! Error types for the favicon cache
//!
//! This module provides error types for all subsystems:
//! - Index errors (per-host document-URL -> filename store)
//! - Image errors (decoding, encoding, validation)
//! - Fetch errors (one-shot icon downloads)
//!
//! All errors use the `thiserror` crate for minimal boilerplate and
//! proper error trait implementations.
//!
//! Almost every failure in this subsystem is absorbed internally and
//! converted to "no icon": a corrupt index self-heals, an unreadable file
//! reads as absent, a failed fetch ends the job. These types are the
//! plumbing between private helpers and the test surface, not a public
//! failure channel.

use thiserror::Error;

/// Result type alias for favicon cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the favicon cache
///
/// Each variant wraps a more specific error type for that subsystem.
#[derive(Error, Debug)]
pub enum Error {
  /// Per-host index load, parse or store error
  #[error("Index error: {0}")]
  Index(#[from] IndexError),

  /// Image decoding, encoding or validation error
  #[error("Image error: {0}")]
  Image(#[from] ImageError),

  /// Icon fetch error
  #[error("Fetch error: {0}")]
  Fetch(#[from] FetchError),

  /// I/O error (file reading, directory scans, etc.)
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Errors from the per-host icon index
#[derive(Error, Debug, Clone)]
pub enum IndexError {
  /// The document URL has no extractable server host
  #[error("document URL has no host: {url}")]
  NoHost { url: String },

  /// The index file did not parse as line-pairs. Self-healed at load by
  /// dropping the trailing line; surfaced only to tests and logs.
  #[error("corrupt index {path}: {reason}")]
  Corrupt { path: String, reason: String },
}

/// Errors from image decoding, encoding and payload validation
#[derive(Error, Debug, Clone)]
pub enum ImageError {
  /// Zero-length payload
  #[error("empty image payload")]
  EmptyPayload,

  /// The payload failed the content-type and signature checks
  #[error("payload is not image data")]
  NotAnImage,

  /// The decoder rejected the payload
  #[error("failed to decode image: {reason}")]
  DecodeFailed { reason: String },

  /// PNG serialization failed
  #[error("failed to encode PNG: {reason}")]
  EncodeFailed { reason: String },
}

/// Errors from the one-shot icon fetcher
#[derive(Error, Debug, Clone)]
pub enum FetchError {
  /// The icon or document URL was empty; the fetch was never started
  #[error("icon or document URL is empty")]
  EmptyUrl,

  /// Transport-level failure
  #[error("HTTP error fetching {url}: {reason}")]
  Http { url: String, reason: String },

  /// Redirect chain exceeded the hop limit
  #[error("too many redirects fetching {url}")]
  TooManyRedirects { url: String },

  /// Response body exceeded the configured size cap
  #[error("response for {url} exceeds {limit} bytes")]
  TooLarge { url: String, limit: usize },

  /// The fetch worker disappeared without reporting a terminal outcome
  #[error("fetch interrupted before completion")]
  Interrupted,
}
