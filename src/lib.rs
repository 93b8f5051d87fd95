//! Manuscript Core Library
//!
//! Resolves digitized manuscripts exposed by heterogeneous library platforms
//! into a canonical page list, downloads the pages under per-source
//! constraints, and assembles them in manuscript order into one document.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`source`] - Immutable Source Descriptor Table (URL shape to source identity + capabilities)
//! - [`manifest`] - Canonical manifest model shared by every later stage
//! - [`resolver`] - Loader registry, IIIF normalizer, and pattern-extraction loaders
//! - [`download`] - Job orchestrator with retry/backoff, per-host caps, cancel and resume
//! - [`assembly`] - Reorder buffer and streaming PDF/CBZ writers
//! - [`db`] - Database connection and schema management
//! - [`config`] - Engine configuration and defaults

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod assembly;
pub mod config;
pub mod db;
pub mod download;
pub mod manifest;
pub mod resolver;
pub mod source;
mod user_agent;

// Re-export commonly used types
pub use assembly::{AssemblyError, AssemblyReport, Gap, OutputFormat, PageWrite};
pub use config::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, EngineConfig};
pub use db::Database;
pub use download::{
    EVENT_BUFFER, FailureType, FetchError, JobEvent, JobHandle, JobId, JobOptions, JobReport, JobStatus,
    Orchestrator, OrchestratorError, PageFailure, RetryDecision, RetryPolicy, classify_error,
    gaps_sidecar_path,
};
pub use manifest::{CanonicalManifest, ImageTarget, ManifestBuilder, ManifestError, PageDescriptor};
pub use resolver::{
    Loader, ManifestCache, ManifestRequest, ResolveContext, ResolveError, ResolverRegistry,
    build_default_registry,
};
pub use source::{Capabilities, CountPolicy, GeoBlockSignature, SourceDescriptor, Strategy};
