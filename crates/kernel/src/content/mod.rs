//! Content management.
//!
//! This module provides:
//! - CollectionRegistry: cached collection definitions
//! - DocumentService: document CRUD with media reference reconciliation

pub mod document_service;
pub mod registry;

pub use document_service::{DocumentInput, DocumentService, SaveOutcome};
pub use registry::CollectionRegistry;
