//! Media management.
//!
//! This module provides:
//! - MediaStorage: filesystem-backed storage addressed by `local://` URIs
//! - MediaService: upload validation, variant generation, media records
//! - reconcile: image reference reconciliation for rich-text content

pub mod reconcile;
pub mod service;
pub mod storage;

pub use reconcile::{
    ImageReference, MediaPersistence, PendingUpload, ReconcileError, ReconcileOutcome, SavedMedia,
};
pub use service::{ALLOWED_MEDIA_TYPES, DeleteOutcome, MAX_MEDIA_SIZE, MediaService};
pub use storage::{LocalMediaStorage, MediaStorage};
