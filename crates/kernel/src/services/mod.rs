//! Kernel services.

pub mod email;
