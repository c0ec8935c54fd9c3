//! Intarsio CMS Kernel Library
//!
//! This library exposes kernel internals for integration testing.
//! The main entry point for running the server is the `intarsio` binary.

pub mod config;
pub mod content;
pub mod error;
pub mod lockout;
pub mod media;
pub mod metrics;
pub mod models;
pub mod permissions;
