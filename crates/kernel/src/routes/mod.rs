//! HTTP route handlers.

pub mod auth;
pub mod collections;
pub mod document;
pub mod files;
pub mod front;
pub mod health;
pub mod helpers;
pub mod media;
pub mod metrics;
pub mod signup;
pub mod token;
