//! Form handling: CSRF protection for browser-submitted forms.

pub mod csrf;

pub use csrf::{generate_csrf_token, verify_csrf_token};
