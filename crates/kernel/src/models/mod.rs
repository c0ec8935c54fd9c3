//! Database models.

pub mod collection;
pub mod document;
pub mod media_image;
pub mod registration_token;
pub mod role;
pub mod user;

pub use collection::Collection;
pub use document::Document;
pub use media_image::MediaImage;
pub use registration_token::RegistrationToken;
pub use role::Role;
pub use user::{CreateUser, User};
