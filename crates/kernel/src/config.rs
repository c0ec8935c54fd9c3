//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, ensure};

/// A named resize variant generated for uploaded raster images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSize {
    /// Variant name, used as the key in a media record's variant map.
    pub name: String,
    /// Target width in pixels (height scales proportionally).
    pub width: u32,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Redis connection URL.
    pub redis_url: String,

    /// Public site name (default: "Intarsio").
    pub site_name: String,

    /// Public site URL for constructing links in emails.
    pub site_url: String,

    /// Canonical content language; reference markers are scanned in this
    /// language's markup (default: "en").
    pub default_content_language: String,

    /// Content languages documents may carry (default: "en,de").
    pub available_content_languages: Vec<String>,

    /// Path to the local media directory (default: ./media).
    pub media_dir: PathBuf,

    /// Base URL for serving stored media (default: /files).
    pub media_url: String,

    /// Resize variants generated per uploaded raster image
    /// (default: "sm:600,md:900,lg:1200").
    pub image_sizes: Vec<ImageSize>,

    /// Encode format for resized variants: "original" keeps the upload's
    /// format, otherwise "jpeg" or "webp" (default: "original").
    pub media_output_format: String,

    /// Encode quality for lossy variant formats, 1-100 (default: 80).
    pub media_output_quality: u8,

    /// Maximum request body size in bytes (default: 100 MB).
    pub body_size_limit: usize,

    /// CORS allowed origins (comma-separated, default: "*").
    pub cors_allowed_origins: Vec<String>,

    /// Cookie SameSite policy: "strict", "lax", or "none" (default: "strict").
    pub cookie_same_site: String,

    /// Email address for the initial admin account, created at startup when
    /// no users exist yet. When None, no account is created.
    pub admin_mail: Option<String>,

    /// Password for the initial admin account.
    pub admin_password: Option<String>,

    /// SMTP host for email delivery. When None, email is disabled.
    pub smtp_host: Option<String>,

    /// SMTP port (default: 587).
    pub smtp_port: u16,

    /// SMTP username for authentication.
    pub smtp_username: Option<String>,

    /// SMTP password for authentication.
    pub smtp_password: Option<String>,

    /// SMTP encryption mode: "starttls" (default), "tls", or "none".
    pub smtp_encryption: String,

    /// From address for outgoing email.
    pub smtp_from_email: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let site_name = env::var("SITE_NAME").unwrap_or_else(|_| "Intarsio".to_string());

        let site_url = env::var("SITE_URL").unwrap_or_else(|_| format!("http://localhost:{port}"));

        let default_content_language =
            env::var("DEFAULT_CONTENT_LANGUAGE").unwrap_or_else(|_| "en".to_string());

        let available_content_languages = parse_language_list(
            &env::var("AVAILABLE_CONTENT_LANGUAGES").unwrap_or_else(|_| "en,de".to_string()),
        )
        .context("AVAILABLE_CONTENT_LANGUAGES must be a comma-separated list of language codes")?;

        let media_dir = env::var("MEDIA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./media"));

        let media_url = env::var("MEDIA_URL").unwrap_or_else(|_| "/files".to_string());

        let image_sizes = parse_image_sizes(
            &env::var("IMAGE_SIZES").unwrap_or_else(|_| "sm:600,md:900,lg:1200".to_string()),
        )
        .context("IMAGE_SIZES must be a comma-separated list of name:width pairs")?;

        let media_output_format = env::var("MEDIA_OUTPUT_FORMAT")
            .unwrap_or_else(|_| "original".to_string())
            .to_lowercase();

        let media_output_quality = env::var("MEDIA_OUTPUT_QUALITY")
            .unwrap_or_else(|_| "80".to_string())
            .parse()
            .context("MEDIA_OUTPUT_QUALITY must be a number between 1 and 100")?;

        let body_size_limit = env::var("BODY_SIZE_LIMIT")
            .unwrap_or_else(|_| "104857600".to_string())
            .parse()
            .context("BODY_SIZE_LIMIT must be a valid byte count")?;

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["*".to_string()]);

        let cookie_same_site = env::var("COOKIE_SAME_SITE")
            .unwrap_or_else(|_| "strict".to_string())
            .to_lowercase();

        let admin_mail = env::var("ADMIN_MAIL").ok();
        let admin_password = env::var("ADMIN_PASSWORD").ok();

        let smtp_host = env::var("SMTP_HOST").ok();

        let smtp_port = env::var("SMTP_PORT")
            .unwrap_or_else(|_| "587".to_string())
            .parse()
            .context("SMTP_PORT must be a valid u16")?;

        let smtp_username = env::var("SMTP_USERNAME").ok();
        let smtp_password = env::var("SMTP_PASSWORD").ok();

        let smtp_encryption = env::var("SMTP_ENCRYPTION")
            .unwrap_or_else(|_| "starttls".to_string())
            .to_lowercase();

        let smtp_from_email =
            env::var("SMTP_FROM_EMAIL").unwrap_or_else(|_| "noreply@localhost".to_string());

        Ok(Self {
            port,
            database_url,
            database_max_connections,
            redis_url,
            site_name,
            site_url,
            default_content_language,
            available_content_languages,
            media_dir,
            media_url,
            image_sizes,
            media_output_format,
            media_output_quality,
            body_size_limit,
            cors_allowed_origins,
            cookie_same_site,
            admin_mail,
            admin_password,
            smtp_host,
            smtp_port,
            smtp_username,
            smtp_password,
            smtp_encryption,
            smtp_from_email,
        })
    }
}

/// Parse a comma-separated language list, e.g. `"en,de"`.
fn parse_language_list(raw: &str) -> Result<Vec<String>> {
    let languages: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    ensure!(!languages.is_empty(), "language list is empty");

    Ok(languages)
}

/// Parse a comma-separated list of `name:width` pairs, e.g. `"sm:600,md:900"`.
fn parse_image_sizes(raw: &str) -> Result<Vec<ImageSize>> {
    let mut sizes = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, width) = entry
            .split_once(':')
            .with_context(|| format!("image size entry '{entry}' is missing ':'"))?;

        let width: u32 = width
            .trim()
            .parse()
            .with_context(|| format!("image size entry '{entry}' has an invalid width"))?;

        ensure!(width > 0, "image size entry '{entry}' has zero width");

        sizes.push(ImageSize {
            name: name.trim().to_string(),
            width,
        });
    }

    Ok(sizes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_sizes() {
        let sizes = parse_image_sizes("sm:600,md:900,lg:1200").unwrap();
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes[0].name, "sm");
        assert_eq!(sizes[0].width, 600);
        assert_eq!(sizes[2].name, "lg");
        assert_eq!(sizes[2].width, 1200);
    }

    #[test]
    fn test_parse_image_sizes_tolerates_whitespace() {
        let sizes = parse_image_sizes(" sm : 600 , md:900 ").unwrap();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].name, "sm");
        assert_eq!(sizes[0].width, 600);
    }

    #[test]
    fn test_parse_image_sizes_rejects_malformed() {
        assert!(parse_image_sizes("sm=600").is_err());
        assert!(parse_image_sizes("sm:wide").is_err());
        assert!(parse_image_sizes("sm:0").is_err());
    }

    #[test]
    fn test_parse_image_sizes_empty_is_allowed() {
        // No variants configured means originals only.
        let sizes = parse_image_sizes("").unwrap();
        assert!(sizes.is_empty());
    }

    #[test]
    fn test_parse_language_list() {
        let langs = parse_language_list("en, de ,fr").unwrap();
        assert_eq!(langs, vec!["en", "de", "fr"]);
    }

    #[test]
    fn test_parse_language_list_rejects_empty() {
        assert!(parse_language_list("").is_err());
        assert!(parse_language_list(" , ").is_err());
    }
}
