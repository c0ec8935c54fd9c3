//! Media file serving.
//!
//! Serves stored media from the local media directory. Files are
//! content-addressed on disk, so they never change after upload and can be
//! cached aggressively.

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::fs;
use tracing::warn;

use crate::state::AppState;

/// Create the media files router.
pub fn router() -> Router<AppState> {
    Router::new().route("/files/{*path}", get(serve_media))
}

/// Serve a stored media file.
///
/// GET /files/{*path}
async fn serve_media(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    // Security: prevent path traversal
    let path = path.trim_start_matches('/');
    if path.contains("..") || path.contains('\0') {
        return not_found();
    }

    let file_path = state.config().media_dir.join(path);

    let content = match fs::read(&file_path).await {
        Ok(content) => content,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %file_path.display(), error = %e, "failed to read media file");
            }
            return not_found();
        }
    };

    let content_type = mime_from_path(&file_path);

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            // Stored files are immutable, cache for a day
            (header::CACHE_CONTROL, "public, max-age=86400"),
        ],
        content,
    )
        .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

fn mime_from_path(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("avif") => "image/avif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_from_path() {
        assert_eq!(
            mime_from_path(std::path::Path::new("a/b/photo.webp")),
            "image/webp"
        );
        assert_eq!(
            mime_from_path(std::path::Path::new("note.txt")),
            "application/octet-stream"
        );
        assert_eq!(
            mime_from_path(std::path::Path::new("noext")),
            "application/octet-stream"
        );
    }
}
