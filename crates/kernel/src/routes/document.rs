//! Document route handlers.
//!
//! The save endpoint accepts one multipart request carrying the document
//! JSON, the files uploaded with this edit (one part per reference key), and
//! an optional list of media ids the client believes it removed. Everything
//! else is plain JSON.

use std::collections::BTreeMap;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_sessions::Session;
use tracing::warn;
use uuid::Uuid;

use crate::content::DocumentInput;
use crate::error::{AppError, AppResult};
use crate::media::reconcile::PendingUpload;
use crate::media::MAX_MEDIA_SIZE;
use crate::models::{Document, User};
use crate::routes::helpers::SESSION_USER_ID;
use crate::state::AppState;

/// Create the document router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/collection/{name}/document",
            post(save_document),
        )
        .route("/api/collection/{name}/documents", get(list_documents))
        .route(
            "/api/document/{id}",
            get(get_document).delete(delete_document),
        )
}

/// Resolve the session user for API calls, 401 when absent.
async fn api_user(state: &AppState, session: &Session) -> AppResult<User> {
    let user_id: Option<Uuid> = session.get(SESSION_USER_ID).await.ok().flatten();
    let Some(user_id) = user_id else {
        return Err(AppError::Unauthorized);
    };

    let user = User::find_by_id(state.db(), user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;

    if !user.is_active() {
        return Err(AppError::Unauthorized);
    }

    Ok(user)
}

/// Save response.
#[derive(Debug, Serialize)]
pub struct SaveDocumentResponse {
    pub document: Document,
    /// Media ids the client flagged as removed that really are unreferenced
    /// after this save.
    pub removed_media: Vec<Uuid>,
}

/// The parts of a save request, pulled from the multipart body.
#[derive(Default)]
struct SaveRequest {
    document: Option<DocumentInput>,
    removal_hints: Vec<Uuid>,
    uploads: BTreeMap<String, PendingUpload>,
}

/// Save a document.
///
/// POST /api/collection/{name}/document
/// Content-Type: multipart/form-data
///
/// Form fields:
/// - document: JSON document payload (title, status, fields; id on update)
/// - removed_media: optional JSON array of media ids the client removed
/// - any other part: an uploaded file, named by its reference key
async fn save_document(
    State(state): State<AppState>,
    session: Session,
    Path(name): Path<String>,
    multipart: Multipart,
) -> AppResult<Json<SaveDocumentResponse>> {
    let user = api_user(&state, &session).await?;

    let request = read_save_request(multipart).await?;
    let input = request
        .document
        .ok_or_else(|| AppError::Validation("missing document part".to_string()))?;

    let outcome = state
        .documents()
        .save(&user, &name, input, request.uploads, request.removal_hints)
        .await?;

    state.metrics().record_reconcile(&outcome.reconciled);

    Ok(Json(SaveDocumentResponse {
        document: outcome.document,
        removed_media: outcome.removal_candidates,
    }))
}

/// Drain the multipart body into a [`SaveRequest`].
async fn read_save_request(mut multipart: Multipart) -> AppResult<SaveRequest> {
    let mut request = SaveRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "document" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("unreadable document part: {e}")))?;
                let input: DocumentInput = serde_json::from_str(&text)
                    .map_err(|e| AppError::Validation(format!("invalid document JSON: {e}")))?;
                request.document = Some(input);
            }
            "removed_media" => {
                let text = field.text().await.map_err(|e| {
                    AppError::Validation(format!("unreadable removed_media part: {e}"))
                })?;
                request.removal_hints = parse_removal_hints(&text)?;
            }
            "" => {
                warn!("unnamed multipart field dropped");
            }
            _ => {
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| name.clone());
                let content_type = field
                    .content_type()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string());

                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("unreadable file part: {e}")))?;

                // Check size early, before the service touches storage.
                if bytes.len() > MAX_MEDIA_SIZE {
                    return Err(AppError::Validation(format!(
                        "file too large: {} bytes (max {} bytes)",
                        bytes.len(),
                        MAX_MEDIA_SIZE
                    )));
                }

                request.uploads.insert(
                    name,
                    PendingUpload {
                        filename,
                        content_type,
                        data: bytes.to_vec(),
                    },
                );
            }
        }
    }

    Ok(request)
}

/// Parse the `removed_media` part: a JSON array of UUID strings.
fn parse_removal_hints(text: &str) -> AppResult<Vec<Uuid>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AppError::Validation(format!("invalid removed_media JSON: {e}")))?;

    let Some(entries) = value.as_array() else {
        return Err(AppError::Validation(
            "removed_media must be a JSON array".to_string(),
        ));
    };

    entries
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    AppError::Validation(format!("removed_media entry {entry} is not a media id"))
                })
        })
        .collect()
}

/// Get a document.
///
/// GET /api/document/{id}
async fn get_document(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Document>> {
    let user = api_user(&state, &session).await?;
    let document = state.documents().fetch(&user, id).await?;
    Ok(Json(document))
}

/// List a collection's documents.
///
/// GET /api/collection/{name}/documents
async fn list_documents(
    State(state): State<AppState>,
    session: Session,
    Path(name): Path<String>,
) -> AppResult<Json<Vec<Document>>> {
    let user = api_user(&state, &session).await?;
    let documents = state.documents().list(&user, &name).await?;
    Ok(Json(documents))
}

/// Delete a document, detaching it from every media owner set.
///
/// DELETE /api/document/{id}
async fn delete_document(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let user = api_user(&state, &session).await?;
    state.documents().delete(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_removal_hints() {
        let hints = parse_removal_hints(
            r#"["0192d3e8-0000-7000-8000-000000000001",
                "0192d3e8-0000-7000-8000-000000000002"]"#,
        )
        .unwrap();
        assert_eq!(hints.len(), 2);
    }

    #[test]
    fn test_parse_removal_hints_empty_array() {
        assert!(parse_removal_hints("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_removal_hints_rejects_non_array() {
        assert!(parse_removal_hints(r#"{"id": "x"}"#).is_err());
        assert!(parse_removal_hints("not json").is_err());
    }

    #[test]
    fn test_parse_removal_hints_rejects_bad_entries() {
        assert!(parse_removal_hints(r#"["not-a-uuid"]"#).is_err());
        assert!(parse_removal_hints("[42]").is_err());
    }
}
