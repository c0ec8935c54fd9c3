//! Media management routes.
//!
//! These are the follow-up surface for the removal candidates a document
//! save returns: the client detaches the usage link it no longer wants,
//! then deletes the image once nothing references it. Deletion is refused
//! while any owner link remains.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use tower_sessions::Session;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::media::DeleteOutcome;
use crate::models::{MediaImage, User};
use crate::routes::helpers::SESSION_USER_ID;
use crate::state::AppState;

/// Create the media management router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/media/{id}", delete(delete_media))
        .route(
            "/api/media/{id}/usage/{document_id}",
            delete(remove_usage),
        )
        .route("/api/media/orphans", get(list_orphans))
}

async fn media_user(state: &AppState, session: &Session) -> AppResult<User> {
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

/// Delete a media image and its stored files.
///
/// DELETE /api/media/{id}
///
/// Refused while any document still references the image.
async fn delete_media(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let user = media_user(&state, &session).await?;

    let image = MediaImage::find_by_id(state.db(), id)
        .await?
        .ok_or(AppError::NotFound)?;
    if !user.is_admin && image.uploaded_by != user.id {
        return Err(AppError::PermissionDenied(
            "not allowed to delete media uploaded by someone else".to_string(),
        ));
    }

    match state.media().delete_media(id).await? {
        DeleteOutcome::Deleted => {
            info!(media_id = %id, user_id = %user.id, "media image deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        DeleteOutcome::NotFound => Err(AppError::NotFound),
        DeleteOutcome::StillInUse(count) => {
            warn!(media_id = %id, used_by = count, "media delete refused, still referenced");
            Err(AppError::Validation(format!(
                "media is still referenced by {count} document(s)"
            )))
        }
    }
}

/// Remove one document from one image's owner set.
///
/// DELETE /api/media/{id}/usage/{document_id}
///
/// The client calls this for each removal candidate a save returned before
/// attempting the delete itself.
async fn remove_usage(
    State(state): State<AppState>,
    session: Session,
    Path((id, document_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    media_user(&state, &session).await?;

    let removed = state.media().remove_usage(id, document_id).await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound)
    }
}

/// List images no document references, oldest first.
///
/// GET /api/media/orphans
async fn list_orphans(
    State(state): State<AppState>,
    session: Session,
) -> AppResult<Json<Vec<MediaImage>>> {
    let user = media_user(&state, &session).await?;
    if !user.is_admin {
        return Err(AppError::PermissionDenied(
            "not allowed to list orphaned media".to_string(),
        ));
    }

    let orphans = MediaImage::list_orphans(state.db(), 100).await?;
    Ok(Json(orphans))
}
