//! Collection listing route.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_sessions::Session;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Collection, User};
use crate::routes::helpers::SESSION_USER_ID;
use crate::state::AppState;

/// Create the collections router.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/collections", get(list_collections))
}

/// Collection summary; the raw permission map stays server-side.
#[derive(Debug, Serialize)]
pub struct CollectionSummary {
    pub id: Uuid,
    pub name: String,
    pub label: String,
    pub fields: serde_json::Value,
    pub weight: i32,
    pub changed: DateTime<Utc>,
    /// Whether the current user may write documents here.
    pub writable: bool,
}

impl CollectionSummary {
    fn for_user(collection: Collection, user: &User) -> Self {
        let writable = user.is_admin || collection.role_can_write(&user.role);
        Self {
            id: collection.id,
            name: collection.name,
            label: collection.label,
            fields: collection.fields,
            weight: collection.weight,
            changed: collection.changed,
            writable,
        }
    }
}

/// List the collections the current user may read.
///
/// GET /api/collections
async fn list_collections(
    State(state): State<AppState>,
    session: Session,
) -> AppResult<Json<Vec<CollectionSummary>>> {
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

    let collections = state.collections().list().await?;

    let readable = collections
        .into_iter()
        .filter(|c| user.is_admin || c.role_can_read(&user.role))
        .map(|c| CollectionSummary::for_user(c, &user))
        .collect();

    Ok(Json(readable))
}
