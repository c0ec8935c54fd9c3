//! Registration token management routes.
//!
//! Tokens invite a user to sign up: the plain token is mailed out once and
//! only its hash is stored. All endpoints are admin-only; the edit endpoint
//! keeps the wire contract of the token administration UI
//! (`tokenId`/`newTokenData` field names, fixed messages per status).

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::RegistrationToken;
use crate::models::registration_token::{DEFAULT_TOKEN_VALIDITY_HOURS, UpdateRegistrationToken};
use crate::models::User;
use crate::permissions::ResourceContext;
use crate::state::AppState;

/// Permission context id for token administration.
const TOKEN_ADMIN_CONTEXT: &str = "registration_tokens";

/// Body of the token edit endpoint. Field names are fixed wire contract.
#[derive(Debug, Deserialize)]
pub struct EditTokenRequest {
    #[serde(rename = "tokenId")]
    pub token_id: String,
    #[serde(rename = "newTokenData")]
    pub new_token_data: NewTokenData,
}

/// Partial token update payload.
#[derive(Debug, Deserialize)]
pub struct NewTokenData {
    pub email: Option<String>,
    /// RFC 3339 timestamp.
    pub expires: Option<String>,
    #[serde(rename = "type")]
    pub token_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenActionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type TokenError = (StatusCode, Json<ErrorResponse>);

fn token_error(status: StatusCode, message: impl Into<String>) -> TokenError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Reject non-admins with the endpoint's fixed 403 message.
async fn require_token_admin(
    state: &AppState,
    session: &Session,
) -> Result<User, TokenError> {
    let user_id: Option<Uuid> = session
        .get(crate::routes::helpers::SESSION_USER_ID)
        .await
        .ok()
        .flatten();

    let user = match user_id {
        Some(id) => User::find_by_id(state.db(), id).await.map_err(|e| {
            error!(error = %e, "failed to load user for token admin check");
            token_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        })?,
        None => None,
    };

    let Some(user) = user else {
        return Err(token_error(
            StatusCode::FORBIDDEN,
            "Unauthorized to edit registration tokens",
        ));
    };

    let allowed = state
        .permissions()
        .check(
            &user,
            &ResourceContext::System {
                context_id: TOKEN_ADMIN_CONTEXT,
            },
        )
        .await
        .map_err(|e| {
            error!(error = %e, "permission check failed");
            token_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        })?;

    if allowed {
        Ok(user)
    } else {
        Err(token_error(
            StatusCode::FORBIDDEN,
            "Unauthorized to edit registration tokens",
        ))
    }
}

/// Edit a registration token.
///
/// PUT /api/user/token
///
/// The permission check runs before the body is even parsed, so an
/// unauthorized caller with a malformed body still gets the 403. Shape
/// violations are a 400 naming the offending field; adapter failures are a
/// 500 with a fixed message.
async fn edit_token(
    State(state): State<AppState>,
    session: Session,
    body: Result<Json<EditTokenRequest>, JsonRejection>,
) -> Result<Json<TokenActionResponse>, TokenError> {
    require_token_admin(&state, &session).await?;

    let Json(request) = body.map_err(|e| {
        warn!(error = %e, "invalid token edit payload");
        token_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid input: {}", e.body_text()),
        )
    })?;

    let update = validate_edit(&request)
        .map_err(|message| token_error(StatusCode::BAD_REQUEST, message))?;

    let token_id = parse_token_id(&request.token_id)
        .map_err(|message| token_error(StatusCode::BAD_REQUEST, message))?;

    match RegistrationToken::update(state.db(), token_id, update).await {
        Ok(Some(_)) => {
            info!(token_id = %token_id, "registration token updated");
        }
        Ok(None) => {
            // The original adapter's update matched nothing and still
            // reported success; keep that observable behavior.
            warn!(token_id = %token_id, "token edit matched no record");
        }
        Err(e) => {
            error!(error = %e, token_id = %token_id, "failed to update token");
            return Err(token_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to update token",
            ));
        }
    }

    Ok(Json(TokenActionResponse {
        success: true,
        message: "Token updated successfully".to_string(),
    }))
}

/// Validate the edit payload shape into a typed partial update.
fn validate_edit(request: &EditTokenRequest) -> Result<UpdateRegistrationToken, String> {
    let mut update = UpdateRegistrationToken::default();

    if let Some(email) = &request.new_token_data.email {
        if !looks_like_email(email) {
            return Err(format!("Invalid input: invalid email address '{email}'"));
        }
        update.email = Some(email.clone());
    }

    if let Some(expires) = &request.new_token_data.expires {
        let parsed: DateTime<Utc> = expires
            .parse()
            .map_err(|_| format!("Invalid input: expires '{expires}' is not an RFC 3339 date"))?;
        update.expires_at = Some(parsed);
    }

    if let Some(token_type) = &request.new_token_data.token_type {
        if token_type.trim().is_empty() {
            return Err("Invalid input: type must not be empty".to_string());
        }
        update.token_type = Some(token_type.clone());
    }

    Ok(update)
}

fn parse_token_id(raw: &str) -> Result<Uuid, String> {
    raw.parse()
        .map_err(|_| format!("Invalid input: tokenId '{raw}' is not a valid id"))
}

/// Shape check only; deliverability is the mail server's problem.
fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.ends_with('.'),
        None => false,
    }
}

/// Create-token request body.
#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    pub email: String,
    /// Role granted at signup (default "user").
    #[serde(rename = "type")]
    pub token_type: Option<String>,
    pub expires_in_hours: Option<i64>,
}

/// Create-token response. The plain token appears here exactly once.
#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    pub id: Uuid,
    pub token: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

/// Create a registration token and mail the invitation.
///
/// POST /api/user/token
async fn create_token(
    State(state): State<AppState>,
    session: Session,
    body: Result<Json<CreateTokenRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateTokenResponse>), TokenError> {
    require_token_admin(&state, &session).await?;

    let Json(request) = body.map_err(|e| {
        token_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid input: {}", e.body_text()),
        )
    })?;

    if !looks_like_email(&request.email) {
        return Err(token_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid input: invalid email address '{}'", request.email),
        ));
    }

    let token_type = request.token_type.as_deref().unwrap_or("user");
    let validity = request
        .expires_in_hours
        .filter(|h| *h > 0)
        .unwrap_or(DEFAULT_TOKEN_VALIDITY_HOURS);

    let (record, plain) =
        RegistrationToken::create(state.db(), &request.email, token_type, validity)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to create registration token");
                token_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create token")
            })?;

    if let Some(email) = state.email() {
        if let Err(e) = email
            .send_registration_invite(
                &record.email,
                &plain,
                &state.config().site_name,
                record.expires_at,
            )
            .await
        {
            // The token exists and is shown in the response; delivery can
            // be retried by hand.
            warn!(error = %e, email = %record.email, "failed to send invitation email");
        }
    }

    info!(token_id = %record.id, email = %record.email, "registration token created");

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            id: record.id,
            token: plain,
            email: record.email,
            expires_at: record.expires_at,
        }),
    ))
}

/// Token list entry; the hash never leaves the server.
#[derive(Debug, Serialize)]
pub struct TokenListItem {
    pub id: Uuid,
    pub email: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

/// List registration tokens.
///
/// GET /api/user/tokens
async fn list_tokens(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<Vec<TokenListItem>>, TokenError> {
    require_token_admin(&state, &session).await?;

    let tokens = RegistrationToken::list(state.db()).await.map_err(|e| {
        error!(error = %e, "failed to list registration tokens");
        token_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list tokens")
    })?;

    let items = tokens
        .into_iter()
        .map(|t| TokenListItem {
            id: t.id,
            email: t.email,
            token_type: t.token_type,
            expires_at: t.expires_at,
            used_at: t.used_at,
            created: t.created,
        })
        .collect();

    Ok(Json(items))
}

/// Delete a registration token.
///
/// DELETE /api/user/token/{id}
async fn delete_token(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, TokenError> {
    require_token_admin(&state, &session).await?;

    let deleted = RegistrationToken::delete(state.db(), id).await.map_err(|e| {
        error!(error = %e, token_id = %id, "failed to delete registration token");
        token_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete token")
    })?;

    if deleted {
        info!(token_id = %id, "registration token deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(token_error(StatusCode::NOT_FOUND, "Token not found"))
    }
}

/// Create the registration token router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/user/token", put(edit_token).post(create_token))
        .route("/api/user/tokens", get(list_tokens))
        .route("/api/user/token/{id}", delete(delete_token))
}
