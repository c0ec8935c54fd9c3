//! Authentication routes (login, logout).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::info;

use crate::form::csrf::{generate_csrf_token, verify_csrf_token};
use crate::models::User;
use crate::routes::helpers::{SESSION_USER_ID, html_escape};
use crate::state::AppState;

/// Login request body.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub mail: String,
    pub password: String,
}

/// Login response.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
}

/// Error response for authentication failures.
#[derive(Debug, Serialize)]
pub struct AuthError {
    pub error: String,
}

/// Typed login error for explicit status code mapping.
///
/// Avoids brittle substring matching on error strings by encoding
/// the error category in the enum variant.
#[derive(Debug)]
enum LoginError {
    /// Account temporarily locked due to too many failed attempts (429).
    Locked(String),
    /// Invalid credentials (401).
    InvalidCredentials,
    /// Internal server error (500).
    Internal(String),
}

impl LoginError {
    fn status_code(&self) -> StatusCode {
        match self {
            LoginError::Locked(_) => StatusCode::TOO_MANY_REQUESTS,
            LoginError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            LoginError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            LoginError::Locked(msg) => msg,
            LoginError::InvalidCredentials => "Invalid email or password",
            LoginError::Internal(msg) => msg,
        }
    }
}

impl std::fmt::Display for LoginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Login form handler.
///
/// GET /user/login
async fn login_form(session: Session) -> Response {
    let csrf_token = match generate_csrf_token(&session).await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "failed to generate CSRF token");
            return Html("<h1>Error</h1><p>Failed to generate form token</p>".to_string())
                .into_response();
        }
    };

    Html(render_login_page(&csrf_token, None)).into_response()
}

/// Form-based login request.
#[derive(Debug, Deserialize)]
pub struct LoginFormRequest {
    pub mail: String,
    pub password: String,
    #[serde(rename = "_token")]
    pub csrf_token: Option<String>,
}

/// Form-based login handler.
///
/// POST /user/login (form data)
async fn login_form_submit(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<LoginFormRequest>,
) -> Response {
    // Verify CSRF token
    if let Some(token) = &form.csrf_token {
        match verify_csrf_token(&session, token).await {
            Ok(true) => {}
            _ => {
                return render_login_error(&session, "Invalid form token. Please try again.")
                    .await;
            }
        }
    }

    let request = LoginRequest {
        mail: form.mail,
        password: form.password,
    };

    match do_login(&state, &session, &request).await {
        Ok(()) => Redirect::to("/").into_response(),
        Err(e) => render_login_error(&session, e.message()).await,
    }
}

/// Render login form with error message.
async fn render_login_error(session: &Session, error: &str) -> Response {
    let csrf_token = generate_csrf_token(session).await.unwrap_or_default();
    Html(render_login_page(&csrf_token, Some(error))).into_response()
}

/// The login page markup.
fn render_login_page(csrf_token: &str, error: Option<&str>) -> String {
    let error_block = error
        .map(|e| format!("<p style=\"color: #b00\">{}</p>", html_escape(e)))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html><head><title>Log in</title></head>
<body style="font-family: sans-serif; max-width: 400px; margin: 100px auto; padding: 2rem;">
<h1>Log in</h1>
{error_block}
<form method="post" action="/user/login">
<input type="hidden" name="_token" value="{csrf_token}">
<p><label>Email<br><input type="email" name="mail" required></label></p>
<p><label>Password<br><input type="password" name="password" required></label></p>
<p><button type="submit">Log in</button></p>
</form>
</body></html>"#
    )
}

/// Perform login and return typed error on failure.
async fn do_login(
    state: &AppState,
    session: &Session,
    request: &LoginRequest,
) -> Result<(), LoginError> {
    // Check if account is locked
    match state.lockout().active_lock(&request.mail).await {
        Ok(Some(lock)) => return Err(LoginError::Locked(lock.client_message())),
        Ok(None) => {}
        Err(e) => {
            tracing::error!(error = %e, "failed to check lockout status");
        }
    }

    let user = match User::find_by_mail(state.db(), &request.mail).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            let _ = state.lockout().record_failed_attempt(&request.mail).await;
            return Err(LoginError::InvalidCredentials);
        }
        Err(e) => {
            tracing::error!(error = %e, "database error during login");
            return Err(LoginError::Internal("Internal server error".to_string()));
        }
    };

    if !user.is_active() {
        let _ = state.lockout().record_failed_attempt(&request.mail).await;
        return Err(LoginError::InvalidCredentials);
    }

    if !user.verify_password(&request.password) {
        match state.lockout().record_failed_attempt(&request.mail).await {
            Ok((locked, _)) => {
                if locked {
                    return Err(LoginError::Locked(
                        "Account temporarily locked due to too many failed attempts.".to_string(),
                    ));
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to record failed attempt");
            }
        }
        return Err(LoginError::InvalidCredentials);
    }

    // Successful login - clear any failed attempts
    let _ = state.lockout().clear_attempts(&request.mail).await;

    if let Err(e) = User::touch_login(state.db(), user.id).await {
        tracing::warn!(error = %e, user_id = %user.id, "failed to update login timestamp");
    }

    session
        .insert(SESSION_USER_ID, user.id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to insert user_id into session");
            LoginError::Internal("Internal server error".to_string())
        })?;

    info!(user_id = %user.id, "user logged in");
    Ok(())
}

/// JSON login handler.
///
/// POST /user/login/json
/// - Delegates to `do_login` for all auth logic
/// - Maps typed `LoginError` variants to appropriate HTTP status codes
async fn login(
    State(state): State<AppState>,
    session: Session,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<AuthError>)> {
    match do_login(&state, &session, &request).await {
        Ok(()) => Ok(Json(LoginResponse {
            success: true,
            message: "Login successful".to_string(),
        })),
        Err(e) => {
            let status = e.status_code();
            Err((
                status,
                Json(AuthError {
                    error: e.message().to_string(),
                }),
            ))
        }
    }
}

/// Logout handler.
///
/// GET /user/logout
/// - Deletes session from Redis
/// - Clears session cookie
async fn logout(session: Session) -> Result<Json<LoginResponse>, (StatusCode, Json<AuthError>)> {
    session.delete().await.map_err(|e| {
        tracing::error!(error = %e, "failed to delete session");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AuthError {
                error: "Internal server error".to_string(),
            }),
        )
    })?;

    Ok(Json(LoginResponse {
        success: true,
        message: "Logout successful".to_string(),
    }))
}

/// Create the auth router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/user/login", get(login_form).post(login_form_submit))
        .route("/user/login/json", post(login))
        .route("/user/logout", get(logout))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_login_error_status_mapping() {
        assert_eq!(
            LoginError::Locked("locked".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            LoginError::InvalidCredentials.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            LoginError::Internal("oops".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_login_page_escapes_error() {
        let page = render_login_page("tok", Some("<script>bad</script>"));
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>bad"));
        assert!(page.contains(r#"value="tok""#));
    }
}
