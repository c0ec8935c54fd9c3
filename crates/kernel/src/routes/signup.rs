//! Invitation signup routes.
//!
//! Invitees land here from the link in a registration email. The token is
//! validated against its stored hash, the account is created with the role
//! the token grants, and the token is burned in the same request.

use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::{error, info, warn};

use crate::form::csrf::{generate_csrf_token, verify_csrf_token};
use crate::models::{CreateUser, RegistrationToken, User};
use crate::routes::helpers::{SESSION_USER_ID, html_escape};
use crate::state::AppState;

/// Minimum password length for new accounts.
const MIN_PASSWORD_LENGTH: usize = 8;

/// Signup page query string.
#[derive(Debug, Deserialize)]
struct SignupQuery {
    invite_token: Option<String>,
}

/// Signup form body.
#[derive(Debug, Deserialize)]
struct SignupFormRequest {
    #[serde(rename = "_token")]
    csrf_token: Option<String>,
    invite_token: String,
    name: String,
    password: String,
}

/// Typed signup error for message mapping.
#[derive(Debug)]
enum SignupError {
    /// Token unknown, expired, or already used.
    InvalidToken,
    /// The invited email already has an account.
    AccountExists,
    /// Internal server error.
    Internal,
}

impl SignupError {
    fn message(&self) -> &'static str {
        match self {
            SignupError::InvalidToken => "Invalid or expired invitation token.",
            SignupError::AccountExists => "An account for this invitation already exists.",
            SignupError::Internal => "Internal server error",
        }
    }
}

/// Signup form handler.
///
/// GET /signup?invite_token=…
async fn signup_form(session: Session, Query(query): Query<SignupQuery>) -> Response {
    let csrf_token = match generate_csrf_token(&session).await {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "failed to generate CSRF token");
            return Html("<h1>Error</h1><p>Failed to generate form token</p>".to_string())
                .into_response();
        }
    };

    let invite_token = query.invite_token.as_deref().unwrap_or("");
    Html(render_signup_page(&csrf_token, invite_token, None)).into_response()
}

/// Signup submit handler.
///
/// POST /signup (form data)
async fn signup_submit(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<SignupFormRequest>,
) -> Response {
    // Verify CSRF token
    if let Some(token) = &form.csrf_token {
        match verify_csrf_token(&session, token).await {
            Ok(true) => {}
            _ => {
                return render_signup_error(
                    &session,
                    &form.invite_token,
                    "Invalid form token. Please try again.",
                )
                .await;
            }
        }
    }

    if let Err(message) = validate_signup(&form.name, &form.password) {
        return render_signup_error(&session, &form.invite_token, message).await;
    }

    match redeem_invitation(&state, &session, &form).await {
        Ok(()) => Redirect::to("/").into_response(),
        Err(e) => render_signup_error(&session, &form.invite_token, e.message()).await,
    }
}

/// Consume the invitation: validate the token, create the user, burn the
/// token, and log the new user in.
async fn redeem_invitation(
    state: &AppState,
    session: &Session,
    form: &SignupFormRequest,
) -> Result<(), SignupError> {
    let token = match RegistrationToken::find_valid(state.db(), &form.invite_token).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            warn!("signup attempted with invalid or expired token");
            return Err(SignupError::InvalidToken);
        }
        Err(e) => {
            error!(error = %e, "database error during token lookup");
            return Err(SignupError::Internal);
        }
    };

    match User::find_by_mail(state.db(), &token.email).await {
        Ok(Some(_)) => return Err(SignupError::AccountExists),
        Ok(None) => {}
        Err(e) => {
            error!(error = %e, "database error during signup");
            return Err(SignupError::Internal);
        }
    }

    let user = User::create(
        state.db(),
        CreateUser {
            name: form.name.trim().to_string(),
            password: form.password.clone(),
            mail: token.email.clone(),
            role: token.token_type.clone(),
            is_admin: false,
        },
    )
    .await
    .map_err(|e| {
        error!(error = %e, "failed to create user from invitation");
        SignupError::Internal
    })?;

    // The account exists now; a mark_used failure leaves a token that can
    // no longer be redeemed (the email is taken), so log and continue.
    if let Err(e) = RegistrationToken::mark_used(state.db(), token.id).await {
        error!(error = %e, token_id = %token.id, "failed to mark invitation token used");
    }

    session
        .insert(SESSION_USER_ID, user.id)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to insert user_id into session");
            SignupError::Internal
        })?;

    info!(user_id = %user.id, role = %user.role, "invited user registered");
    Ok(())
}

/// Validate the user-supplied signup fields.
fn validate_signup(name: &str, password: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Name is required.");
    }
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err("Password must be at least 8 characters.");
    }
    Ok(())
}

/// Render signup form with error message.
async fn render_signup_error(session: &Session, invite_token: &str, error: &str) -> Response {
    let csrf_token = generate_csrf_token(session).await.unwrap_or_default();
    Html(render_signup_page(&csrf_token, invite_token, Some(error))).into_response()
}

/// The signup page markup.
fn render_signup_page(csrf_token: &str, invite_token: &str, error: Option<&str>) -> String {
    let error_block = error
        .map(|e| format!("<p style=\"color: #b00\">{}</p>", html_escape(e)))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html><head><title>Complete your registration</title></head>
<body style="font-family: sans-serif; max-width: 400px; margin: 100px auto; padding: 2rem;">
<h1>Complete your registration</h1>
{error_block}
<form method="post" action="/signup">
<input type="hidden" name="_token" value="{csrf_token}">
<p><label>Invitation token<br><input type="text" name="invite_token" value="{}" required></label></p>
<p><label>Name<br><input type="text" name="name" required></label></p>
<p><label>Password<br><input type="password" name="password" minlength="{MIN_PASSWORD_LENGTH}" required></label></p>
<p><button type="submit">Create account</button></p>
</form>
</body></html>"#,
        html_escape(invite_token)
    )
}

/// Create the signup router.
pub fn router() -> Router<AppState> {
    Router::new().route("/signup", get(signup_form).post(signup_submit))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_signup() {
        assert!(validate_signup("Ada", "long-enough-pw").is_ok());
        assert_eq!(validate_signup("", "long-enough-pw"), Err("Name is required."));
        assert_eq!(validate_signup("   ", "long-enough-pw"), Err("Name is required."));
        assert_eq!(
            validate_signup("Ada", "short"),
            Err("Password must be at least 8 characters.")
        );
    }

    #[test]
    fn test_signup_page_carries_token() {
        let page = render_signup_page("csrf123", "invite456", None);
        assert!(page.contains("name=\"_token\" value=\"csrf123\""));
        assert!(page.contains("name=\"invite_token\" value=\"invite456\""));
        assert!(!page.contains("color: #b00"));
    }

    #[test]
    fn test_signup_page_escapes_token_and_error() {
        let page = render_signup_page("csrf", "\"><script>", Some("<b>bad</b>"));
        assert!(!page.contains("\"><script>"));
        assert!(page.contains("&quot;&gt;&lt;script&gt;"));
        assert!(page.contains("&lt;b&gt;bad&lt;/b&gt;"));
    }
}
