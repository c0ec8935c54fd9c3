//! Front page: session bootstrap and preference action.
//!
//! The front page never renders content itself. An unauthenticated visitor
//! is sent to the login form; an authenticated one is sent to the first
//! collection their role may read.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::{debug, error};

use crate::routes::helpers::{found, require_login};
use crate::state::AppState;

/// Session key for the UI theme preference.
const SESSION_THEME: &str = "theme";

/// Session key for the preferred content language.
const SESSION_LANGUAGE: &str = "language";

/// Front page bootstrap.
///
/// GET /
/// - No authenticated user: redirect to /user/login
/// - No readable collection: 404
/// - Otherwise: redirect to /{default language}/{first readable collection}
async fn front(State(state): State<AppState>, session: Session) -> Response {
    let user = match require_login(&state, &session).await {
        Ok(user) => user,
        Err(redirect) => return redirect,
    };

    let collections = match state.collections().list().await {
        Ok(collections) => collections,
        Err(e) => {
            error!(error = %e, "failed to load collections");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    // Default-allow filter: a collection is hidden only when its permission
    // map explicitly denies this role. Admins see everything.
    let first_readable = collections
        .into_iter()
        .find(|c| user.is_admin || c.role_can_read(&user.role));

    let Some(collection) = first_readable else {
        debug!(user_id = %user.id, role = %user.role, "no readable collection");
        return (
            StatusCode::NOT_FOUND,
            "You don't have access to any collection",
        )
            .into_response();
    };

    let language = &state.config().default_content_language;
    found(&format!("/{language}/{}", collection.name))
}

/// Preference form body.
#[derive(Debug, Deserialize)]
struct PreferenceForm {
    theme: Option<String>,
    language: Option<String>,
}

/// Preference action.
///
/// POST /
/// - Coerces theme to light/dark, validates the language against the
///   configured list (falling back to the default), stores both in the
///   session, then 303 back to /.
async fn preferences(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<PreferenceForm>,
) -> Response {
    let theme = match form.theme.as_deref() {
        Some("light") => "light",
        _ => "dark",
    };

    let config = state.config();
    let language = form
        .language
        .filter(|l| config.available_content_languages.contains(l))
        .unwrap_or_else(|| config.default_content_language.clone());

    if let Err(e) = session.insert(SESSION_THEME, theme).await {
        error!(error = %e, "failed to store theme preference");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
    }
    if let Err(e) = session.insert(SESSION_LANGUAGE, &language).await {
        error!(error = %e, "failed to store language preference");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
    }

    debug!(theme = %theme, language = %language, "preferences stored");

    // 303 See Other: the browser re-fetches / with GET.
    Redirect::to("/").into_response()
}

/// Create the front page router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(front).post(preferences))
}
