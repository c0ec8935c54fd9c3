//! Shared route helpers.

use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::{Html, IntoResponse, Response};
use tower_sessions::Session;
use uuid::Uuid;

use crate::models::User;
use crate::state::AppState;

/// Session key for user ID.
pub const SESSION_USER_ID: &str = "user_id";

/// A 302 Found redirect.
///
/// The bootstrap redirects are 302, not the 303 that `Redirect::to`
/// produces; 303 is reserved for the POST-then-refetch preference action.
pub fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

/// Require an authenticated user, or redirect to login.
///
/// Returns the [`User`] if one is logged in. Returns a redirect response if
/// the session contains no valid user id.
pub async fn require_login(state: &AppState, session: &Session) -> Result<User, Response> {
    let user_id: Option<Uuid> = session.get(SESSION_USER_ID).await.ok().flatten();

    if let Some(id) = user_id {
        if let Ok(Some(user)) = User::find_by_id(state.db(), id).await {
            if user.is_active() {
                return Ok(user);
            }
        }
    }

    Err(found("/user/login"))
}

/// Require an authenticated **admin** user, or redirect/reject.
///
/// Returns the admin [`User`] on success. Redirects to `/user/login` if the
/// session has no valid user. Returns 403 if the user exists but is not an
/// admin.
pub async fn require_admin(state: &AppState, session: &Session) -> Result<User, Response> {
    let user = require_login(state, session).await?;

    if user.is_admin {
        Ok(user)
    } else {
        Err((StatusCode::FORBIDDEN, Html("Access denied")).into_response())
    }
}

/// HTML-escape a string for safe output.
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_found_is_302_with_location() {
        let response = found("/user/login");
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers().get(LOCATION).unwrap();
        assert_eq!(location.to_str().unwrap(), "/user/login");
    }

    #[test]
    fn test_html_escape_special_chars() {
        assert_eq!(
            html_escape("<script>alert('xss')</script>"),
            "&lt;script&gt;alert(&#x27;xss&#x27;)&lt;/script&gt;"
        );
    }

    #[test]
    fn test_html_escape_ampersand() {
        assert_eq!(html_escape("a & b"), "a &amp; b");
    }

    #[test]
    fn test_html_escape_quotes() {
        assert_eq!(html_escape(r#"say "hello""#), "say &quot;hello&quot;");
    }

    #[test]
    fn test_html_escape_plain_text() {
        assert_eq!(html_escape("hello world"), "hello world");
    }
}
