use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};

use crate::api::handlers::ErrorResponse;
use crate::model::GithubId;

pub const GITHUB_ID_HEADER: &str = "x-github-id";
pub const GITHUB_USERNAME_HEADER: &str = "x-github-username";
pub const GITHUB_EMAIL_HEADER: &str = "x-github-email";

/// Caller identity taken from request headers:
/// - X-Github-Id: required GitHub account id
/// - X-Github-Username: optional login
/// - X-Github-Email: optional email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubActor {
    pub github_id: GithubId,
    pub username: Option<String>,
    pub email: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for GithubActor
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers).ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("X-Github-Id header is required")),
            )
        })
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Option<GithubActor> {
    let github_id = extract_header_value(headers, GITHUB_ID_HEADER)?
        .trim()
        .parse::<GithubId>()
        .ok()
        .filter(|id| *id > 0)?;
    Some(GithubActor {
        github_id,
        username: extract_header_value(headers, GITHUB_USERNAME_HEADER),
        email: extract_header_value(headers, GITHUB_EMAIL_HEADER),
    })
}

/// Extract header value as string
fn extract_header_value(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    #[test]
    fn test_actor_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(GITHUB_ID_HEADER),
            HeaderValue::from_static("5"),
        );
        headers.insert(
            HeaderName::from_static(GITHUB_USERNAME_HEADER),
            HeaderValue::from_static("octo"),
        );

        let actor = actor_from_headers(&headers).unwrap();
        assert_eq!(actor.github_id, 5);
        assert_eq!(actor.username.as_deref(), Some("octo"));
        assert_eq!(actor.email, None);
    }

    #[test]
    fn test_missing_or_invalid_id_is_rejected() {
        assert!(actor_from_headers(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(GITHUB_ID_HEADER),
            HeaderValue::from_static("octo"),
        );
        assert!(actor_from_headers(&headers).is_none());
    }
}
