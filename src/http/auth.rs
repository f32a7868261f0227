//! Bearer-JWT authentication middleware.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ApiError;
use super::AppState;

/// Claims carried by the access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
    /// The authenticated user id.
    pub sub: String,
    /// The user's email.
    #[serde(default)]
    pub email: String,
    /// Role labels.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// The authenticated caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The caller's user id.
    pub id: Uuid,
    /// The caller's email.
    pub email: String,
    /// Role labels from the token.
    pub roles: Vec<String>,
}

/// Verify the `Authorization: Bearer <jwt>` header and stash the caller
/// into request extensions.
pub(super) async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let token = header
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::Unauthorized)?;

    let claims = decode_claims(token, &state.jwt_secret).ok_or(ApiError::Unauthorized)?;
    let id = Uuid::parse_str(&claims.sub).map_err(|_| ApiError::Unauthorized)?;

    request.extensions_mut().insert(AuthUser {
        id,
        email: claims.email,
        roles: claims.roles,
    });
    Ok(next.run(request).await)
}

fn decode_claims(token: &str, secret: &str) -> Option<AuthClaims> {
    jsonwebtoken::decode::<AuthClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .ok()
    .map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    fn token(secret: &str, sub: &str, exp_offset: i64) -> String {
        let claims = AuthClaims {
            sub: sub.into(),
            email: "user@example.com".into(),
            roles: vec!["member".into()],
            exp: chrono::Utc::now().timestamp() + exp_offset,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trips() {
        let sub = Uuid::new_v4().to_string();
        let token = token("secret", &sub, 3600);
        let claims = decode_claims(&token, "secret").unwrap();
        assert_eq!(claims.sub, sub);
        assert_eq!(claims.email, "user@example.com");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = token("secret", "abc", 3600);
        assert!(decode_claims(&token, "other").is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = token("secret", "abc", -3600);
        assert!(decode_claims(&token, "secret").is_none());
    }
}
