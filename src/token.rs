//! HS256 tokens: session tokens issued at login and embed tokens that
//! authorize playback of a single video.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Session lifetime.
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("token is for another video")]
    WrongVideo,
}

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i32,
    pub username: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn is_teacher(&self) -> bool {
        self.role == crate::entities::user::ROLE_TEACHER
    }
}

/// Claims carried by an embed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedClaims {
    pub vid: Uuid,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue_session(
        &self,
        user_id: i32,
        username: &str,
        role: &str,
    ) -> Result<String, TokenError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            role: role.to_string(),
            exp: now + SESSION_TTL.as_secs() as i64,
            iat: now,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn verify_session(&self, token: &str) -> Result<Claims, TokenError> {
        Ok(decode::<Claims>(token, &self.decoding, &Validation::default())?.claims)
    }

    pub fn issue_embed(&self, video_id: Uuid, ttl: Duration) -> Result<String, TokenError> {
        let now = chrono::Utc::now().timestamp();
        let claims = EmbedClaims {
            vid: video_id,
            exp: now + ttl.as_secs() as i64,
            iat: now,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Check an embed token and that it was issued for `video_id`.
    pub fn verify_embed(&self, token: &str, video_id: Uuid) -> Result<EmbedClaims, TokenError> {
        let claims = decode::<EmbedClaims>(token, &self.decoding, &Validation::default())?.claims;
        if claims.vid != video_id {
            return Err(TokenError::WrongVideo);
        }
        Ok(claims)
    }
}
