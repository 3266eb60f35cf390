use axum::{
    extract::{Extension, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::error::AppError;
use crate::token::TokenKeys;

/// Require a valid session token and expose its [`Claims`](crate::token::Claims)
/// to handlers as a request extension.
pub async fn auth_middleware(
    Extension(keys): Extension<TokenKeys>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(TypedHeader(Authorization(bearer))) = bearer else {
        return AppError::Unauthorized("Authorization header missing".to_string()).into_response();
    };

    match keys.verify_session(bearer.token()) {
        Ok(claims) => {
            tracing::Span::current().record("user_id", claims.sub);
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => {
            tracing::debug!("Rejected session token: {}", e);
            AppError::Forbidden("Invalid or expired token".to_string()).into_response()
        }
    }
}
