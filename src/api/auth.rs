use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{Extension, Json},
    http::StatusCode,
    response::IntoResponse,
};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::json;

use crate::entities::user;
use crate::error::{AppError, AppResult, ValidationError};
use crate::token::TokenKeys;

#[derive(serde::Deserialize)]
pub struct RegisterRequest {
    username: String,
    password: String,
    role: String,
}

pub async fn register(
    Extension(db): Extension<DatabaseConnection>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<impl IntoResponse> {
    let username = payload.username.trim().to_string();
    let role = payload.role.trim().to_ascii_lowercase();
    if username.is_empty() || payload.password.is_empty() {
        return Err(ValidationError::Invalid("Username and password are required".to_string()).into());
    }
    if role.is_empty() || role.len() > 32 || !role.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::Invalid("Invalid role".to_string()).into());
    }

    let existing = user::Entity::find()
        .filter(user::Column::Username.eq(username.clone()))
        .one(&db)
        .await?;
    if existing.is_some() {
        tracing::Span::current()
            .record("action", "register_user_failed")
            .record("error", "duplicate_username");
        return Err(AppError::Conflict("User already exists".to_string()));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|_| AppError::Internal("Failed to hash password".to_string()))?
        .to_string();

    let new_user = user::ActiveModel {
        username: Set(username),
        password_hash: Set(password_hash),
        role: Set(role),
        created_at: Set(chrono::Utc::now().naive_utc()),
        ..Default::default()
    };

    let user = new_user.insert(&db).await.map_err(|e| {
        // Lost a race with a concurrent registration.
        if e.to_string().contains("duplicate key value violates unique constraint") {
            AppError::Conflict("User already exists".to_string())
        } else {
            AppError::Database(e)
        }
    })?;

    tracing::Span::current()
        .record("action", "register_user")
        .record("user_id", user.id)
        .record("business_event", "User registered successfully");
    metrics::counter!("secureteach_users_registered_total", "role" => user.role.clone()).increment(1);
    crate::metrics::increment_users();

    Ok((
        StatusCode::CREATED,
        Json(json!({"message": "User registered successfully", "id": user.id})),
    ))
}

#[derive(serde::Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

pub async fn login(
    Extension(db): Extension<DatabaseConnection>,
    Extension(keys): Extension<TokenKeys>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let invalid = || AppError::Unauthorized("Invalid credentials".to_string());

    let user = user::Entity::find()
        .filter(user::Column::Username.eq(payload.username.trim()))
        .one(&db)
        .await?
        .ok_or_else(invalid)?;

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|_| AppError::Internal("Invalid password hash in DB".to_string()))?;

    if Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed_hash)
        .is_err()
    {
        tracing::Span::current()
            .record("action", "login_user_failed")
            .record("error", "invalid_credentials");
        return Err(invalid());
    }

    let token = keys
        .issue_session(user.id, &user.username, &user.role)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    tracing::Span::current()
        .record("action", "login_user")
        .record("user_id", user.id)
        .record("business_event", "User logged in successfully");

    Ok(Json(json!({ "token": token })))
}
