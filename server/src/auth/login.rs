use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{extract::State, http::StatusCode, Json};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::auth::jwt;
use crate::chat::models::{User, UserSummary};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserSummary,
}

fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt_bytes: [u8; 16] = rand::rng().random();
    let salt = SaltString::encode_b64(&salt_bytes)?;
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}

/// Argon2 verification, run on the blocking pool.
async fn check_password(user: &User, password: &str) -> Result<bool, StatusCode> {
    let stored = user.password_hash.clone();
    let password = password.to_string();
    tokio::task::spawn_blocking(move || verify_password(&stored, &password))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// POST /api/auth/login
/// Sign in, creating the account on first use of a username.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, StatusCode> {
    let username = req.username.trim().to_string();
    if username.is_empty() || req.password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let existing = state.store.find_user_by_name(&username).await.map_err(|e| {
        tracing::error!(error = %e, "User lookup failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let user = match existing {
        Some(user) => {
            if !check_password(&user, &req.password).await? {
                tracing::debug!(username = %username, "Rejected login: wrong password");
                return Err(StatusCode::UNAUTHORIZED);
            }
            user
        }
        None => {
            let password = req.password.clone();
            let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

            match state.store.create_user(&username, &password_hash).await {
                Ok(user) => {
                    tracing::info!(user_id = %user.id, username = %username, "Account created");
                    user
                }
                Err(e) => {
                    // A concurrent signup for the same name won the UNIQUE race.
                    let user = state
                        .store
                        .find_user_by_name(&username)
                        .await
                        .ok()
                        .flatten()
                        .ok_or_else(|| {
                            tracing::error!(error = %e, "Account creation failed");
                            StatusCode::INTERNAL_SERVER_ERROR
                        })?;
                    if !check_password(&user, &req.password).await? {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    user
                }
            }
        }
    };

    let token = jwt::issue_access_token(&state.jwt_secret, &user.id, &user.name)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(LoginResponse {
        token,
        user: user.summary(),
    }))
}
