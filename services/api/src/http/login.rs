use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::info;

use crate::auth::verify_password;
use crate::http::response::{internal_error, unauthorized};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> impl IntoResponse {
    let row = sqlx::query(
        "SELECT uid::text AS uid, password_hash, role FROM users WHERE username = $1",
    )
    .bind(&body.username)
    .fetch_optional(&state.pool)
    .await;

    let row = match row {
        Ok(Some(row)) => row,
        Ok(None) => return unauthorized("invalid username or password"),
        Err(e) => return internal_error(e),
    };

    let parsed: Result<(String, String, String), sqlx::Error> = (|| {
        Ok((
            row.try_get("uid")?,
            row.try_get("password_hash")?,
            row.try_get("role")?,
        ))
    })();
    let (uid, password_hash, role) = match parsed {
        Ok(fields) => fields,
        Err(e) => return internal_error(e),
    };

    if !verify_password(&body.password, &password_hash) {
        return unauthorized("invalid username or password");
    }

    match state.auth.issue(&uid, &role) {
        Ok(access_token) => {
            info!(user = %body.username, role = %role, "login");
            Json(Token {
                access_token,
                token_type: "bearer".to_owned(),
            })
            .into_response()
        }
        Err(e) => internal_error(e),
    }
}
