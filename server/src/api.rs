use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use versedash_protocol::LobbyInfo;

use crate::auth::{AuthError, AuthUser};
use crate::game::{Lobby, MIN_PLAYERS};
use crate::AppState;

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| detail(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
    state
        .auth
        .resolve(token)
        .map_err(|e| detail(StatusCode::UNAUTHORIZED, e.to_string()))
}

pub async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "lobbies": state.lobbies.lock().len(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub avatar_id: u32,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    match state.auth.register(&req.username, req.avatar_id) {
        Ok((user, token)) => Json(json!({
            "user_id": user.user_id,
            "username": user.username,
            "avatar_id": user.avatar_id,
            "token": token,
        }))
        .into_response(),
        Err(e @ AuthError::InvalidUsername) => {
            detail(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        Err(e @ AuthError::UsernameTaken) => detail(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e @ AuthError::Unauthorized) => detail(StatusCode::UNAUTHORIZED, e.to_string()),
    }
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match bearer_user(&state, &headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    Json(json!({
        "user_id": user.user_id,
        "username": user.username,
        "avatar_id": user.avatar_id,
        "registered_at": user.registered_at,
        "best_wpm": state.results.best_wpm(user.user_id).unwrap_or(0),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateLobbyRequest {
    pub reference: String,
    pub text: String,
    pub max_players: Option<usize>,
}

/// Host action: create a lobby around a piece of content. The text arrives
/// from the caller; where it came from (verse proxy, fixture, anything) is
/// not this server's concern.
pub async fn create_lobby(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateLobbyRequest>,
) -> Response {
    let user = match bearer_user(&state, &headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    if req.text.trim().is_empty() {
        return detail(StatusCode::UNPROCESSABLE_ENTITY, "content text must not be empty");
    }
    let max_players = req.max_players.unwrap_or(state.config.race.default_max_players);
    if !(MIN_PLAYERS..=state.config.race.max_lobby_size).contains(&max_players) {
        return detail(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "max_players must be between {MIN_PLAYERS} and {}",
                state.config.race.max_lobby_size
            ),
        );
    }

    let lobby_id = Uuid::new_v4();
    let lobby = Lobby::new(lobby_id, &user, req.reference, req.text, max_players);
    state.lobbies.lock().insert(lobby_id, Arc::new(Mutex::new(lobby)));
    tracing::info!("[CREATE] lobby={lobby_id} host={} max={max_players}", user.username);

    Json(json!({ "lobby_id": lobby_id })).into_response()
}

pub async fn list_lobbies(State(state): State<AppState>) -> Response {
    let lobbies: Vec<LobbyInfo> = state
        .lobbies
        .lock()
        .values()
        .map(|lobby| {
            let l = lobby.lock();
            LobbyInfo {
                lobby_id: l.id,
                host_name: l.host_name.clone(),
                reference: l.reference.clone(),
                player_count: l.racers.len(),
                max_players: l.max_players,
                phase: l.phase,
            }
        })
        .collect();
    Json(json!({ "lobbies": lobbies })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SubmitScoreRequest {
    pub wpm: u32,
    pub accuracy: u32,
    pub time_seconds: f64,
}

pub async fn submit_daily_score(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitScoreRequest>,
) -> Response {
    let user = match bearer_user(&state, &headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    // same plausibility ceiling as race finishes
    if req.wpm > state.config.race.wpm_ceiling {
        return detail(StatusCode::UNPROCESSABLE_ENTITY, "score rejected: implausible typing speed");
    }
    match state
        .results
        .record_daily_score(&user, req.wpm, req.accuracy.min(100), req.time_seconds)
        .await
    {
        Ok((rank, total_players)) => Json(json!({
            "ok": true,
            "rank": rank,
            "total_players": total_players,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!("[SCORE] failed to record daily score for {}: {e}", user.user_id);
            detail(StatusCode::INTERNAL_SERVER_ERROR, "failed to record score")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    pub challenge_date: Option<NaiveDate>,
}

pub async fn daily_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<DailyQuery>,
) -> Response {
    let date = query.challenge_date.unwrap_or_else(|| Utc::now().date_naive());
    let scores = state.results.daily_scores(date);
    Json(json!({ "date": date, "scores": scores })).into_response()
}

pub async fn alltime_leaderboard(State(state): State<AppState>) -> Response {
    Json(json!({ "scores": state.results.alltime_scores(100) })).into_response()
}
