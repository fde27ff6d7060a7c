use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;
use versedash_protocol::{ClientToServer, Phase, RaceResult, ServerToClient};

mod api;
mod auth;
mod config;
mod game;
mod persistence;

use auth::{AuthRegistry, AuthUser};
use config::Config;
use game::Lobby;
use persistence::ResultsStore;

#[derive(Clone)]
pub struct AppState {
    /// Registry of live lobbies. Each lobby sits behind its own lock, so one
    /// lobby's mutations serialize while different lobbies run in parallel.
    pub lobbies: Arc<Mutex<HashMap<Uuid, Arc<Mutex<Lobby>>>>>,
    pub auth: Arc<AuthRegistry>,
    pub results: Arc<ResultsStore>,
    pub config: Arc<Config>,
    pub started_at: Instant,
    next_conn_id: Arc<AtomicU64>,
}

impl AppState {
    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = format!("{}:{}", config.host, config.port);
    let results = ResultsStore::open(&config.data_dir).await?;

    let state = AppState {
        lobbies: Arc::new(Mutex::new(HashMap::new())),
        auth: Arc::new(AuthRegistry::new()),
        results: Arc::new(results),
        config: Arc::new(config),
        started_at: Instant::now(),
        next_conn_id: Arc::new(AtomicU64::new(1)),
    };

    tokio::spawn(run_sweeper(state.clone()));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/auth/register", post(api::register))
        .route("/auth/me", get(api::me))
        .route("/lobbies", post(api::create_lobby).get(api::list_lobbies))
        .route("/leaderboard/daily", get(api::daily_leaderboard))
        .route("/leaderboard/daily/submit", post(api::submit_daily_score))
        .route("/leaderboard/alltime", get(api::alltime_leaderboard))
        .route("/ws/:lobby_id", get(ws_handler))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{addr} (races at ws://{addr}/ws/:lobby_id)");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: String,
}

/// Upgrade point of the connection registry: the bearer credential is
/// resolved and the lobby checked before the socket upgrades, so a bad
/// credential or unknown lobby is refused as a plain HTTP error.
async fn ws_handler(
    Path(lobby_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match state.auth.resolve(&query.token) {
        Ok(user) => user,
        Err(e) => return (StatusCode::UNAUTHORIZED, e.to_string()).into_response(),
    };
    let Some(lobby) = state.lobbies.lock().get(&lobby_id).cloned() else {
        return (StatusCode::NOT_FOUND, "lobby not found").into_response();
    };
    {
        let l = lobby.lock();
        let returning = l.racers.iter().any(|r| r.user_id == user.user_id);
        if !returning && l.racers.len() >= l.max_players {
            return (StatusCode::CONFLICT, "lobby is full").into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, lobby, lobby_id, user))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    lobby: Arc<Mutex<Lobby>>,
    lobby_id: Uuid,
    user: AuthUser,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) =
        tokio::sync::mpsc::channel::<ServerToClient>(state.config.send_queue_capacity.max(1));
    let conn_id = state.next_conn_id();

    let joined = {
        let mut l = lobby.lock();
        game::join(&mut l, &user, tx, conn_id)
    };
    if let Err(e) = joined {
        let refusal = ServerToClient::Error { message: e.to_string() };
        if let Ok(text) = serde_json::to_string(&refusal) {
            let _ = ws_tx.send(Message::Text(text)).await;
        }
        return;
    }
    tracing::info!("[JOIN] lobby={lobby_id} user={} name={}", user.user_id, user.username);

    // Queued events drain to the socket out here, never under a lobby lock.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else { continue };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientToServer>(&text) {
                Ok(cmd) => {
                    if route_cmd(&state, &lobby, lobby_id, &user, cmd) {
                        break;
                    }
                }
                Err(_) => {
                    let mut l = lobby.lock();
                    game::send_err_to(&mut l, user.user_id, "unrecognized message");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let now_empty = {
        let mut l = lobby.lock();
        game::handle_close(&mut l, user.user_id, conn_id);
        l.phase == Phase::Waiting && l.racers.is_empty()
    };
    if now_empty {
        state.lobbies.lock().remove(&lobby_id);
        tracing::info!("[TEARDOWN] lobby={lobby_id} empty, removed");
    }
    tracing::info!("[CLOSE] lobby={lobby_id} user={}", user.user_id);
    send_task.abort();
}

/// Work queued up while a lobby's lock was held, executed after release.
enum Post {
    Nothing,
    Countdown(u64),
    Resolve(String, Vec<RaceResult>),
}

/// Applies one client message to its lobby. Returns `true` when the client
/// left and the socket loop should end.
fn route_cmd(
    state: &AppState,
    lobby: &Arc<Mutex<Lobby>>,
    lobby_id: Uuid,
    user: &AuthUser,
    cmd: ClientToServer,
) -> bool {
    let mut left = false;
    let post = {
        let mut l = lobby.lock();
        match cmd {
            ClientToServer::Ready => match game::apply_ready(&mut l, user.user_id, true, &state.config.race) {
                Ok(true) => Post::Countdown(l.countdown_gen),
                Ok(false) => Post::Nothing,
                Err(e) => {
                    game::send_err_to(&mut l, user.user_id, e.to_string());
                    Post::Nothing
                }
            },
            ClientToServer::Progress { chars, wpm } => {
                if let Err(e) = game::apply_progress(&mut l, user.user_id, chars, wpm, &state.config.race) {
                    game::send_err_to(&mut l, user.user_id, e.to_string());
                }
                Post::Nothing
            }
            ClientToServer::Finished { time, wpm, accuracy } => {
                match game::apply_finish(&mut l, user.user_id, time, wpm, accuracy, &state.config.race) {
                    Ok(Some(results)) => Post::Resolve(l.reference.clone(), results),
                    Ok(None) => Post::Nothing,
                    Err(e) => {
                        game::send_err_to(&mut l, user.user_id, e.to_string());
                        Post::Nothing
                    }
                }
            }
            ClientToServer::Rematch => {
                if let Err(e) = game::apply_rematch(&mut l, user.user_id) {
                    game::send_err_to(&mut l, user.user_id, e.to_string());
                }
                Post::Nothing
            }
            ClientToServer::Leave => {
                game::apply_leave(&mut l, user.user_id);
                left = true;
                Post::Nothing
            }
        }
    };

    match post {
        Post::Nothing => {}
        Post::Countdown(gen) => {
            tokio::spawn(run_countdown(state.clone(), lobby.clone(), gen));
        }
        Post::Resolve(reference, results) => {
            let results_store = state.results.clone();
            tokio::spawn(async move {
                results_store.record_race_results_with_retry(lobby_id, &reference, &results).await;
            });
        }
    }
    left
}

/// Ticks a lobby's countdown once per second. The generation check makes a
/// cancelled countdown (someone left) die quietly; reaching zero starts the
/// race and arms the finish timeout.
async fn run_countdown(state: AppState, lobby: Arc<Mutex<Lobby>>, gen: u64) {
    let mut remaining = state.config.race.countdown_ticks;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let race_gen = {
            let mut l = lobby.lock();
            if l.phase != Phase::Countdown || l.countdown_gen != gen {
                return;
            }
            remaining = remaining.saturating_sub(1);
            if remaining > 0 {
                game::broadcast(&mut l, ServerToClient::Countdown { seconds: remaining });
                None
            } else {
                game::begin_race(&mut l, Instant::now(), Utc::now().timestamp_millis());
                tracing::info!("[START] lobby={} racers={}", l.id, l.racers.len());
                Some(l.race_gen)
            }
        };
        if let Some(race_gen) = race_gen {
            tokio::spawn(run_race_timeout(state, lobby, race_gen));
            return;
        }
    }
}

/// Hard stop for a race instance, measured from the server-side start
/// timestamp and so immune to client clock skew. A rematch bumps the race
/// generation and makes a stale timeout a no-op.
async fn run_race_timeout(state: AppState, lobby: Arc<Mutex<Lobby>>, race_gen: u64) {
    tokio::time::sleep(Duration::from_secs(state.config.race.finish_timeout_secs)).await;
    let resolved = {
        let mut l = lobby.lock();
        if l.phase == Phase::Active && l.race_gen == race_gen {
            tracing::info!("[TIMEOUT] lobby={} forcing race end", l.id);
            Some((l.id, l.reference.clone(), game::finish_by_timeout(&mut l)))
        } else {
            None
        }
    };
    if let Some((lobby_id, reference, results)) = resolved {
        state.results.record_race_results_with_retry(lobby_id, &reference, &results).await;
    }
}

/// Periodically removes lobbies nobody will come back to: finished ones past
/// the linger window and waiting ones that emptied out.
async fn run_sweeper(state: AppState) {
    let linger = Duration::from_secs(state.config.lobby_linger_secs);
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let mut map = state.lobbies.lock();
        map.retain(|id, lobby| {
            let l = lobby.lock();
            let keep = match l.phase {
                Phase::Finished => l.finished_at.map_or(true, |t| t.elapsed() < linger),
                Phase::Waiting => !l.racers.is_empty() || l.created_at.elapsed() < linger,
                Phase::Countdown | Phase::Active => true,
            };
            if !keep {
                tracing::info!("[SWEEP] removing lobby {id}");
            }
            keep
        });
    }
}
