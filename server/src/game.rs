use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;
use versedash_protocol::{Phase, PublicLobby, PublicRacer, RaceResult, ServerToClient};

use crate::auth::AuthUser;
use crate::config::RaceConfig;

/// Multiplayer needs at least two racers; a lone lobby stays in `waiting`.
pub const MIN_PLAYERS: usize = 2;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LobbyError {
    #[error("not allowed")]
    Unauthorized,
    #[error("not a participant of this lobby")]
    NotFound,
    #[error("lobby is full")]
    Full,
    #[error("race already finished")]
    AlreadyFinished,
    #[error("race in progress")]
    RaceInProgress,
    #[error("event not valid in current race state")]
    InvalidStateForEvent,
    #[error("finish rejected: implausible typing speed")]
    AntiCheatRejected,
}

/// Live channel to one client. `conn_id` distinguishes the current socket
/// from a stale one the same user abandoned when reconnecting.
#[derive(Debug)]
pub struct Connection {
    pub tx: mpsc::Sender<ServerToClient>,
    pub conn_id: u64,
}

#[derive(Debug)]
pub struct Racer {
    pub user_id: Uuid,
    pub username: String,
    pub avatar_id: u32,
    pub conn: Option<Connection>,
    pub ready: bool,
    pub progress_chars: usize,
    pub wpm: u32,
    pub accuracy: u32,
    pub finish_time: Option<f64>,
    pub place: Option<u32>,
    pub join_order: u64,
    last_progress_sent: Option<Instant>,
}

/// Authoritative state of one racing session. Every mutation goes through
/// the functions below while the caller holds this lobby's lock, so the
/// invariants (capacity, monotonic progress, single start timestamp,
/// immutable ranks) are enforced in one place.
#[derive(Debug)]
pub struct Lobby {
    pub id: Uuid,
    pub host_id: Uuid,
    pub host_name: String,
    pub reference: String,
    pub text: String,
    pub max_players: usize,
    pub phase: Phase,
    pub racers: Vec<Racer>,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub start_epoch_ms: Option<i64>,
    pub finished_at: Option<Instant>,
    /// Bumped whenever an in-flight countdown must be abandoned.
    pub countdown_gen: u64,
    /// Bumped on rematch; a stale race-timeout task sees the mismatch and quits.
    pub race_gen: u64,
    next_place: u32,
    join_counter: u64,
}

impl Lobby {
    pub fn new(
        id: Uuid,
        host: &AuthUser,
        reference: String,
        text: String,
        max_players: usize,
    ) -> Self {
        Self {
            id,
            host_id: host.user_id,
            host_name: host.username.clone(),
            reference,
            text,
            max_players,
            phase: Phase::Waiting,
            racers: Vec::new(),
            created_at: Instant::now(),
            started_at: None,
            start_epoch_ms: None,
            finished_at: None,
            countdown_gen: 0,
            race_gen: 0,
            next_place: 1,
            join_counter: 0,
        }
    }

    pub fn content_chars(&self) -> usize {
        self.text.chars().count()
    }
}

pub fn seat_of(lobby: &Lobby, user_id: Uuid) -> Option<usize> {
    lobby.racers.iter().position(|r| r.user_id == user_id)
}

/// Words-per-minute implied by typing `chars` characters in `elapsed_secs`,
/// at the conventional five characters per word. An instant finish reads as
/// implausibly fast rather than dividing by zero.
pub fn implied_wpm(chars: usize, elapsed_secs: f64) -> f64 {
    let minutes = (elapsed_secs / 60.0).max(0.1 / 60.0);
    (chars as f64 / 5.0) / minutes
}

/* ---------------- fan-out ---------------- */

/// Delivers `msg` to every connected racer, never blocking: each connection
/// has a bounded queue and `try_send` either lands the value snapshot or
/// tells us the client is too slow or gone. An overflowed connection is
/// dropped and handled as a close, which may itself produce follow-up
/// events (`player_left`, `race_reset`) delivered in commit order.
pub fn broadcast(lobby: &mut Lobby, msg: ServerToClient) {
    let mut queue = VecDeque::new();
    queue.push_back(msg);
    while let Some(m) = queue.pop_front() {
        let mut dropped = Vec::new();
        for r in lobby.racers.iter_mut() {
            let Some(conn) = &r.conn else { continue };
            if conn.tx.try_send(m.clone()).is_err() {
                r.conn = None;
                dropped.push(r.user_id);
            }
        }
        for user_id in dropped {
            tracing::warn!("[DROP] lobby={} user={user_id} send queue overflowed", lobby.id);
            queue.extend(connection_lost(lobby, user_id));
        }
    }
}

/// Sends to a single racer's connection, with the same overflow handling.
pub fn send_to(lobby: &mut Lobby, user_id: Uuid, msg: ServerToClient) {
    let Some(idx) = seat_of(lobby, user_id) else { return };
    let Some(conn) = &lobby.racers[idx].conn else { return };
    if conn.tx.try_send(msg).is_err() {
        lobby.racers[idx].conn = None;
        for ev in connection_lost(lobby, user_id) {
            broadcast(lobby, ev);
        }
    }
}

pub fn send_err_to(lobby: &mut Lobby, user_id: Uuid, message: impl Into<String>) {
    let message = message.into();
    send_to(lobby, user_id, ServerToClient::Error { message });
}

/* ---------------- membership ---------------- */

/// Binds a connection to this lobby. A user with an existing seat is a
/// reconnect: the new channel replaces the old one and ready/progress/rank
/// are preserved. Otherwise a fresh racer is seated, which only works while
/// the lobby is still waiting and below capacity.
pub fn join(
    lobby: &mut Lobby,
    user: &AuthUser,
    tx: mpsc::Sender<ServerToClient>,
    conn_id: u64,
) -> Result<(), LobbyError> {
    if let Some(idx) = seat_of(lobby, user.user_id) {
        lobby.racers[idx].conn = Some(Connection { tx, conn_id });
        let (username, avatar_id) = {
            let r = &lobby.racers[idx];
            (r.username.clone(), r.avatar_id)
        };
        broadcast(
            lobby,
            ServerToClient::PlayerJoined { user_id: user.user_id, username, avatar_id },
        );
        let snapshot = ServerToClient::Snapshot { lobby: public_lobby(lobby) };
        send_to(lobby, user.user_id, snapshot);
        return Ok(());
    }

    match lobby.phase {
        Phase::Waiting => {}
        Phase::Countdown | Phase::Active => return Err(LobbyError::RaceInProgress),
        Phase::Finished => return Err(LobbyError::AlreadyFinished),
    }
    if lobby.racers.len() >= lobby.max_players {
        return Err(LobbyError::Full);
    }

    lobby.join_counter += 1;
    lobby.racers.push(Racer {
        user_id: user.user_id,
        username: user.username.clone(),
        avatar_id: user.avatar_id,
        conn: Some(Connection { tx, conn_id }),
        ready: false,
        progress_chars: 0,
        wpm: 0,
        accuracy: 0,
        finish_time: None,
        place: None,
        join_order: lobby.join_counter,
        last_progress_sent: None,
    });

    broadcast(
        lobby,
        ServerToClient::PlayerJoined {
            user_id: user.user_id,
            username: user.username.clone(),
            avatar_id: user.avatar_id,
        },
    );
    let snapshot = ServerToClient::Snapshot { lobby: public_lobby(lobby) };
    send_to(lobby, user.user_id, snapshot);
    Ok(())
}

/// Applies close semantics for a user's channel: the seat's channel goes
/// absent, and while the lobby is still waiting (or counting down) the seat
/// itself is vacated. Returns the events to broadcast, in order.
fn connection_lost(lobby: &mut Lobby, user_id: Uuid) -> Vec<ServerToClient> {
    let Some(idx) = seat_of(lobby, user_id) else { return Vec::new() };
    lobby.racers[idx].conn = None;
    let mut events = vec![ServerToClient::PlayerLeft { user_id }];
    match lobby.phase {
        Phase::Waiting => {
            lobby.racers.remove(idx);
            promote_host(lobby);
        }
        Phase::Countdown => {
            lobby.racers.remove(idx);
            promote_host(lobby);
            cancel_countdown(lobby);
            events.push(ServerToClient::RaceReset);
        }
        // Seat kept so the user can reconnect and so final ranking still
        // accounts for them.
        Phase::Active | Phase::Finished => {}
    }
    events
}

/// Socket-close entry point. `conn_id` guards against a stale socket of a
/// user who already reconnected on a newer one.
pub fn handle_close(lobby: &mut Lobby, user_id: Uuid, conn_id: u64) {
    let Some(idx) = seat_of(lobby, user_id) else { return };
    match &lobby.racers[idx].conn {
        Some(c) if c.conn_id == conn_id => {}
        _ => return,
    }
    for ev in connection_lost(lobby, user_id) {
        broadcast(lobby, ev);
    }
}

/// Explicit `leave` message; unlike a close it applies to whatever channel
/// the user currently holds.
pub fn apply_leave(lobby: &mut Lobby, user_id: Uuid) {
    if seat_of(lobby, user_id).is_none() {
        return;
    }
    for ev in connection_lost(lobby, user_id) {
        broadcast(lobby, ev);
    }
}

fn promote_host(lobby: &mut Lobby) {
    if lobby.racers.iter().any(|r| r.user_id == lobby.host_id) {
        return;
    }
    if let Some(r) = lobby.racers.first() {
        lobby.host_id = r.user_id;
        lobby.host_name = r.username.clone();
        tracing::info!("[HOST] lobby={} promoted {} to host", lobby.id, r.username);
    }
}

/* ---------------- race flow ---------------- */

/// Sets the sender's ready flag. Returns `true` when this flipped the lobby
/// into countdown; the caller is responsible for driving the ticks.
pub fn apply_ready(
    lobby: &mut Lobby,
    user_id: Uuid,
    ready: bool,
    cfg: &RaceConfig,
) -> Result<bool, LobbyError> {
    if lobby.phase != Phase::Waiting {
        return Err(LobbyError::InvalidStateForEvent);
    }
    let idx = seat_of(lobby, user_id).ok_or(LobbyError::NotFound)?;
    lobby.racers[idx].ready = ready;
    broadcast(lobby, ServerToClient::PlayerReady { user_id, ready });

    if ready && lobby.racers.len() >= MIN_PLAYERS && lobby.racers.iter().all(|r| r.ready) {
        begin_countdown(lobby, cfg);
        return Ok(true);
    }
    Ok(false)
}

fn begin_countdown(lobby: &mut Lobby, cfg: &RaceConfig) {
    lobby.phase = Phase::Countdown;
    lobby.countdown_gen += 1;
    tracing::info!(
        "[COUNTDOWN] lobby={} racers={} ticks={}",
        lobby.id,
        lobby.racers.len(),
        cfg.countdown_ticks
    );
    broadcast(lobby, ServerToClient::Countdown { seconds: cfg.countdown_ticks });
}

fn cancel_countdown(lobby: &mut Lobby) {
    lobby.phase = Phase::Waiting;
    lobby.countdown_gen += 1;
    for r in lobby.racers.iter_mut() {
        r.ready = false;
    }
    tracing::info!("[COUNTDOWN] lobby={} cancelled, back to waiting", lobby.id);
}

/// Countdown elapsed: the race is on. The start timestamp is recorded here
/// and only here, once per race instance; the countdown guard makes a
/// second call within the same instance a no-op.
pub fn begin_race(lobby: &mut Lobby, started_at: Instant, start_epoch_ms: i64) {
    if lobby.phase != Phase::Countdown {
        return;
    }
    lobby.phase = Phase::Active;
    lobby.started_at = Some(started_at);
    lobby.start_epoch_ms = Some(start_epoch_ms);
    lobby.next_place = 1;
    broadcast(
        lobby,
        ServerToClient::RaceStart { text: lobby.text.clone(), start_time: start_epoch_ms },
    );
}

/// Records a progress update. Regressed char counts are ignored for scoring
/// so progress stays monotonic; broadcasts are coalesced to at most one per
/// racer per configured interval, terminal events excepted.
pub fn apply_progress(
    lobby: &mut Lobby,
    user_id: Uuid,
    chars: usize,
    wpm: u32,
    cfg: &RaceConfig,
) -> Result<(), LobbyError> {
    if lobby.phase != Phase::Active {
        return Err(LobbyError::InvalidStateForEvent);
    }
    let idx = seat_of(lobby, user_id).ok_or(LobbyError::NotFound)?;
    if lobby.racers[idx].place.is_some() {
        return Err(LobbyError::InvalidStateForEvent);
    }

    let chars = chars.min(lobby.content_chars());
    if chars < lobby.racers[idx].progress_chars {
        return Ok(());
    }
    lobby.racers[idx].progress_chars = chars;
    lobby.racers[idx].wpm = wpm;

    let due = match lobby.racers[idx].last_progress_sent {
        Some(at) => at.elapsed() >= Duration::from_millis(cfg.progress_interval_ms),
        None => true,
    };
    if due {
        lobby.racers[idx].last_progress_sent = Some(Instant::now());
        broadcast(lobby, ServerToClient::Progress { user_id, chars, wpm });
    }
    Ok(())
}

/// Records a finish. The rank is the arrival order under this lobby's lock;
/// the finish time is server-measured from the start timestamp, with the
/// client-reported time advisory only. A finish whose implied speed exceeds
/// the ceiling is rejected and the racer stays unfinished. Returns the final
/// standings once the last racer is in.
pub fn apply_finish(
    lobby: &mut Lobby,
    user_id: Uuid,
    reported_time: f64,
    wpm: u32,
    accuracy: u32,
    cfg: &RaceConfig,
) -> Result<Option<Vec<RaceResult>>, LobbyError> {
    if lobby.phase != Phase::Active {
        return Err(LobbyError::InvalidStateForEvent);
    }
    let idx = seat_of(lobby, user_id).ok_or(LobbyError::NotFound)?;
    if lobby.racers[idx].place.is_some() {
        // duplicate finish: rank already assigned, nothing more happens
        return Ok(None);
    }
    let started_at = lobby.started_at.ok_or(LobbyError::InvalidStateForEvent)?;

    let elapsed = started_at.elapsed().as_secs_f64();
    let implied = implied_wpm(lobby.content_chars(), elapsed);
    if implied > f64::from(cfg.wpm_ceiling) || wpm > cfg.wpm_ceiling {
        tracing::warn!(
            "[ANTICHEAT] lobby={} user={user_id} implied={implied:.0}wpm reported={wpm}wpm elapsed={elapsed:.2}s",
            lobby.id
        );
        return Err(LobbyError::AntiCheatRejected);
    }

    let place = lobby.next_place;
    lobby.next_place += 1;
    {
        let full = lobby.content_chars();
        let r = &mut lobby.racers[idx];
        r.progress_chars = full;
        r.wpm = wpm;
        r.accuracy = accuracy.min(100);
        r.finish_time = Some(elapsed);
        r.place = Some(place);
    }
    tracing::info!(
        "[FINISH] lobby={} user={user_id} place={place} server_time={elapsed:.2}s reported={reported_time:.2}s",
        lobby.id
    );
    broadcast(
        lobby,
        ServerToClient::PlayerFinished { user_id, place, time: elapsed, wpm },
    );

    if lobby.racers.iter().all(|r| r.place.is_some()) {
        return Ok(Some(finish_race(lobby)));
    }
    Ok(None)
}

/// The finish timeout fired: everyone still unfinished is ranked after all
/// finishers, in original join order, with no recorded time.
pub fn finish_by_timeout(lobby: &mut Lobby) -> Vec<RaceResult> {
    let mut stragglers: Vec<usize> = (0..lobby.racers.len())
        .filter(|&i| lobby.racers[i].place.is_none())
        .collect();
    stragglers.sort_by_key(|&i| lobby.racers[i].join_order);
    for idx in stragglers {
        let place = lobby.next_place;
        lobby.next_place += 1;
        lobby.racers[idx].place = Some(place);
    }
    finish_race(lobby)
}

fn finish_race(lobby: &mut Lobby) -> Vec<RaceResult> {
    lobby.phase = Phase::Finished;
    lobby.finished_at = Some(Instant::now());

    let mut results: Vec<RaceResult> = lobby
        .racers
        .iter()
        .filter_map(|r| {
            r.place.map(|place| RaceResult {
                user_id: r.user_id,
                username: r.username.clone(),
                place,
                time: r.finish_time,
                wpm: r.wpm,
                accuracy: r.accuracy,
            })
        })
        .collect();
    results.sort_by_key(|r| r.place);

    tracing::info!("[END] lobby={} results={}", lobby.id, results.len());
    broadcast(lobby, ServerToClient::RaceEnd { results: results.clone() });
    results
}

/// Host-only: reuse the lobby for a fresh race instance. Per-racer race
/// state and the start timestamp reset; membership survives, except racers
/// with no live channel, who could never re-ready and would wedge the
/// waiting room.
pub fn apply_rematch(lobby: &mut Lobby, user_id: Uuid) -> Result<(), LobbyError> {
    if lobby.phase != Phase::Finished {
        return Err(LobbyError::InvalidStateForEvent);
    }
    if user_id != lobby.host_id {
        return Err(LobbyError::Unauthorized);
    }

    lobby.racers.retain(|r| r.conn.is_some());
    promote_host(lobby);
    for r in lobby.racers.iter_mut() {
        r.ready = false;
        r.progress_chars = 0;
        r.wpm = 0;
        r.accuracy = 0;
        r.finish_time = None;
        r.place = None;
        r.last_progress_sent = None;
    }
    lobby.race_gen += 1;
    lobby.countdown_gen += 1;
    lobby.started_at = None;
    lobby.start_epoch_ms = None;
    lobby.finished_at = None;
    lobby.next_place = 1;
    lobby.phase = Phase::Waiting;

    tracing::info!("[REMATCH] lobby={} racers={}", lobby.id, lobby.racers.len());
    broadcast(lobby, ServerToClient::RaceReset);
    Ok(())
}

/* ---------------- projections ---------------- */

pub fn public_lobby(lobby: &Lobby) -> PublicLobby {
    PublicLobby {
        lobby_id: lobby.id,
        host_id: lobby.host_id,
        reference: lobby.reference.clone(),
        text: lobby.text.clone(),
        max_players: lobby.max_players,
        phase: lobby.phase,
        start_time: lobby.start_epoch_ms,
        racers: lobby
            .racers
            .iter()
            .map(|r| PublicRacer {
                user_id: r.user_id,
                username: r.username.clone(),
                avatar_id: r.avatar_id,
                connected: r.conn.is_some(),
                ready: r.ready,
                progress_chars: r.progress_chars,
                wpm: r.wpm,
                finish_time: r.finish_time,
                place: r.place,
            })
            .collect(),
    }
}
