use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// ---- Race lifecycle ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Waiting,
    Countdown,
    Active,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Waiting => write!(f, "waiting"),
            Phase::Countdown => write!(f, "countdown"),
            Phase::Active => write!(f, "active"),
            Phase::Finished => write!(f, "finished"),
        }
    }
}

/// One racer as every client is allowed to see them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicRacer {
    pub user_id: Uuid,
    pub username: String,
    pub avatar_id: u32,
    pub connected: bool,
    pub ready: bool,
    pub progress_chars: usize,
    pub wpm: u32,
    /// Server-measured seconds from race start; absent until finished,
    /// and permanently absent for racers swept up by the race timeout.
    pub finish_time: Option<f64>,
    pub place: Option<u32>,
}

/// Full lobby projection used to (re)synchronize a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicLobby {
    pub lobby_id: Uuid,
    pub host_id: Uuid,
    pub reference: String,
    pub text: String,
    pub max_players: usize,
    pub phase: Phase,
    /// Server epoch milliseconds; the origin for all elapsed-time math.
    pub start_time: Option<i64>,
    pub racers: Vec<PublicRacer>,
}

/// Row of the joinable-lobby listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyInfo {
    pub lobby_id: Uuid,
    pub host_name: String,
    pub reference: String,
    pub player_count: usize,
    pub max_players: usize,
    pub phase: Phase,
}

/// One line of the final standings broadcast in `race_end`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RaceResult {
    pub user_id: Uuid,
    pub username: String,
    pub place: u32,
    /// None for racers ranked last at the finish timeout.
    pub time: Option<f64>,
    pub wpm: u32,
    pub accuracy: u32,
}

/// ---- Wire messages ----
///
/// Tagged JSON; anything whose tag or shape doesn't match a variant below
/// is rejected without closing the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToServer {
    Ready,
    Progress { chars: usize, wpm: u32 },
    Finished { time: f64, wpm: u32, accuracy: u32 },
    Rematch,
    Leave,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToClient {
    /// Full state, sent to a connection right after it binds. Clients that
    /// miss broadcasts (reconnect, dropped queue) recover from this alone.
    Snapshot {
        lobby: PublicLobby,
    },
    PlayerJoined {
        user_id: Uuid,
        username: String,
        avatar_id: u32,
    },
    PlayerLeft {
        user_id: Uuid,
    },
    PlayerReady {
        user_id: Uuid,
        ready: bool,
    },
    Countdown {
        seconds: u32,
    },
    RaceStart {
        text: String,
        start_time: i64,
    },
    Progress {
        user_id: Uuid,
        chars: usize,
        wpm: u32,
    },
    PlayerFinished {
        user_id: Uuid,
        place: u32,
        time: f64,
        wpm: u32,
    },
    RaceEnd {
        results: Vec<RaceResult>,
    },
    /// Countdown cancelled or host requested a rematch: progress, ready
    /// flags and the start timestamp are back to their initial values.
    RaceReset,
    Error {
        message: String,
    },
}
