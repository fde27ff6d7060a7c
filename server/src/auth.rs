use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;

/// Identity a bearer credential resolves to.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub username: String,
    pub avatar_id: u32,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("username must be 2-20 characters: letters, digits, underscore or hyphen")]
    InvalidUsername,
    #[error("username is already taken")]
    UsernameTaken,
    #[error("invalid or expired credential")]
    Unauthorized,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, AuthUser>,
    tokens: HashMap<String, Uuid>,
    /// Lowercased usernames, for case-insensitive uniqueness.
    names: HashSet<String>,
}

/// In-memory identity collaborator: registration hands out an opaque bearer
/// token, and the rest of the server only ever asks "whose token is this".
#[derive(Default)]
pub struct AuthRegistry {
    inner: Mutex<Inner>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, username: &str, avatar_id: u32) -> Result<(AuthUser, String), AuthError> {
        let username = username.trim();
        if !valid_username(username) {
            return Err(AuthError::InvalidUsername);
        }

        let mut inner = self.inner.lock();
        if !inner.names.insert(username.to_lowercase()) {
            return Err(AuthError::UsernameTaken);
        }
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            username: username.to_string(),
            avatar_id,
            registered_at: Utc::now(),
        };
        let token = new_token();
        inner.tokens.insert(token.clone(), user.user_id);
        inner.users.insert(user.user_id, user.clone());
        tracing::info!("[REGISTER] user={} name={}", user.user_id, user.username);
        Ok((user, token))
    }

    pub fn resolve(&self, token: &str) -> Result<AuthUser, AuthError> {
        let inner = self.inner.lock();
        inner
            .tokens
            .get(token)
            .and_then(|id| inner.users.get(id))
            .cloned()
            .ok_or(AuthError::Unauthorized)
    }
}

fn valid_username(name: &str) -> bool {
    let len = name.chars().count();
    (2..=20).contains(&len)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 32 random bytes, hex-encoded: a 64-character opaque bearer token.
fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
