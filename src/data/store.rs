//! Player Store
//!
//! Durable per-account profiles backed by `players.json` in the data
//! directory. All mutation goes through one mutex and is persisted with a
//! write-then-rename so a crash never leaves a half-written file behind.
//! The store also owns the single-login set: a username can be bound to
//! at most one live session at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::game::types::{TowerKind, TroopKind};

/// Base EXP required to clear level 1.
pub const BASE_LEVEL_EXP: f64 = 100.0;
/// Per-level growth of the EXP requirement (compounding).
pub const EXP_GROWTH_FACTOR: f64 = 1.15;

/// Minimum username length.
pub const USERNAME_MIN: usize = 3;
/// Maximum username length.
pub const USERNAME_MAX: usize = 20;
/// Minimum password length.
pub const PASSWORD_MIN: usize = 4;

/// EXP required to advance from `level` to `level + 1`:
/// `round(100 * 1.15^(level - 1))`.
pub fn required_exp(level: u32) -> u32 {
    (BASE_LEVEL_EXP * EXP_GROWTH_FACTOR.powi(level as i32 - 1)).round() as u32
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Username fails the length or character rules.
    #[error("username must be {USERNAME_MIN}-{USERNAME_MAX} characters of letters, digits, or underscore")]
    InvalidUsername,

    /// Password is too short.
    #[error("password must be at least {PASSWORD_MIN} characters")]
    InvalidPassword,

    /// Username is already registered.
    #[error("username already exists")]
    UsernameTaken,

    /// Unknown username or wrong password.
    #[error("invalid username or password")]
    BadCredentials,

    /// The account is already bound to a live session.
    #[error("account is already logged in")]
    AlreadyLoggedIn,

    /// No profile with this username.
    #[error("unknown player: {0}")]
    UnknownPlayer(String),

    /// Underlying file I/O failed.
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Profile encoding or decoding failed.
    #[error("store encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A stored account. The password is kept as `hex(salt)$hex(sha256)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerProfile {
    /// Unique account name.
    pub username: String,
    /// Salted password digest, never the password itself.
    pub password_hash: String,
    /// Account level, starts at 1.
    pub level: u32,
    /// EXP toward the next level.
    pub exp: u32,
    /// Per-troop-kind levels (tracks the account level).
    pub troop_levels: BTreeMap<TroopKind, u32>,
    /// Per-tower-kind levels (tracks the account level).
    pub tower_levels: BTreeMap<TowerKind, u32>,
    /// Total matches played.
    pub games_played: u32,
    /// Total matches won.
    pub games_won: u32,
    /// Last successful login.
    pub last_login: DateTime<Utc>,
}

impl PlayerProfile {
    /// The profile without its password hash, safe to put on the wire.
    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            username: self.username.clone(),
            level: self.level,
            exp: self.exp,
            troop_levels: self.troop_levels.clone(),
            tower_levels: self.tower_levels.clone(),
            games_played: self.games_played,
            games_won: self.games_won,
            last_login: self.last_login,
        }
    }
}

/// Read-only view of a profile handed to sessions at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    /// Unique account name.
    pub username: String,
    /// Account level.
    pub level: u32,
    /// EXP toward the next level.
    pub exp: u32,
    /// Per-troop-kind levels.
    pub troop_levels: BTreeMap<TroopKind, u32>,
    /// Per-tower-kind levels.
    pub tower_levels: BTreeMap<TowerKind, u32>,
    /// Total matches played.
    pub games_played: u32,
    /// Total matches won.
    pub games_won: u32,
    /// Last successful login.
    pub last_login: DateTime<Utc>,
}

/// Outcome of applying a match result to a profile.
#[derive(Debug, Clone, Copy)]
pub struct GameResultRecord {
    /// Account level after the update.
    pub level: u32,
    /// Levels gained by this update (0 for no level-up).
    pub levels_gained: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    players: Vec<PlayerProfile>,
}

struct Inner {
    profiles: BTreeMap<String, PlayerProfile>,
    logged_in: BTreeSet<String>,
}

/// Durable player database plus the in-memory single-login set.
pub struct PlayerStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl PlayerStore {
    /// Open (or create) `players.json` under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join("players.json");

        let profiles = if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            let file: StoreFile = serde_json::from_str(&raw)?;
            file.players
                .into_iter()
                .map(|p| (p.username.clone(), p))
                .collect()
        } else {
            BTreeMap::new()
        };

        info!(profiles = profiles.len(), "player store opened at {}", path.display());

        let store = PlayerStore {
            path,
            inner: Mutex::new(Inner {
                profiles,
                logged_in: BTreeSet::new(),
            }),
        };
        // Make sure the file exists even for a fresh store.
        {
            let inner = store.inner.lock().await;
            store.persist(&inner).await?;
        }
        Ok(store)
    }

    /// Create a new account. The new profile is bound to the calling
    /// session (registering logs you in).
    pub async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<ProfileSnapshot, StoreError> {
        validate_username(username)?;
        validate_password(password)?;

        let mut inner = self.inner.lock().await;
        if inner.profiles.contains_key(username) {
            return Err(StoreError::UsernameTaken);
        }

        let profile = PlayerProfile {
            username: username.to_owned(),
            password_hash: hash_password(password),
            level: 1,
            exp: 0,
            troop_levels: TroopKind::ALL.iter().map(|&k| (k, 1)).collect(),
            tower_levels: TowerKind::ALL.iter().map(|&k| (k, 1)).collect(),
            games_played: 0,
            games_won: 0,
            last_login: Utc::now(),
        };
        let snapshot = profile.snapshot();
        inner.profiles.insert(username.to_owned(), profile);
        inner.logged_in.insert(username.to_owned());
        self.persist(&inner).await?;

        info!(username, "registered new player");
        Ok(snapshot)
    }

    /// Verify credentials and bind the username to a session.
    ///
    /// Unknown usernames and wrong passwords are indistinguishable to the
    /// caller; a username already bound to a live session is rejected.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<ProfileSnapshot, StoreError> {
        let mut inner = self.inner.lock().await;

        let profile = inner
            .profiles
            .get(username)
            .ok_or(StoreError::BadCredentials)?;
        if !verify_password(&profile.password_hash, password) {
            return Err(StoreError::BadCredentials);
        }
        if inner.logged_in.contains(username) {
            return Err(StoreError::AlreadyLoggedIn);
        }

        let profile = inner
            .profiles
            .get_mut(username)
            .ok_or(StoreError::BadCredentials)?;
        profile.last_login = Utc::now();
        let snapshot = profile.snapshot();
        inner.logged_in.insert(username.to_owned());
        self.persist(&inner).await?;

        debug!(username, "authenticated");
        Ok(snapshot)
    }

    /// Release a username from the single-login set (session close).
    pub async fn release(&self, username: &str) {
        let mut inner = self.inner.lock().await;
        inner.logged_in.remove(username);
    }

    /// Whether a username is currently bound to a session.
    pub async fn is_logged_in(&self, username: &str) -> bool {
        self.inner.lock().await.logged_in.contains(username)
    }

    /// Apply a finished match to the profile: add EXP, bump the game
    /// counters, and run the level-up loop. Per-unit levels are set to
    /// the account level on every level-up.
    pub async fn record_game_result(
        &self,
        username: &str,
        exp_delta: u32,
        won: bool,
    ) -> Result<GameResultRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let profile = inner
            .profiles
            .get_mut(username)
            .ok_or_else(|| StoreError::UnknownPlayer(username.to_owned()))?;

        profile.exp += exp_delta;
        profile.games_played += 1;
        if won {
            profile.games_won += 1;
        }

        let before = profile.level;
        while profile.exp >= required_exp(profile.level) {
            profile.exp -= required_exp(profile.level);
            profile.level += 1;
        }
        let levels_gained = profile.level - before;
        if levels_gained > 0 {
            let level = profile.level;
            for v in profile.troop_levels.values_mut() {
                *v = level;
            }
            for v in profile.tower_levels.values_mut() {
                *v = level;
            }
            info!(username, level, "player leveled up");
        }

        let record = GameResultRecord {
            level: profile.level,
            levels_gained,
        };
        self.persist(&inner).await?;
        Ok(record)
    }

    /// Current snapshot of a profile.
    pub async fn snapshot(&self, username: &str) -> Option<ProfileSnapshot> {
        let inner = self.inner.lock().await;
        inner.profiles.get(username).map(PlayerProfile::snapshot)
    }

    /// Write the full profile set to disk atomically. Called with the
    /// store mutex held so writes are serialized.
    async fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let file = StoreFile {
            players: inner.profiles.values().cloned().collect(),
        };
        let encoded = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn validate_username(username: &str) -> Result<(), StoreError> {
    let len_ok = (USERNAME_MIN..=USERNAME_MAX).contains(&username.len());
    let chars_ok = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if len_ok && chars_ok && !username.is_empty() {
        Ok(())
    } else {
        Err(StoreError::InvalidUsername)
    }
}

fn validate_password(password: &str) -> Result<(), StoreError> {
    if password.len() >= PASSWORD_MIN {
        Ok(())
    } else {
        Err(StoreError::InvalidPassword)
    }
}

/// Hash a password with a fresh 16-byte salt: `hex(salt)$hex(sha256(salt || pw))`.
fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    format!("{}${}", hex::encode(salt), hex::encode(digest(&salt, password)))
}

/// Constant-shape verification against a stored `salt$digest` pair.
fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    hex::encode(digest(&salt, password)) == digest_hex
}

fn digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}
