//! Session directory: registered users, credentials and who is logged in.
//!
//! One explicitly constructed directory is shared by every protocol engine
//! through an `Arc`. All check-and-set operations run under a single lock, so
//! two connections racing to log in the same user can never both succeed.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    clock::{Clock, SystemClock},
    registry::ConnectionId,
};

/// Result of a login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Known user, matching credential, now logged in
    LoggedIn,
    /// Unknown user, created with the given credential and logged in
    Registered,
    /// Known user, credential does not match. No state change
    WrongCredential,
    /// Known user already logged in on another connection. No state change
    AlreadyLoggedInElsewhere,
    /// The calling connection already authenticated. Produced by the engine,
    /// never by the directory
    ThisConnectionAlreadyAuthenticated,
}

impl LoginOutcome {
    /// Whether the caller is now logged in.
    pub fn is_success(self) -> bool {
        matches!(self, Self::LoggedIn | Self::Registered)
    }
}

/// One login of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    /// Connection the login came from
    pub connection_id: ConnectionId,
    /// When the login succeeded
    pub login_at_secs: u64,
    /// When the user logged out. `None` while logged in
    pub logout_at_secs: Option<u64>,
}

#[derive(Debug)]
struct UserEntry {
    credential: String,
    registered_at_secs: u64,
    /// Connection currently logged in as this user
    active: Option<ConnectionId>,
    history: Vec<LoginRecord>,
}

impl UserEntry {
    fn open_session(&mut self, connection_id: ConnectionId, now: u64) {
        self.active = Some(connection_id);
        self.history.push(LoginRecord { connection_id, login_at_secs: now, logout_at_secs: None });
    }
}

/// Directory of users and their login state.
///
/// Users are never deleted. A username is logged in from at most one
/// connection at a time.
pub struct SessionDirectory {
    users: Mutex<HashMap<String, UserEntry>>,
    clock: Box<dyn Clock>,
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectory").field("users", &self.user_count()).finish_non_exhaustive()
    }
}

impl SessionDirectory {
    /// Empty directory stamped with the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Empty directory stamped with `clock`.
    pub fn with_clock(clock: impl Clock) -> Self {
        Self { users: Mutex::new(HashMap::new()), clock: Box::new(clock) }
    }

    /// Log `username` in from `connection_id`, registering it if unknown.
    ///
    /// Precedence for a known user: already logged in, then credential check.
    pub fn login(
        &self,
        connection_id: ConnectionId,
        username: &str,
        credential: &str,
    ) -> LoginOutcome {
        let now = self.clock.wall_clock_secs();
        let mut users = self.lock();

        let Some(entry) = users.get_mut(username) else {
            let mut entry = UserEntry {
                credential: credential.to_owned(),
                registered_at_secs: now,
                active: None,
                history: Vec::new(),
            };
            entry.open_session(connection_id, now);
            users.insert(username.to_owned(), entry);

            tracing::info!(%connection_id, username, "registered new user");
            return LoginOutcome::Registered;
        };

        if entry.active.is_some() {
            return LoginOutcome::AlreadyLoggedInElsewhere;
        }

        if entry.credential != credential {
            return LoginOutcome::WrongCredential;
        }

        entry.open_session(connection_id, now);
        LoginOutcome::LoggedIn
    }

    /// Clear the logged-in flag and close the open login record.
    ///
    /// Idempotent. Returns whether the user was logged in.
    pub fn logout(&self, username: &str) -> bool {
        let now = self.clock.wall_clock_secs();
        let mut users = self.lock();

        let Some(entry) = users.get_mut(username) else {
            return false;
        };
        if entry.active.take().is_none() {
            return false;
        }

        if let Some(record) = entry.history.last_mut() {
            record.logout_at_secs = Some(now);
        }
        true
    }

    /// Insert `username` with `credential` if absent.
    ///
    /// Returns `false` if the user already exists; its credential is kept.
    pub fn register(&self, username: &str, credential: &str) -> bool {
        let now = self.clock.wall_clock_secs();
        let mut users = self.lock();

        if users.contains_key(username) {
            return false;
        }
        users.insert(username.to_owned(), UserEntry {
            credential: credential.to_owned(),
            registered_at_secs: now,
            active: None,
            history: Vec::new(),
        });
        true
    }

    /// Whether `username` exists and `credential` matches.
    pub fn validate(&self, username: &str, credential: &str) -> bool {
        self.lock().get(username).is_some_and(|entry| entry.credential == credential)
    }

    /// Whether `username` is currently logged in.
    pub fn is_logged_in(&self, username: &str) -> bool {
        self.active_connection(username).is_some()
    }

    /// Connection `username` is logged in from.
    pub fn active_connection(&self, username: &str) -> Option<ConnectionId> {
        self.lock().get(username).and_then(|entry| entry.active)
    }

    /// When `username` was registered. `None` if unknown.
    pub fn registered_at_secs(&self, username: &str) -> Option<u64> {
        self.lock().get(username).map(|entry| entry.registered_at_secs)
    }

    /// All logins of `username`, oldest first.
    pub fn login_history(&self, username: &str) -> Vec<LoginRecord> {
        self.lock().get(username).map(|entry| entry.history.clone()).unwrap_or_default()
    }

    /// Number of registered users.
    pub fn user_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UserEntry>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
