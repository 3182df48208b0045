//! In-memory player directory: accounts, credentials, elo, session tokens.
//!
//! One instance is shared by every loop behind a single reader/writer lock.
//! Methods that check and then mutate (registration, login, token login)
//! are single calls so the caller's write guard covers the whole sequence.

use log::info;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Directory handle shared by every server loop.
pub type SharedDirectory = Arc<RwLock<PlayerDirectory>>;

/// Elo every new account starts with.
pub const STARTING_ELO: i32 = 400;
/// How long an issued session token stays valid.
pub const TOKEN_TTL: Duration = Duration::from_secs(50);

const TOKEN_LEN: usize = 32;

/// Rank tier derived from elo; recomputed after every elo change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rank {
    Bronze,
    Silver,
    Gold,
}

impl Rank {
    pub fn from_elo(elo: i32) -> Self {
        if elo < 801 {
            Rank::Bronze
        } else if elo < 951 {
            Rank::Silver
        } else {
            Rank::Gold
        }
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rank::Bronze => write!(f, "BRONZE"),
            Rank::Silver => write!(f, "SILVER"),
            Rank::Gold => write!(f, "GOLD"),
        }
    }
}

/// One registered account and its live session state.
#[derive(Debug)]
pub struct Player {
    pub username: String,
    password: String,
    pub elo: i32,
    pub rank: Rank,
    pub logged_in: bool,
    /// Connection currently bound to this player, while one is attached.
    pub conn: Option<u64>,
    /// Token the player may resume a dropped connection with; empty when none.
    pub waiting_token: String,
    /// Set while the player sits in the matchmaking queue.
    pub join_time: Option<Instant>,
}

impl Player {
    fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            elo: STARTING_ELO,
            rank: Rank::from_elo(STARTING_ELO),
            logged_in: false,
            conn: None,
            waiting_token: String::new(),
            join_time: None,
        }
    }
}

/// Registry of all known players plus the token-expiry map.
pub struct PlayerDirectory {
    players: HashMap<String, Player>,
    token_expiry: HashMap<String, Instant>,
    token_ttl: Duration,
}

impl PlayerDirectory {
    pub fn new(token_ttl: Duration) -> Self {
        Self {
            players: HashMap::new(),
            token_expiry: HashMap::new(),
            token_ttl,
        }
    }

    /// Registers a new account and logs it in, issuing a session token.
    ///
    /// Fails (returns `None`) when the username is taken or either field
    /// is empty. Check and insert happen under the caller's write guard.
    pub fn register(&mut self, username: &str, password: &str, now: Instant) -> Option<String> {
        if username.is_empty() || password.is_empty() || self.players.contains_key(username) {
            return None;
        }

        let mut player = Player::new(username, password);
        player.logged_in = true;
        self.players.insert(username.to_string(), player);
        info!("registered player {}", username);

        Some(self.issue_token(username, now))
    }

    /// Authenticates by credentials and logs the player in with a fresh
    /// token. Fails on unknown username, wrong password, or a player who
    /// is already logged in elsewhere.
    pub fn login(&mut self, username: &str, password: &str, now: Instant) -> Option<String> {
        let player = self.players.get_mut(username)?;
        if player.password != password || player.logged_in {
            return None;
        }
        player.logged_in = true;
        info!("player {} logged in", username);

        Some(self.issue_token(username, now))
    }

    /// Resumes a session by token.
    ///
    /// The token must exist in the expiry map, be unexpired, and belong to
    /// a player who is not already logged in. Returns the username on
    /// success; the caller is expected to issue a replacement token under
    /// the same write guard.
    pub fn login_by_token(&mut self, token: &str, now: Instant) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        match self.token_expiry.get(token) {
            Some(expiry) if now < *expiry => {}
            _ => return None,
        }

        let player = self
            .players
            .values_mut()
            .find(|p| p.waiting_token == token)?;
        if player.logged_in {
            return None;
        }
        player.logged_in = true;
        info!("player {} resumed by token", player.username);
        Some(player.username.clone())
    }

    /// Issues a new waiting token for the player, invalidating the prior
    /// one (its expiry entry is removed).
    pub fn issue_token(&mut self, username: &str, now: Instant) -> String {
        let token = generate_token();
        if let Some(player) = self.players.get_mut(username) {
            self.token_expiry.remove(&player.waiting_token);
            self.token_expiry
                .insert(token.clone(), now + self.token_ttl);
            player.waiting_token = token.clone();
        }
        token
    }

    /// Clears the player's waiting token and drops its expiry entry.
    /// Called when a match consumes the queued player.
    pub fn clear_waiting_token(&mut self, username: &str) {
        if let Some(player) = self.players.get_mut(username) {
            self.token_expiry.remove(&player.waiting_token);
            player.waiting_token.clear();
        }
    }

    /// Expiry instant of a token, if one is tracked.
    pub fn token_expiry_of(&self, token: &str) -> Option<Instant> {
        self.token_expiry.get(token).copied()
    }

    /// Whether the token is past its expiry (or untracked).
    pub fn token_expired(&self, token: &str, now: Instant) -> bool {
        match self.token_expiry.get(token) {
            Some(expiry) => now >= *expiry,
            None => true,
        }
    }

    /// Logs the player out and unbinds their connection.
    pub fn sign_out(&mut self, username: &str) {
        if let Some(player) = self.players.get_mut(username) {
            player.logged_in = false;
            player.conn = None;
            player.join_time = None;
            info!("player {} signed out", username);
        }
    }

    /// Marks a player logged out after an unexpected disconnect, keeping
    /// the waiting token so the session can be resumed.
    pub fn mark_logged_out(&mut self, username: &str) {
        if let Some(player) = self.players.get_mut(username) {
            player.logged_in = false;
            player.conn = None;
            player.join_time = None;
        }
    }

    /// Binds a live connection to the player.
    pub fn bind_conn(&mut self, username: &str, conn_id: u64) {
        if let Some(player) = self.players.get_mut(username) {
            player.conn = Some(conn_id);
        }
    }

    pub fn set_join_time(&mut self, username: &str, now: Instant) {
        if let Some(player) = self.players.get_mut(username) {
            player.join_time = Some(now);
        }
    }

    pub fn clear_join_time(&mut self, username: &str) {
        if let Some(player) = self.players.get_mut(username) {
            player.join_time = None;
        }
    }

    /// Applies an elo delta and recomputes the rank tier. Elo is not
    /// clamped; it may go negative.
    pub fn apply_elo_delta(&mut self, username: &str, delta: i32) {
        if let Some(player) = self.players.get_mut(username) {
            player.elo += delta;
            player.rank = Rank::from_elo(player.elo);
        }
    }

    /// Overwrites a player's elo directly. Used by tooling and tests.
    pub fn set_elo(&mut self, username: &str, elo: i32) {
        if let Some(player) = self.players.get_mut(username) {
            player.elo = elo;
            player.rank = Rank::from_elo(elo);
        }
    }

    pub fn get(&self, username: &str) -> Option<&Player> {
        self.players.get(username)
    }

    pub fn is_logged_in(&self, username: &str) -> bool {
        self.players.get(username).map(|p| p.logged_in).unwrap_or(false)
    }

    pub fn username_by_conn(&self, conn_id: u64) -> Option<&str> {
        self.players
            .values()
            .find(|p| p.conn == Some(conn_id))
            .map(|p| p.username.as_str())
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> PlayerDirectory {
        PlayerDirectory::new(Duration::from_secs(50))
    }

    #[test]
    fn test_register_new_player() {
        let mut dir = directory();
        let now = Instant::now();

        let token = dir.register("alice", "pw", now).unwrap();
        assert_eq!(token.len(), TOKEN_LEN);

        let player = dir.get("alice").unwrap();
        assert_eq!(player.elo, STARTING_ELO);
        assert_eq!(player.rank, Rank::Bronze);
        assert!(player.logged_in);
        assert_eq!(player.waiting_token, token);
    }

    #[test]
    fn test_register_rejects_duplicates_and_empty_fields() {
        let mut dir = directory();
        let now = Instant::now();

        assert!(dir.register("alice", "pw", now).is_some());
        assert!(dir.register("alice", "other", now).is_none());
        assert!(dir.register("", "pw", now).is_none());
        assert!(dir.register("bob", "", now).is_none());
    }

    #[test]
    fn test_login_checks_password_and_state() {
        let mut dir = directory();
        let now = Instant::now();
        dir.register("alice", "pw", now).unwrap();
        dir.sign_out("alice");

        assert!(dir.login("alice", "wrong", now).is_none());
        assert!(dir.login("nobody", "pw", now).is_none());

        assert!(dir.login("alice", "pw", now).is_some());
        // Second concurrent login is refused.
        assert!(dir.login("alice", "pw", now).is_none());
    }

    #[test]
    fn test_reissue_invalidates_previous_token() {
        let mut dir = directory();
        let now = Instant::now();

        let first = dir.register("alice", "pw", now).unwrap();
        assert!(dir.token_expiry_of(&first).is_some());

        let second = dir.issue_token("alice", now);
        assert!(dir.token_expiry_of(&first).is_none());
        assert!(dir.token_expiry_of(&second).is_some());
        assert_eq!(dir.get("alice").unwrap().waiting_token, second);
    }

    #[test]
    fn test_expired_token_is_invalid_even_if_present() {
        let mut dir = directory();
        let issued_at = Instant::now();

        let token = dir.register("alice", "pw", issued_at).unwrap();
        dir.sign_out("alice");

        let after_expiry = issued_at + TOKEN_TTL + Duration::from_secs(1);
        assert!(dir.token_expiry_of(&token).is_some());
        assert!(dir.token_expired(&token, after_expiry));
        assert!(dir.login_by_token(&token, after_expiry).is_none());
    }

    #[test]
    fn test_login_by_token_happy_path() {
        let mut dir = directory();
        let now = Instant::now();

        let token = dir.register("alice", "pw", now).unwrap();
        dir.mark_logged_out("alice");

        let username = dir.login_by_token(&token, now + Duration::from_secs(1)).unwrap();
        assert_eq!(username, "alice");
        assert!(dir.is_logged_in("alice"));

        // A logged-in player cannot be resumed again with the same token.
        assert!(dir.login_by_token(&token, now + Duration::from_secs(2)).is_none());
    }

    #[test]
    fn test_elo_delta_updates_rank_and_allows_negative() {
        let mut dir = directory();
        let now = Instant::now();
        dir.register("alice", "pw", now).unwrap();

        dir.apply_elo_delta("alice", 500);
        assert_eq!(dir.get("alice").unwrap().elo, 900);
        assert_eq!(dir.get("alice").unwrap().rank, Rank::Silver);

        dir.apply_elo_delta("alice", 100);
        assert_eq!(dir.get("alice").unwrap().rank, Rank::Gold);

        dir.apply_elo_delta("alice", -1500);
        assert_eq!(dir.get("alice").unwrap().elo, -500);
        assert_eq!(dir.get("alice").unwrap().rank, Rank::Bronze);
    }

    #[test]
    fn test_conn_binding_lookup() {
        let mut dir = directory();
        let now = Instant::now();
        dir.register("alice", "pw", now).unwrap();
        dir.register("bob", "pw", now).unwrap();

        dir.bind_conn("alice", 7);
        assert_eq!(dir.username_by_conn(7), Some("alice"));
        assert_eq!(dir.username_by_conn(8), None);

        dir.mark_logged_out("alice");
        assert_eq!(dir.username_by_conn(7), None);
    }

    #[test]
    fn test_clear_waiting_token_drops_expiry_entry() {
        let mut dir = directory();
        let now = Instant::now();
        let token = dir.register("alice", "pw", now).unwrap();

        dir.clear_waiting_token("alice");
        assert!(dir.token_expiry_of(&token).is_none());
        assert!(dir.get("alice").unwrap().waiting_token.is_empty());
    }

    #[test]
    fn test_rank_boundaries() {
        assert_eq!(Rank::from_elo(800), Rank::Bronze);
        assert_eq!(Rank::from_elo(801), Rank::Silver);
        assert_eq!(Rank::from_elo(950), Rank::Silver);
        assert_eq!(Rank::from_elo(951), Rank::Gold);
    }
}
