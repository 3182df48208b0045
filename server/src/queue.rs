//! Matchmaking queue: ordered membership, the two matching algorithms,
//! and the queue loop that owns waiting connections.
//!
//! The membership structure lives behind its own reader/writer lock,
//! independent of the player directory lock. Wherever both are held the
//! directory lock is acquired first; that order is fixed server-wide.

use crate::connection::{ConnSet, Connection, Event, POLL_INTERVAL_MS};
use crate::directory::SharedDirectory;
use log::{debug, info, warn};
use shared::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::interval;

/// How long a queued connection may stay silent before it is
/// force-disconnected.
pub const DISCONNECTION_TIMEOUT: Duration = Duration::from_secs(20);
/// Starting ceiling for the elo spread of a ranked match.
pub const INITIAL_ACCEPTABLE_DIFFERENCE: i32 = 100;
/// Multiplier applied to the acceptable difference each time the
/// relaxation window elapses without a match.
pub const RELAXATION_FACTOR: f64 = 1.4;
/// How long ranked matching tolerates no match before relaxing.
pub const RELAXATION_WINDOW: Duration = Duration::from_secs(60);

/// Which comparator orders the queue and which matcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameMode {
    Simple,
    Ranked,
}

/// One queued player. Elo and join time are captured at insertion, which
/// is when the ordering is decided.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub username: String,
    pub elo: i32,
    pub joined: Instant,
}

/// Ordered matchmaking membership, unique by username.
///
/// Entries are kept sorted by the mode comparator: Simple orders by join
/// time then username; Ranked by elo descending, then join time, then
/// username. Both comparators are total, so matching is deterministic.
pub struct MatchQueue {
    mode: GameMode,
    entries: Vec<QueueEntry>,
    acceptable_difference: i32,
    relax_at: Instant,
}

impl MatchQueue {
    pub fn new(mode: GameMode) -> Self {
        Self {
            mode,
            entries: Vec::new(),
            acceptable_difference: INITIAL_ACCEPTABLE_DIFFERENCE,
            relax_at: Instant::now() + RELAXATION_WINDOW,
        }
    }

    pub fn mode(&self) -> GameMode {
        self.mode
    }

    fn compare(&self, a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
        match self.mode {
            GameMode::Simple => a
                .joined
                .cmp(&b.joined)
                .then_with(|| a.username.cmp(&b.username)),
            GameMode::Ranked => b
                .elo
                .cmp(&a.elo)
                .then_with(|| a.joined.cmp(&b.joined))
                .then_with(|| a.username.cmp(&b.username)),
        }
    }

    /// Inserts a player at their ordered position. Rejects duplicates.
    pub fn insert(&mut self, entry: QueueEntry) -> bool {
        if self.contains(&entry.username) {
            return false;
        }
        let idx = self
            .entries
            .partition_point(|e| self.compare(e, &entry) == std::cmp::Ordering::Less);
        self.entries.insert(idx, entry);
        true
    }

    pub fn remove(&mut self, username: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.username != username);
        before != self.entries.len()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.entries.iter().any(|e| e.username == username)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.username.as_str())
    }

    /// Number of queued players satisfying the eligibility predicate
    /// (in practice: still logged in).
    pub fn eligible_count<F>(&self, eligible: F) -> usize
    where
        F: Fn(&QueueEntry) -> bool,
    {
        self.entries.iter().filter(|e| eligible(e)).count()
    }

    /// Current elo-spread ceiling for ranked matching.
    pub fn acceptable_difference(&self) -> i32 {
        self.acceptable_difference
    }

    /// Drops entries failing the predicate. Used by the background
    /// cleanup of logged-out players with expired tokens.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: Fn(&QueueEntry) -> bool,
    {
        self.entries.retain(|e| keep(e));
    }

    /// Simple-mode matching: the `count` most senior eligible players.
    ///
    /// Removes and returns exactly `count` usernames, or returns `None`
    /// and leaves the queue untouched.
    pub fn match_simple<F>(&mut self, count: usize, eligible: F) -> Option<Vec<String>>
    where
        F: Fn(&QueueEntry) -> bool,
    {
        let picked: Vec<String> = self
            .entries
            .iter()
            .filter(|e| eligible(e))
            .take(count)
            .map(|e| e.username.clone())
            .collect();

        if picked.len() < count {
            return None;
        }
        for username in &picked {
            self.remove(username);
        }
        Some(picked)
    }

    /// Ranked matching: slides a window of `count` consecutive eligible
    /// players in descending-elo order and accepts the first window whose
    /// spread fits the current acceptable difference.
    ///
    /// On success the threshold resets to its initial value. With no
    /// acceptable window, the threshold relaxes by [`RELAXATION_FACTOR`]
    /// once per elapsed [`RELAXATION_WINDOW`], compounding, so outliers
    /// cannot wait forever.
    pub fn match_ranked<F>(&mut self, count: usize, now: Instant, eligible: F) -> Option<Vec<String>>
    where
        F: Fn(&QueueEntry) -> bool,
    {
        let active: Vec<(i32, String)> = self
            .entries
            .iter()
            .filter(|e| eligible(e))
            .map(|e| (e.elo, e.username.clone()))
            .collect();

        if active.len() >= count {
            for window in active.windows(count) {
                let spread = window[0].0 - window[count - 1].0;
                if spread <= self.acceptable_difference {
                    self.acceptable_difference = INITIAL_ACCEPTABLE_DIFFERENCE;
                    self.relax_at = now + RELAXATION_WINDOW;

                    let picked: Vec<String> =
                        window.iter().map(|(_, name)| name.clone()).collect();
                    for username in &picked {
                        self.remove(username);
                    }
                    return Some(picked);
                }
            }
        }

        if now >= self.relax_at {
            self.acceptable_difference =
                (self.acceptable_difference as f64 * RELAXATION_FACTOR) as i32;
            self.relax_at = now + RELAXATION_WINDOW;
            debug!(
                "ranked matching relaxed acceptable difference to {}",
                self.acceptable_difference
            );
        }
        None
    }
}

/// Shared handles to the two lock-guarded registries.
pub type SharedMatchQueue = Arc<RwLock<MatchQueue>>;

/// A connection entering the queue together with its authenticated
/// identity. Sent by the auth loop and by game sessions on rematch.
pub struct QueueIntake {
    pub username: String,
    pub conn: Connection,
}

/// A matched player leaving the queue, with their owned connection.
pub struct MatchedPlayer {
    pub username: String,
    pub conn: Connection,
}

/// Control commands the dispatcher sends to the queue loop.
pub enum QueueCommand {
    /// Atomically match-and-remove `count` players. Replies with the full
    /// group, or an empty vector when no acceptable group exists.
    TryMatch {
        count: usize,
        reply: oneshot::Sender<Vec<MatchedPlayer>>,
    },
}

/// Cloneable sender used to admit (or re-admit) a connection to the queue.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueIntake>,
}

impl QueueHandle {
    pub fn admit(&self, username: String, conn: Connection) {
        if let Err(e) = self.tx.send(QueueIntake { username, conn }) {
            warn!(
                "queue loop is gone; dropping connection for {}",
                e.0.username
            );
        }
    }
}

/// The queue loop: owns waiting connections, their timeout deadlines, and
/// answers dispatcher match requests.
pub struct QueueLoop {
    conns: ConnSet,
    deadlines: HashMap<u64, Instant>,
    directory: SharedDirectory,
    match_queue: SharedMatchQueue,
    disconnection_timeout: Duration,
    intake_rx: mpsc::UnboundedReceiver<QueueIntake>,
    command_rx: mpsc::UnboundedReceiver<QueueCommand>,
}

impl QueueLoop {
    /// Builds the loop plus the handles other components talk to it with.
    pub fn new(
        directory: SharedDirectory,
        match_queue: SharedMatchQueue,
        disconnection_timeout: Duration,
    ) -> (Self, QueueHandle, mpsc::UnboundedSender<QueueCommand>) {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let queue_loop = Self {
            conns: ConnSet::new(),
            deadlines: HashMap::new(),
            directory,
            match_queue,
            disconnection_timeout,
            intake_rx,
            command_rx,
        };
        (queue_loop, QueueHandle { tx: intake_tx }, command_tx)
    }

    /// Runs forever: admits newcomers, sweeps readable sockets, enforces
    /// timeouts, and serves match requests.
    pub async fn run(mut self) {
        let mut tick = interval(Duration::from_millis(POLL_INTERVAL_MS));
        loop {
            tokio::select! {
                Some(intake) = self.intake_rx.recv() => {
                    self.admit(intake).await;
                }
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }
                _ = tick.tick() => {
                    let events = self.conns.poll();
                    for (conn_id, event) in events {
                        match event {
                            Event::Message(message) => {
                                self.handle_message(conn_id, message).await;
                            }
                            Event::Closed => self.handle_disconnect(conn_id).await,
                        }
                    }
                    self.sweep_timeouts().await;
                    self.clean_expired().await;
                }
            }
        }
    }

    /// Admits an authenticated connection: binds it to the player, inserts
    /// the ordered membership entry, registers for reads, arms the
    /// disconnection deadline, and confirms to the client.
    async fn admit(&mut self, intake: QueueIntake) {
        let QueueIntake { username, mut conn } = intake;
        let now = Instant::now();

        // Directory lock before queue lock, always.
        let (entry, fresh_token) = {
            let mut dir = self.directory.write().await;
            if !dir.is_logged_in(&username) {
                warn!("refusing to queue {}: not logged in", username);
                return;
            }
            dir.bind_conn(&username, conn.id());
            dir.set_join_time(&username, now);
            // A player whose token was consumed by a match gets a
            // replacement before they wait again.
            let needs_token = dir
                .get(&username)
                .map(|p| p.waiting_token.is_empty())
                .unwrap_or(false);
            let fresh_token = if needs_token {
                Some(dir.issue_token(&username, now))
            } else {
                None
            };
            let elo = dir.get(&username).map(|p| p.elo).unwrap_or(0);
            (
                QueueEntry {
                    username: username.clone(),
                    elo,
                    joined: now,
                },
                fresh_token,
            )
        };

        if !self.match_queue.write().await.insert(entry) {
            debug!("{} is already queued", username);
        }

        if conn
            .send(&Message::QueueStart("You are in queue".to_string()))
            .is_err()
        {
            // The socket died between auth and here; the next sweep of the
            // registered connection reports Closed and cleans up.
            warn!("failed to greet {} in queue", username);
        }
        if let Some(token) = fresh_token {
            if let Err(e) = conn.send(&Message::QueueTokenRefresh(token)) {
                warn!("{}: replacement token send failed: {}", username, e);
            }
        }

        self.deadlines
            .insert(conn.id(), now + self.disconnection_timeout);
        self.conns.register(conn);
        info!("{} entered the matchmaking queue", username);
    }

    /// Handles one inbound message from a queued connection: refreshes the
    /// disconnection deadline, refreshes an expired token for a logged-in
    /// player, and acknowledges with the waiting notice.
    async fn handle_message(&mut self, conn_id: u64, message: Message) {
        let now = Instant::now();
        self.deadlines
            .insert(conn_id, now + self.disconnection_timeout);

        let refreshed_token = {
            let mut dir = self.directory.write().await;
            match dir.username_by_conn(conn_id).map(str::to_string) {
                Some(username) => {
                    let needs_refresh = dir
                        .get(&username)
                        .map(|p| {
                            p.logged_in
                                && !p.waiting_token.is_empty()
                                && dir.token_expired(&p.waiting_token, now)
                        })
                        .unwrap_or(false);
                    if needs_refresh {
                        Some(dir.issue_token(&username, now))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(token) = refreshed_token {
            if let Some(conn) = self.conns.get_mut(conn_id) {
                if let Err(e) = conn.send(&Message::QueueTokenRefresh(token)) {
                    warn!("conn {}: token refresh send failed: {}", conn_id, e);
                }
            }
        }

        match message {
            Message::QueueResponse(_) | Message::QueueTokenRefreshOk => {
                if let Some(conn) = self.conns.get_mut(conn_id) {
                    if let Err(e) = conn.send(&Message::QueueWaiting("queue...".to_string())) {
                        warn!("conn {}: waiting ack failed: {}", conn_id, e);
                    }
                }
            }
            other => {
                debug!("conn {}: ignoring {:?} while queued", conn_id, other);
            }
        }
    }

    /// Uniform peer-disconnect cleanup: mark logged out, drop membership,
    /// close the socket. The waiting token survives so the player can
    /// resume within its TTL.
    async fn handle_disconnect(&mut self, conn_id: u64) {
        self.deadlines.remove(&conn_id);
        let username = {
            let mut dir = self.directory.write().await;
            let username = dir.username_by_conn(conn_id).map(str::to_string);
            if let Some(name) = &username {
                dir.mark_logged_out(name);
            }
            username
        };
        if let Some(name) = &username {
            self.match_queue.write().await.remove(name);
            info!("{} disconnected while queued", name);
        }
        // Dropping the connection closes the socket.
        self.conns.deregister(conn_id);
    }

    /// Force-disconnects every connection whose deadline elapsed. The
    /// notice is best-effort and the socket closes exactly once, because
    /// the deadline entry and the registration both go away here.
    async fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for conn_id in expired {
            self.deadlines.remove(&conn_id);

            let username = {
                let mut dir = self.directory.write().await;
                let username = dir.username_by_conn(conn_id).map(str::to_string);
                if let Some(name) = &username {
                    dir.mark_logged_out(name);
                }
                username
            };
            if let Some(name) = &username {
                self.match_queue.write().await.remove(name);
            }

            if let Some(mut conn) = self.conns.deregister(conn_id) {
                let _ = conn.send(&Message::QueueClientTimeout(
                    "Timeout. You are being disconnected.".to_string(),
                ));
                info!(
                    "conn {} timed out in queue ({})",
                    conn_id,
                    username.as_deref().unwrap_or("unbound")
                );
            }
        }
    }

    /// Background cleanup: queued players who are logged out and whose
    /// waiting token has expired can never come back; drop their entries
    /// so abandoned connections do not grow the queue without bound.
    async fn clean_expired(&mut self) {
        let now = Instant::now();
        let dir = self.directory.read().await;
        let mut queue = self.match_queue.write().await;
        queue.retain(|entry| match dir.get(&entry.username) {
            Some(player) => {
                player.logged_in || !dir.token_expired(&player.waiting_token, now)
            }
            None => false,
        });
    }

    async fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::TryMatch { count, reply } => {
                let group = self.try_match(count).await;
                let _ = reply.send(group);
            }
        }
    }

    /// Runs the mode's matching algorithm and, on success, atomically
    /// removes the matched players from the membership, cancels their
    /// read registration and timeout records, and clears their waiting
    /// tokens. Returns the full group or nothing.
    async fn try_match(&mut self, count: usize) -> Vec<MatchedPlayer> {
        let now = Instant::now();
        let mut dir = self.directory.write().await;
        let mut queue = self.match_queue.write().await;

        let matched = match queue.mode() {
            GameMode::Simple => {
                queue.match_simple(count, |entry| dir.is_logged_in(&entry.username))
            }
            GameMode::Ranked => {
                queue.match_ranked(count, now, |entry| dir.is_logged_in(&entry.username))
            }
        };

        let usernames = match matched {
            Some(usernames) => usernames,
            None => return Vec::new(),
        };

        let mut group = Vec::new();
        for username in usernames {
            dir.clear_waiting_token(&username);
            dir.clear_join_time(&username);
            let conn_id = dir.get(&username).and_then(|p| p.conn);
            match conn_id.and_then(|id| {
                self.deadlines.remove(&id);
                self.conns.deregister(id)
            }) {
                Some(conn) => group.push(MatchedPlayer { username, conn }),
                None => warn!("matched {} without a live connection", username),
            }
        }

        if group.len() == count {
            info!(
                "matched {} players: {}",
                count,
                group
                    .iter()
                    .map(|p| p.username.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            group
        } else {
            // A participant vanished mid-match; abort rather than start a
            // short-handed session. Survivors are re-queued untouched.
            drop(queue);
            drop(dir);
            for player in group {
                self.admit(QueueIntake {
                    username: player.username,
                    conn: player.conn,
                })
                .await;
            }
            Vec::new()
        }
    }
}
