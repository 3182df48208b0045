//! Dispatcher: watches the queue and starts game sessions, capped by the
//! session pool.
//!
//! Admission control happens before any player leaves the queue: a permit
//! is taken from the pool first, and only then is the queue asked to match
//! and surrender a group. A failed match returns the permit untouched, so
//! the pool can never leak capacity and players are never pulled out of
//! the queue without a session to join.

use crate::directory::SharedDirectory;
use crate::game::GameSession;
use crate::queue::{QueueCommand, QueueHandle, SharedMatchQueue};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::interval;

/// How many game sessions may run at once.
pub const MAX_CONCURRENT_GAMES: usize = 5;

/// How often the dispatcher checks for a startable game.
const DISPATCH_INTERVAL_MS: u64 = 50;

pub struct Dispatcher {
    directory: SharedDirectory,
    match_queue: SharedMatchQueue,
    queue_commands: mpsc::UnboundedSender<QueueCommand>,
    queue_handle: QueueHandle,
    pool: Arc<Semaphore>,
    pool_size: usize,
    players_per_game: usize,
}

impl Dispatcher {
    pub fn new(
        directory: SharedDirectory,
        match_queue: SharedMatchQueue,
        queue_commands: mpsc::UnboundedSender<QueueCommand>,
        queue_handle: QueueHandle,
        pool: Arc<Semaphore>,
        pool_size: usize,
        players_per_game: usize,
    ) -> Self {
        Self {
            directory,
            match_queue,
            queue_commands,
            queue_handle,
            pool,
            pool_size,
            players_per_game,
        }
    }

    pub async fn run(self) {
        let mut tick = interval(Duration::from_millis(DISPATCH_INTERVAL_MS));
        loop {
            tick.tick().await;
            self.try_dispatch().await;
        }
    }

    /// One dispatch attempt: cheap eligibility check, then permit, then
    /// the atomic match request.
    async fn try_dispatch(&self) {
        let eligible = {
            let dir = self.directory.read().await;
            let queue = self.match_queue.read().await;
            queue.eligible_count(|entry| dir.is_logged_in(&entry.username))
        };
        if eligible < self.players_per_game {
            return;
        }

        let permit = match self.pool.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .queue_commands
            .send(QueueCommand::TryMatch {
                count: self.players_per_game,
                reply: reply_tx,
            })
            .is_err()
        {
            warn!("queue loop is gone; dispatcher idle");
            return;
        }

        let group = match reply_rx.await {
            Ok(group) => group,
            Err(_) => return,
        };

        if group.is_empty() {
            // No acceptable group right now; the permit goes back.
            return;
        }

        info!(
            "dispatching game ({}/{} sessions busy)",
            self.pool_size - self.pool.available_permits(),
            self.pool_size
        );
        let session = GameSession::new(
            group,
            self.directory.clone(),
            self.queue_handle.clone(),
            permit,
        );
        tokio::spawn(session.run());
    }
}
