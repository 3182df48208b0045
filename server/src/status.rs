//! Periodic status reporter: a read-only snapshot of the server, logged
//! at a fixed cadence for operators watching the console.
//!
//! Takes the directory lock before the queue lock like everything else,
//! and mutates nothing.

use crate::directory::SharedDirectory;
use crate::queue::SharedMatchQueue;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::interval;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

pub struct StatusReporter {
    directory: SharedDirectory,
    match_queue: SharedMatchQueue,
    pool: Arc<Semaphore>,
    pool_size: usize,
}

impl StatusReporter {
    pub fn new(
        directory: SharedDirectory,
        match_queue: SharedMatchQueue,
        pool: Arc<Semaphore>,
        pool_size: usize,
    ) -> Self {
        Self {
            directory,
            match_queue,
            pool,
            pool_size,
        }
    }

    pub async fn run(self) {
        let mut tick = interval(REPORT_INTERVAL);
        loop {
            tick.tick().await;

            let (registered, logged_in) = {
                let dir = self.directory.read().await;
                for player in dir.players() {
                    debug!(
                        "player {} [{} {}] online={} token={}",
                        player.username,
                        player.rank,
                        player.elo,
                        player.logged_in,
                        if player.waiting_token.is_empty() {
                            "-"
                        } else {
                            player.waiting_token.as_str()
                        }
                    );
                }
                let logged_in = dir.players().filter(|p| p.logged_in).count();
                (dir.len(), logged_in)
            };

            let queued = {
                let queue = self.match_queue.read().await;
                let order: Vec<&str> = queue.usernames().collect();
                if !order.is_empty() {
                    debug!("queue order: {}", order.join(", "));
                }
                queue.len()
            };
            let games = self.pool_size - self.pool.available_permits();

            info!(
                "status: {} registered, {} online, {} queued, {}/{} games running",
                registered, logged_in, queued, games, self.pool_size
            );
        }
    }
}
