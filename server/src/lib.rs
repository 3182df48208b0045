//! # Word Scramble Server Library
//!
//! This library implements the authoritative server for the multiplayer
//! word-scramble game. It authenticates players, queues them for
//! matchmaking, and runs concurrent game sessions where matched groups
//! race to unscramble a secret word.
//!
//! ## Architecture
//!
//! The server is a set of cooperating async tasks, each owning the
//! connections currently in its stage of the player lifecycle:
//!
//! - **Authentication loop** (`auth`): accepts TCP connections and walks
//!   each through the token or credentials login conversation.
//! - **Queue loop** (`queue`): holds authenticated players waiting for a
//!   match, enforces the silent-client timeout, and refreshes session
//!   tokens that expire while waiting.
//! - **Dispatcher** (`dispatcher`): takes a session permit from the pool,
//!   then asks the queue for a matched group and spawns a game session.
//! - **Game sessions** (`game`): one task per match; run the ready
//!   barrier, the guessing round, and the elo settlement, then return
//!   rematch players to the queue.
//! - **Status reporter** (`status`): periodic read-only log snapshot.
//!
//! Connections migrate between stages by ownership transfer: the source
//! loop deregisters the socket from its [`connection::ConnSet`] and sends
//! it over the destination loop's intake channel, so exactly one task
//! reads from any socket at a time and the socket never closes in
//! transit.
//!
//! Shared state is limited to two registries: the player directory
//! (accounts, elo, tokens) and the matchmaking membership, each behind a
//! reader/writer lock. Whenever both are held, the directory lock is
//! taken first.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{start, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handle = start(Config::default()).await?;
//!     println!("listening on {}", handle.addr);
//!     // The loops run as background tasks until the process exits.
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod game;
pub mod queue;
pub mod status;

use crate::auth::AuthLoop;
use crate::directory::{PlayerDirectory, SharedDirectory, TOKEN_TTL};
use crate::dispatcher::{Dispatcher, MAX_CONCURRENT_GAMES};
use crate::queue::{
    GameMode, MatchQueue, QueueLoop, SharedMatchQueue, DISCONNECTION_TIMEOUT,
};
use crate::status::StatusReporter;
use log::info;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

/// Server configuration. The timeouts are overridable so tests can run
/// the expiry paths without waiting for the production values.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub game_mode: GameMode,
    pub players_per_game: usize,
    pub pool_size: usize,
    pub disconnection_timeout: Duration,
    pub token_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            game_mode: GameMode::Simple,
            players_per_game: 2,
            pool_size: MAX_CONCURRENT_GAMES,
            disconnection_timeout: DISCONNECTION_TIMEOUT,
            token_ttl: TOKEN_TTL,
        }
    }
}

/// Handle returned by [`start`]: the bound address plus the shared
/// registries, exposed for tests and embedding.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub directory: SharedDirectory,
    pub match_queue: SharedMatchQueue,
    pub pool: Arc<Semaphore>,
}

/// Boots every server task and returns once the listener is bound.
pub async fn start(config: Config) -> io::Result<ServerHandle> {
    let directory: SharedDirectory =
        Arc::new(RwLock::new(PlayerDirectory::new(config.token_ttl)));
    let match_queue: SharedMatchQueue =
        Arc::new(RwLock::new(MatchQueue::new(config.game_mode)));
    let pool = Arc::new(Semaphore::new(config.pool_size));

    let (queue_loop, queue_handle, queue_commands) = QueueLoop::new(
        directory.clone(),
        match_queue.clone(),
        config.disconnection_timeout,
    );
    tokio::spawn(queue_loop.run());

    let listener = auth::bind(&config.host, config.port).await?;
    let addr = listener.local_addr()?;
    let auth_loop = AuthLoop::new(listener, directory.clone(), queue_handle.clone());
    tokio::spawn(auth_loop.run());

    let dispatcher = Dispatcher::new(
        directory.clone(),
        match_queue.clone(),
        queue_commands,
        queue_handle,
        pool.clone(),
        config.pool_size,
        config.players_per_game,
    );
    tokio::spawn(dispatcher.run());

    let reporter = StatusReporter::new(
        directory.clone(),
        match_queue.clone(),
        pool.clone(),
        config.pool_size,
    );
    tokio::spawn(reporter.run());

    info!(
        "server listening on {} ({:?} mode, {} players per game)",
        addr, config.game_mode, config.players_per_game
    );

    Ok(ServerHandle {
        addr,
        directory,
        match_queue,
        pool,
    })
}
