//! Authentication loop: accepts sockets and walks each one through the
//! login conversation before handing it to the matchmaking queue.
//!
//! Every connection carries a small state machine. The token path lets a
//! player who dropped mid-queue resume their session; when the token is
//! rejected the conversation falls back to the credentials path instead
//! of hanging up.

use crate::connection::{ConnSet, Connection, Event, POLL_INTERVAL_MS};
use crate::directory::SharedDirectory;
use crate::queue::QueueHandle;
use log::{debug, info, warn};
use shared::Message;
use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::interval;

/// Where a connection stands in the login conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthState {
    /// Greeted; waiting for the client to pick token or credentials.
    Start,
    /// Asked for the resume token.
    AwaitingToken,
    /// Asked whether to register (1) or log in (2).
    AwaitingChoice,
    /// Asked for username and password.
    AwaitingCredentials { register: bool },
}

/// The authentication loop. Owns the listener and every connection that
/// has not finished logging in.
pub struct AuthLoop {
    listener: TcpListener,
    conns: ConnSet,
    states: HashMap<u64, AuthState>,
    directory: SharedDirectory,
    queue: QueueHandle,
}

impl AuthLoop {
    pub fn new(
        listener: TcpListener,
        directory: SharedDirectory,
        queue: QueueHandle,
    ) -> Self {
        Self {
            listener,
            conns: ConnSet::new(),
            states: HashMap::new(),
            directory,
            queue,
        }
    }

    pub async fn run(mut self) {
        let mut tick = interval(Duration::from_millis(POLL_INTERVAL_MS));
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("accepted connection from {}", addr);
                            self.greet(Connection::new(stream));
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
                _ = tick.tick() => {
                    let events = self.conns.poll();
                    for (conn_id, event) in events {
                        match event {
                            Event::Message(message) => {
                                self.handle_message(conn_id, message).await;
                            }
                            Event::Closed => {
                                debug!("conn {} left during authentication", conn_id);
                                self.states.remove(&conn_id);
                                self.conns.deregister(conn_id);
                            }
                        }
                    }
                }
            }
        }
    }

    fn greet(&mut self, mut conn: Connection) {
        let id = conn.id();
        if conn
            .send(&Message::AuthStart(
                "Welcome! Authenticate with a token or with credentials.".to_string(),
            ))
            .is_err()
        {
            return;
        }
        self.states.insert(id, AuthState::Start);
        self.conns.register(conn);
    }

    async fn handle_message(&mut self, conn_id: u64, message: Message) {
        let state = match self.states.get(&conn_id) {
            Some(state) => state.clone(),
            None => return,
        };

        match (state, message) {
            (AuthState::Start, Message::AuthStartToken) => {
                self.prompt(
                    conn_id,
                    AuthState::AwaitingToken,
                    Message::AuthRequestToken("Enter your token:".to_string()),
                );
            }
            (AuthState::Start, Message::AuthStartCredentials) => {
                self.prompt_choice(conn_id);
            }
            (AuthState::AwaitingToken, Message::AuthResponseToken(token)) => {
                self.try_token_login(conn_id, &token).await;
            }
            (AuthState::AwaitingChoice, Message::AuthResponseChoice(choice)) => {
                match choice {
                    1 => {
                        self.prompt(
                            conn_id,
                            AuthState::AwaitingCredentials { register: true },
                            Message::AuthRequestCredentials(
                                "Register: enter username and password.".to_string(),
                            ),
                        );
                    }
                    2 => {
                        self.prompt(
                            conn_id,
                            AuthState::AwaitingCredentials { register: false },
                            Message::AuthRequestCredentials(
                                "Login: enter username and password.".to_string(),
                            ),
                        );
                    }
                    other => {
                        debug!("conn {}: invalid auth choice {}", conn_id, other);
                        self.prompt_choice(conn_id);
                    }
                }
            }
            (
                AuthState::AwaitingCredentials { register },
                Message::AuthResponseCredentials { username, password },
            ) => {
                self.try_credentials(conn_id, register, &username, &password)
                    .await;
            }
            (state, message) => {
                // Out-of-order input does not advance the conversation.
                debug!(
                    "conn {}: ignoring {:?} in state {:?}",
                    conn_id, message, state
                );
            }
        }
    }

    /// Moves the state machine forward and sends the next prompt.
    fn prompt(&mut self, conn_id: u64, next: AuthState, message: Message) {
        self.states.insert(conn_id, next);
        self.send_or_drop(conn_id, &message);
    }

    fn prompt_choice(&mut self, conn_id: u64) {
        self.prompt(
            conn_id,
            AuthState::AwaitingChoice,
            Message::AuthRequestChoice(
                "Press 1 to register, 2 to login.".to_string(),
            ),
        );
    }

    async fn try_token_login(&mut self, conn_id: u64, token: &str) {
        // Consuming a token replaces it, under the same write guard.
        let resumed = {
            let now = Instant::now();
            let mut dir = self.directory.write().await;
            dir.login_by_token(token, now).map(|username| {
                let fresh = dir.issue_token(&username, now);
                (username, fresh)
            })
        };

        match resumed {
            Some((username, fresh)) => {
                info!("{} resumed session by token", username);
                self.finish(conn_id, &username, &fresh).await;
            }
            None => {
                debug!("conn {}: token rejected", conn_id);
                self.prompt(
                    conn_id,
                    AuthState::AwaitingChoice,
                    Message::AuthRequestChoice(
                        "Invalid or expired token. Press 1 to register, 2 to login."
                            .to_string(),
                    ),
                );
            }
        }
    }

    async fn try_credentials(
        &mut self,
        conn_id: u64,
        register: bool,
        username: &str,
        password: &str,
    ) {
        let now = Instant::now();
        let token = {
            let mut dir = self.directory.write().await;
            if register {
                dir.register(username, password, now)
            } else {
                dir.login(username, password, now)
            }
        };

        match token {
            Some(token) => {
                info!(
                    "{} {}",
                    username,
                    if register { "registered" } else { "logged in" }
                );
                self.finish(conn_id, username, &token).await;
            }
            None => {
                let reason = if register {
                    "Registration failed: username taken or fields empty."
                } else {
                    "Login failed: wrong credentials or already logged in."
                };
                debug!("conn {}: {}", conn_id, reason);
                self.send_or_drop(
                    conn_id,
                    &Message::AuthRequestCredentials(format!("{} Try again.", reason)),
                );
            }
        }
    }

    /// Sends the success banner (which carries the resume token) and moves
    /// the connection to the matchmaking queue.
    async fn finish(&mut self, conn_id: u64, username: &str, token: &str) {
        self.states.remove(&conn_id);
        let mut conn = match self.conns.deregister(conn_id) {
            Some(conn) => conn,
            None => return,
        };

        let banner = format!(
            "Authentication successful. Welcome, {}!\nToken:{}",
            username, token
        );
        if let Err(e) = conn.send(&Message::AuthSuccess(banner)) {
            warn!("conn {}: success banner failed: {}", conn_id, e);
            let mut dir = self.directory.write().await;
            dir.mark_logged_out(username);
            return;
        }

        self.queue.admit(username.to_string(), conn);
    }

    fn send_or_drop(&mut self, conn_id: u64, message: &Message) {
        let failed = match self.conns.get_mut(conn_id) {
            Some(conn) => conn.send(message).is_err(),
            None => return,
        };
        if failed {
            warn!("conn {}: write failed during authentication", conn_id);
            self.states.remove(&conn_id);
            self.conns.deregister(conn_id);
        }
    }
}

/// Binds the listener for [`AuthLoop`]. Split out so the caller can learn
/// the bound address before the loop takes ownership.
pub async fn bind(host: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((host, port)).await
}
