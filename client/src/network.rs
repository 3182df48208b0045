//! Client-side connection to the word-scramble server: framing, the login
//! conversation, and message send/receive.

use log::{debug, info};
use shared::{encode_frame, FrameBuffer, Message};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// How long [`ServerConnection::recv`] waits before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of running one of the login conversations.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Logged in. The token lets the client resume a dropped session.
    Success { token: String, banner: String },
    /// The server declined and sent this explanation.
    Rejected(String),
}

/// A framed TCP connection to the server.
pub struct ServerConnection {
    stream: TcpStream,
    buffer: FrameBuffer,
}

impl ServerConnection {
    /// Connects and consumes the server's greeting.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut conn = Self {
            stream,
            buffer: FrameBuffer::new(),
        };
        match conn.recv().await? {
            Message::AuthStart(text) => info!("server: {}", text),
            other => debug!("unexpected greeting: {:?}", other),
        }
        Ok(conn)
    }

    pub async fn send(&mut self, message: &Message) -> io::Result<()> {
        let frame = encode_frame(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.stream.write_all(&frame).await
    }

    /// Receives the next complete message, reading more bytes as needed.
    pub async fn recv(&mut self) -> io::Result<Message> {
        loop {
            match self.buffer.next_frame() {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => {}
                Err(e) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            }
            let mut chunk = [0u8; 4096];
            let n = timeout(RECV_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "server went quiet")
                })??;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
            self.buffer.extend(&chunk[..n]);
        }
    }

    /// Runs the registration conversation for a new account.
    pub async fn register(
        &mut self,
        username: &str,
        password: &str,
    ) -> io::Result<AuthOutcome> {
        self.credentials_flow(1, username, password).await
    }

    /// Runs the login conversation for an existing account.
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> io::Result<AuthOutcome> {
        self.credentials_flow(2, username, password).await
    }

    /// Resumes a dropped session with a previously issued token.
    pub async fn resume(&mut self, token: &str) -> io::Result<AuthOutcome> {
        self.send(&Message::AuthStartToken).await?;
        match self.recv().await? {
            Message::AuthRequestToken(_) => {}
            other => {
                return Err(unexpected(&other));
            }
        }
        self.send(&Message::AuthResponseToken(token.to_string()))
            .await?;
        match self.recv().await? {
            Message::AuthSuccess(banner) => Ok(success(banner)),
            Message::AuthRequestChoice(text) => Ok(AuthOutcome::Rejected(text)),
            other => Err(unexpected(&other)),
        }
    }

    async fn credentials_flow(
        &mut self,
        choice: u8,
        username: &str,
        password: &str,
    ) -> io::Result<AuthOutcome> {
        self.send(&Message::AuthStartCredentials).await?;
        match self.recv().await? {
            Message::AuthRequestChoice(_) => {}
            other => return Err(unexpected(&other)),
        }
        self.send(&Message::AuthResponseChoice(choice)).await?;
        match self.recv().await? {
            Message::AuthRequestCredentials(_) => {}
            other => return Err(unexpected(&other)),
        }
        self.send(&Message::AuthResponseCredentials {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await?;
        match self.recv().await? {
            Message::AuthSuccess(banner) => Ok(success(banner)),
            Message::AuthRequestCredentials(text) => Ok(AuthOutcome::Rejected(text)),
            other => Err(unexpected(&other)),
        }
    }
}

/// Pulls the resume token out of the success banner's `Token:` line.
pub fn parse_token(banner: &str) -> Option<String> {
    banner
        .lines()
        .find_map(|line| line.strip_prefix("Token:"))
        .map(|token| token.trim().to_string())
}

fn success(banner: String) -> AuthOutcome {
    let token = parse_token(&banner).unwrap_or_default();
    AuthOutcome::Success { token, banner }
}

fn unexpected(message: &Message) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected server message: {:?}", message),
    )
}
