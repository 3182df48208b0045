//! Wire protocol shared between the word-scramble server and client.
//!
//! Every message travels as a self-delimited frame: a 4-byte big-endian
//! length prefix followed by exactly that many bytes of bincode-encoded
//! [`Message`]. Both peers speak this framing across all three server
//! loops (authentication, queue, game), so a connection can be handed
//! between loops without renegotiating anything.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hard ceiling on a single frame body. Anything larger is treated as a
/// protocol violation, not a short read.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Typed message envelope exchanged between client and server.
///
/// Variants map 1:1 to the protocol's message types; payloads are the
/// human-readable text or structured fields each type carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // Authentication
    AuthStart(String),
    AuthStartToken,
    AuthStartCredentials,
    AuthRequestToken(String),
    AuthResponseToken(String),
    AuthRequestChoice(String),
    /// 1 = register, 2 = login.
    AuthResponseChoice(u8),
    AuthRequestCredentials(String),
    AuthResponseCredentials { username: String, password: String },
    /// Success text; includes a `Token:<value>` line when a token is issued.
    AuthSuccess(String),

    // Queue
    QueueStart(String),
    QueueResponse(String),
    QueueWaiting(String),
    QueueTokenRefresh(String),
    QueueTokenRefreshOk,
    QueueClientTimeout(String),

    // Game
    GameStart(String),
    GameStartReady,
    GameServerGetNewWord(String),
    GameClientWord(String),
    GameServerCorrectWord(String),
    GameServerPlayerWon(String),
    GameServerPlayerDisconnected(String),
    GameClientPlayAgain,
    GameClientQuitInGame,
    GameClientQuit,
}

/// Decoding failure for a received frame.
///
/// Either kind means the peer is not speaking the protocol; the server
/// responds by dropping that connection only.
#[derive(Debug)]
pub enum FrameError {
    /// Declared body length exceeds [`MAX_FRAME_SIZE`].
    Oversized(usize),
    /// Body bytes did not decode to a [`Message`].
    Malformed(bincode::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Oversized(len) => write!(f, "frame of {} bytes exceeds limit", len),
            FrameError::Malformed(e) => write!(f, "malformed frame body: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encodes a message as a length-prefixed frame ready to write to a socket.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, bincode::Error> {
    let body = bincode::serialize(message)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reassembles frames from an arbitrary stream of bytes.
///
/// Bytes arrive in whatever chunks the socket produces; `next_frame`
/// yields `Ok(None)` until a complete frame is buffered, so partial reads
/// on a non-blocking socket are retried on the next readiness event
/// instead of being errors.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes to the buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffered bytes do not yet hold a full
    /// frame (not an error). Consumes the frame's bytes on success.
    pub fn next_frame(&mut self) -> Result<Option<Message>, FrameError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buf[..4]);
        let body_len = u32::from_be_bytes(len_bytes) as usize;

        if body_len > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(body_len));
        }
        if self.buf.len() < 4 + body_len {
            return Ok(None);
        }

        let message =
            bincode::deserialize(&self.buf[4..4 + body_len]).map_err(FrameError::Malformed)?;
        self.buf.drain(..4 + body_len);
        Ok(Some(message))
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn representative_messages() -> Vec<Message> {
        vec![
            Message::AuthStart("Auth Start".to_string()),
            Message::AuthStartToken,
            Message::AuthStartCredentials,
            Message::AuthRequestToken(String::new()),
            Message::AuthResponseToken("abc123".to_string()),
            Message::AuthRequestChoice("Register 1 / Login 2".to_string()),
            Message::AuthResponseChoice(2),
            Message::AuthRequestCredentials("Credentials".to_string()),
            Message::AuthResponseCredentials {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
            },
            Message::AuthSuccess("Logged in successfully\nToken:xyz".to_string()),
            Message::QueueStart("You are in queue".to_string()),
            Message::QueueResponse("still here".to_string()),
            Message::QueueWaiting("queue...".to_string()),
            Message::QueueTokenRefresh("newtoken".to_string()),
            Message::QueueTokenRefreshOk,
            Message::QueueClientTimeout("Timeout. You are being disconnected.".to_string()),
            Message::GameStart("Game starting!\nScramble Word: elppa".to_string()),
            Message::GameStartReady,
            Message::GameServerGetNewWord("Guess Word:".to_string()),
            Message::GameClientWord("apple".to_string()),
            Message::GameServerCorrectWord("You guessed the word!".to_string()),
            Message::GameServerPlayerWon("You lost!".to_string()),
            Message::GameServerPlayerDisconnected("Someone disconnected.".to_string()),
            Message::GameClientPlayAgain,
            Message::GameClientQuitInGame,
            Message::GameClientQuit,
        ]
    }

    #[test]
    fn test_roundtrip_every_message_type() {
        for message in representative_messages() {
            let frame = encode_frame(&message).unwrap();

            let mut buffer = FrameBuffer::new();
            buffer.extend(&frame);
            let decoded = buffer.next_frame().unwrap().unwrap();

            assert_eq!(decoded, message);
            assert_eq!(buffer.pending_bytes(), 0);
        }
    }

    #[test]
    fn test_frame_layout_length_prefix() {
        let message = Message::QueueTokenRefreshOk;
        let frame = encode_frame(&message).unwrap();

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&frame[..4]);
        let body_len = u32::from_be_bytes(len_bytes) as usize;

        assert_eq!(frame.len(), 4 + body_len);
    }

    #[test]
    fn test_partial_frame_is_not_an_error() {
        let message = Message::GameClientWord("banana".to_string());
        let frame = encode_frame(&message).unwrap();

        let mut buffer = FrameBuffer::new();
        // Feed one byte at a time; every prefix must yield Ok(None).
        for byte in &frame[..frame.len() - 1] {
            buffer.extend(std::slice::from_ref(byte));
            assert!(buffer.next_frame().unwrap().is_none());
        }

        buffer.extend(&frame[frame.len() - 1..]);
        assert_eq!(buffer.next_frame().unwrap().unwrap(), message);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let first = Message::GameStartReady;
        let second = Message::GameClientWord("kiwi".to_string());

        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes);

        assert_eq!(buffer.next_frame().unwrap().unwrap(), first);
        assert_eq!(buffer.next_frame().unwrap().unwrap(), second);
        assert!(buffer.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&((MAX_FRAME_SIZE as u32 + 1).to_be_bytes()));

        match buffer.next_frame() {
            Err(FrameError::Oversized(len)) => assert_eq!(len, MAX_FRAME_SIZE + 1),
            other => panic!("expected oversized error, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_body_rejected() {
        let mut buffer = FrameBuffer::new();
        // Valid length prefix, garbage body.
        buffer.extend(&4u32.to_be_bytes());
        buffer.extend(&[0xFF, 0xFF, 0xFF, 0xFF]);

        assert!(matches!(buffer.next_frame(), Err(FrameError::Malformed(_))));
    }
}
