//! Game sessions: one task per matched group, racing to unscramble a word.
//!
//! A session owns its players' connections for its whole lifetime and holds
//! the concurrency permit that admitted it; dropping the permit when the
//! session task ends is what lets the dispatcher start the next game.

use crate::connection::{ConnSet, Event, POLL_INTERVAL_MS};
use crate::directory::SharedDirectory;
use crate::queue::{MatchedPlayer, QueueHandle};
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::Rng;
use shared::Message;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::interval;

/// Elo awarded to the player who guesses the word first.
pub const WINNER_REWARD: i32 = 100;
/// Elo taken from every other player in the session.
pub const LOSER_PENALTY: i32 = 50;

/// The vocabulary a session picks its secret word from.
pub const WORDS: &[&str] = &[
    "apple",
    "banana",
    "orange",
    "grape",
    "kiwi",
    "mango",
    "strawberry",
    "blueberry",
    "watermelon",
    "pineapple",
    "cherry",
    "lemon",
    "lime",
    "peach",
    "pear",
];

/// Shuffles the letters of `word`. For words with at least two distinct
/// letters the result always differs from the original.
pub fn scramble_word<R: Rng>(word: &str, rng: &mut R) -> String {
    let mut chars: Vec<char> = word.chars().collect();
    let distinct: HashSet<char> = chars.iter().copied().collect();
    if distinct.len() < 2 {
        return word.to_string();
    }
    loop {
        chars.shuffle(rng);
        let scrambled: String = chars.iter().collect();
        if scrambled != word {
            return scrambled;
        }
    }
}

/// One running game. Created by the dispatcher with a full matched group.
pub struct GameSession {
    conns: ConnSet,
    names: HashMap<u64, String>,
    directory: SharedDirectory,
    queue: QueueHandle,
    _permit: OwnedSemaphorePermit,
}

impl GameSession {
    pub fn new(
        players: Vec<MatchedPlayer>,
        directory: SharedDirectory,
        queue: QueueHandle,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let mut conns = ConnSet::new();
        let mut names = HashMap::new();
        for player in players {
            names.insert(player.conn.id(), player.username);
            conns.register(player.conn);
        }
        Self {
            conns,
            names,
            directory,
            queue,
            _permit: permit,
        }
    }

    /// Runs the session to completion: ready barrier, guessing round,
    /// then the play-again/quit epilogue.
    pub async fn run(mut self) {
        let roster: Vec<String> = self.names.values().cloned().collect();
        info!("game session starting: {}", roster.join(", "));

        let secret = {
            let mut rng = rand::thread_rng();
            let word = WORDS.choose(&mut rng).copied().unwrap_or("apple");
            (word.to_string(), scramble_word(word, &mut rng))
        };
        let (word, scrambled) = secret;
        debug!("secret word chosen ({} letters)", word.len());

        self.conns.broadcast(
            &Message::GameStart(format!("Match found! Unscramble: {}", scrambled)),
            None,
        );

        if self.await_ready().await {
            self.conns.broadcast(
                &Message::GameServerGetNewWord("Guess Word:".to_string()),
                None,
            );

            if let Some(winner_id) = self.guessing_round(&word, &scrambled).await {
                self.settle_elo(winner_id, &word).await;
            }
        }

        // A departure mid-game skips settlement; survivors were already
        // told and pick rematch or quit like everyone else.
        self.epilogue().await;
    }

    /// Waits until every player has sent the ready signal. Returns false
    /// if anyone leaves first, which cancels the round.
    async fn await_ready(&mut self) -> bool {
        let mut ready: HashSet<u64> = HashSet::new();
        let mut tick = interval(Duration::from_millis(POLL_INTERVAL_MS));

        while ready.len() < self.names.len() {
            tick.tick().await;
            for (conn_id, event) in self.conns.poll() {
                match event {
                    Event::Message(Message::GameStartReady) => {
                        ready.insert(conn_id);
                    }
                    Event::Message(Message::GameClientQuitInGame) => {
                        self.announce_departure(conn_id);
                        self.quit_player(conn_id).await;
                        return false;
                    }
                    Event::Message(other) => {
                        debug!("conn {}: ignoring {:?} before start", conn_id, other);
                    }
                    Event::Closed => {
                        self.drop_player(conn_id, true).await;
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Collects guesses until someone submits the exact word. Guessing is
    /// case-sensitive. Returns the winner's connection id, or `None` when
    /// a player leaves mid-round, which ends the session for everyone.
    async fn guessing_round(&mut self, word: &str, scrambled: &str) -> Option<u64> {
        let mut tick = interval(Duration::from_millis(POLL_INTERVAL_MS));

        loop {
            tick.tick().await;
            for (conn_id, event) in self.conns.poll() {
                match event {
                    Event::Message(Message::GameClientWord(guess)) => {
                        if guess == word {
                            return Some(conn_id);
                        }
                        if let Some(conn) = self.conns.get_mut(conn_id) {
                            let _ = conn.send(&Message::GameServerGetNewWord(format!(
                                "Wrong. Unscramble: {}",
                                scrambled
                            )));
                        }
                    }
                    Event::Message(Message::GameClientQuitInGame) => {
                        self.announce_departure(conn_id);
                        self.quit_player(conn_id).await;
                        return None;
                    }
                    Event::Message(other) => {
                        debug!("conn {}: ignoring {:?} mid-game", conn_id, other);
                    }
                    Event::Closed => {
                        self.drop_player(conn_id, true).await;
                        return None;
                    }
                }
            }
        }
    }

    fn announce_departure(&mut self, leaving_id: u64) {
        if let Some(username) = self.names.get(&leaving_id) {
            let notice = Message::GameServerPlayerDisconnected(format!(
                "{} left the game. Play again or quit?",
                username
            ));
            self.conns.broadcast(&notice, Some(leaving_id));
        }
    }

    /// Applies the elo deltas and announces the result. Only players still
    /// in the session when the word falls are settled.
    async fn settle_elo(&mut self, winner_id: u64, word: &str) {
        let winner_name = match self.names.get(&winner_id) {
            Some(name) => name.clone(),
            None => return,
        };

        {
            let mut dir = self.directory.write().await;
            for (conn_id, username) in &self.names {
                if *conn_id == winner_id {
                    dir.apply_elo_delta(username, WINNER_REWARD);
                } else {
                    dir.apply_elo_delta(username, -LOSER_PENALTY);
                }
            }
        }

        info!("{} won the round (word: {})", winner_name, word);

        if let Some(conn) = self.conns.get_mut(winner_id) {
            let _ = conn.send(&Message::GameServerCorrectWord(format!(
                "Correct! The word was {}. You gain {} elo.",
                word, WINNER_REWARD
            )));
        }
        self.conns.broadcast(
            &Message::GameServerPlayerWon(format!(
                "{} guessed the word ({}). You lose {} elo.",
                winner_name, word, LOSER_PENALTY
            )),
            Some(winner_id),
        );
    }

    /// After the round each player independently chooses to play again
    /// (back to the queue) or quit. The session ends once everyone has
    /// decided or disconnected.
    async fn epilogue(&mut self) {
        let mut tick = interval(Duration::from_millis(POLL_INTERVAL_MS));

        while !self.names.is_empty() {
            tick.tick().await;
            for (conn_id, event) in self.conns.poll() {
                match event {
                    Event::Message(Message::GameClientPlayAgain) => {
                        self.requeue_player(conn_id).await;
                    }
                    Event::Message(Message::GameClientQuitInGame)
                    | Event::Message(Message::GameClientQuit) => {
                        self.quit_player(conn_id).await;
                    }
                    Event::Message(other) => {
                        debug!("conn {}: ignoring {:?} after round", conn_id, other);
                    }
                    Event::Closed => {
                        self.drop_player(conn_id, false).await;
                    }
                }
            }
        }
        info!("game session finished");
    }

    /// Sends a player back to the matchmaking queue with their identity
    /// intact.
    async fn requeue_player(&mut self, conn_id: u64) {
        let username = match self.names.remove(&conn_id) {
            Some(name) => name,
            None => return,
        };
        if let Some(conn) = self.conns.deregister(conn_id) {
            info!("{} is playing again", username);
            self.queue.admit(username, conn);
        }
    }

    /// Orderly quit: sign the player out and close the socket. The waiting
    /// token stays on record until its expiry lapses.
    async fn quit_player(&mut self, conn_id: u64) {
        if let Some(username) = self.names.remove(&conn_id) {
            let mut dir = self.directory.write().await;
            dir.sign_out(&username);
            info!("{} quit after the game", username);
        }
        self.conns.deregister(conn_id);
    }

    /// Peer-disconnect cleanup; optionally tells the remaining players.
    async fn drop_player(&mut self, conn_id: u64, announce: bool) {
        if let Some(username) = self.names.remove(&conn_id) {
            {
                let mut dir = self.directory.write().await;
                dir.mark_logged_out(&username);
            }
            info!("{} disconnected mid-game", username);
            if announce {
                self.conns.broadcast(
                    &Message::GameServerPlayerDisconnected(format!(
                        "{} disconnected. Play again or quit?",
                        username
                    )),
                    None,
                );
            }
        }
        self.conns.deregister(conn_id);
    }
}
