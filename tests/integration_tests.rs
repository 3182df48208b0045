//! End-to-end tests driving real client connections against a full server.

use client::network::{AuthOutcome, ServerConnection};
use server::game::WORDS;
use server::queue::GameMode;
use server::{start, Config, ServerHandle};
use shared::Message;
use std::time::{Duration, Instant};
use tokio::time::sleep;

async fn start_server(config: Config) -> ServerHandle {
    start(config).await.expect("server failed to start")
}

fn test_config(game_mode: GameMode, players_per_game: usize) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        game_mode,
        players_per_game,
        ..Config::default()
    }
}

/// Reads messages until one satisfies the predicate, ignoring the rest.
async fn recv_until<F>(conn: &mut ServerConnection, mut pred: F) -> Message
where
    F: FnMut(&Message) -> bool,
{
    loop {
        let message = conn.recv().await.expect("connection lost");
        if pred(&message) {
            return message;
        }
    }
}

/// Polls a condition until it holds or the deadline passes.
async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Recovers the secret word from its scramble by letter signature. The
/// vocabulary has no two words with the same letters.
fn unscramble(scrambled: &str) -> &'static str {
    let mut target: Vec<char> = scrambled.chars().collect();
    target.sort_unstable();
    for word in WORDS {
        let mut chars: Vec<char> = word.chars().collect();
        chars.sort_unstable();
        if chars == target {
            return word;
        }
    }
    panic!("no vocabulary word matches scramble '{}'", scrambled);
}

/// The scrambled word is the last token of the round prompt.
fn scramble_from_prompt(text: &str) -> &str {
    text.rsplit(' ').next().unwrap_or("")
}

async fn register(conn: &mut ServerConnection, username: &str) -> String {
    match conn.register(username, "password").await.unwrap() {
        AuthOutcome::Success { token, .. } => token,
        AuthOutcome::Rejected(text) => panic!("registration refused: {}", text),
    }
}

#[tokio::test]
async fn test_full_game_with_elo_settlement() {
    let handle = start_server(test_config(GameMode::Simple, 2)).await;
    let addr = handle.addr.to_string();

    let mut alice = ServerConnection::connect(&addr).await.unwrap();
    register(&mut alice, "alice").await;
    let mut bob = ServerConnection::connect(&addr).await.unwrap();
    register(&mut bob, "bob").await;

    // Both get matched; the start message carries the scrambled word.
    let start = recv_until(&mut alice, |m| matches!(m, Message::GameStart(_))).await;
    recv_until(&mut bob, |m| matches!(m, Message::GameStart(_))).await;
    let scrambled = match &start {
        Message::GameStart(text) => scramble_from_prompt(text).to_string(),
        _ => unreachable!(),
    };
    let word = unscramble(&scrambled);

    alice.send(&Message::GameStartReady).await.unwrap();
    bob.send(&Message::GameStartReady).await.unwrap();
    recv_until(&mut alice, |m| matches!(m, Message::GameServerGetNewWord(_))).await;
    recv_until(&mut bob, |m| matches!(m, Message::GameServerGetNewWord(_))).await;

    // A wrong guess gets a re-prompt, not the win.
    bob.send(&Message::GameClientWord("notaword".to_string()))
        .await
        .unwrap();
    let reply = recv_until(&mut bob, |m| {
        matches!(m, Message::GameServerGetNewWord(_))
    })
    .await;
    match reply {
        Message::GameServerGetNewWord(text) => assert!(text.starts_with("Wrong")),
        _ => unreachable!(),
    }

    // Guessing is case-sensitive: the uppercased word does not win either.
    bob.send(&Message::GameClientWord(word.to_uppercase()))
        .await
        .unwrap();
    recv_until(&mut bob, |m| matches!(m, Message::GameServerGetNewWord(_))).await;

    alice
        .send(&Message::GameClientWord(word.to_string()))
        .await
        .unwrap();

    let win = recv_until(&mut alice, |m| {
        matches!(m, Message::GameServerCorrectWord(_))
    })
    .await;
    match win {
        Message::GameServerCorrectWord(text) => assert!(text.contains(word)),
        _ => unreachable!(),
    }
    recv_until(&mut bob, |m| matches!(m, Message::GameServerPlayerWon(_))).await;

    // Winner +100, loser -50, from the starting 400.
    {
        let dir = handle.directory.read().await;
        assert_eq!(dir.get("alice").unwrap().elo, 500);
        assert_eq!(dir.get("bob").unwrap().elo, 350);
    }

    alice.send(&Message::GameClientQuit).await.unwrap();
    bob.send(&Message::GameClientQuit).await.unwrap();
    wait_for("both players signed out", || async {
        let dir = handle.directory.read().await;
        !dir.is_logged_in("alice") && !dir.is_logged_in("bob")
    })
    .await;
}

#[tokio::test]
async fn test_queue_disconnect_and_token_resume() {
    let handle = start_server(test_config(GameMode::Simple, 2)).await;
    let addr = handle.addr.to_string();

    let mut dave = ServerConnection::connect(&addr).await.unwrap();
    let token = register(&mut dave, "dave").await;
    recv_until(&mut dave, |m| matches!(m, Message::QueueStart(_))).await;

    // Dropping the socket knocks dave out of the queue but keeps the
    // token valid.
    drop(dave);
    wait_for("queue membership removed", || async {
        !handle.match_queue.read().await.contains("dave")
    })
    .await;
    wait_for("dave marked offline", || async {
        !handle.directory.read().await.is_logged_in("dave")
    })
    .await;

    let mut resumed = ServerConnection::connect(&addr).await.unwrap();
    match resumed.resume(&token).await.unwrap() {
        AuthOutcome::Success {
            token: new_token, ..
        } => {
            // The consumed token is replaced by a fresh one.
            assert!(!new_token.is_empty());
            assert_ne!(new_token, token);
        }
        AuthOutcome::Rejected(text) => panic!("token resume refused: {}", text),
    }
    recv_until(&mut resumed, |m| matches!(m, Message::QueueStart(_))).await;

    assert!(handle.directory.read().await.is_logged_in("dave"));
    assert!(handle.match_queue.read().await.contains("dave"));
}

#[tokio::test]
async fn test_stale_token_is_rejected() {
    let config = Config {
        token_ttl: Duration::from_millis(200),
        ..test_config(GameMode::Simple, 2)
    };
    let handle = start_server(config).await;
    let addr = handle.addr.to_string();

    let mut eve = ServerConnection::connect(&addr).await.unwrap();
    let token = register(&mut eve, "eve").await;
    drop(eve);

    sleep(Duration::from_millis(400)).await;

    let mut back = ServerConnection::connect(&addr).await.unwrap();
    match back.resume(&token).await.unwrap() {
        AuthOutcome::Rejected(_) => {}
        AuthOutcome::Success { .. } => panic!("expired token accepted"),
    }
}

#[tokio::test]
async fn test_ranked_matching_picks_closest_pair() {
    let handle = start_server(test_config(GameMode::Ranked, 2)).await;
    let addr = handle.addr.to_string();

    // Seed accounts with spread-out ratings.
    {
        let mut dir = handle.directory.write().await;
        let now = Instant::now();
        for (name, elo) in [("carol", 900), ("alice", 400), ("bob", 410)] {
            dir.register(name, "password", now).unwrap();
            dir.sign_out(name);
            dir.set_elo(name, elo);
        }
    }

    let mut carol = ServerConnection::connect(&addr).await.unwrap();
    match carol.login("carol", "password").await.unwrap() {
        AuthOutcome::Success { .. } => {}
        AuthOutcome::Rejected(text) => panic!("login refused: {}", text),
    }
    recv_until(&mut carol, |m| matches!(m, Message::QueueStart(_))).await;

    let mut alice = ServerConnection::connect(&addr).await.unwrap();
    alice.login("alice", "password").await.unwrap();
    let mut bob = ServerConnection::connect(&addr).await.unwrap();
    bob.login("bob", "password").await.unwrap();

    // The 400/410 pair is within the acceptable difference; 900 is not.
    recv_until(&mut alice, |m| matches!(m, Message::GameStart(_))).await;
    recv_until(&mut bob, |m| matches!(m, Message::GameStart(_))).await;

    assert!(handle.match_queue.read().await.contains("carol"));
}

#[tokio::test]
async fn test_silent_queued_client_times_out() {
    let config = Config {
        disconnection_timeout: Duration::from_millis(300),
        ..test_config(GameMode::Simple, 2)
    };
    let handle = start_server(config).await;
    let addr = handle.addr.to_string();

    let mut mallory = ServerConnection::connect(&addr).await.unwrap();
    register(&mut mallory, "mallory").await;
    recv_until(&mut mallory, |m| matches!(m, Message::QueueStart(_))).await;

    // Send nothing and wait: the notice arrives before the socket closes.
    let notice = recv_until(&mut mallory, |m| {
        matches!(m, Message::QueueClientTimeout(_))
    })
    .await;
    match notice {
        Message::QueueClientTimeout(text) => assert!(text.contains("Timeout")),
        _ => unreachable!(),
    }

    assert!(mallory.recv().await.is_err());
    wait_for("mallory marked offline", || async {
        !handle.directory.read().await.is_logged_in("mallory")
    })
    .await;
}

#[tokio::test]
async fn test_queue_keepalive_defers_timeout_and_refreshes_token() {
    let config = Config {
        disconnection_timeout: Duration::from_secs(5),
        token_ttl: Duration::from_millis(200),
        ..test_config(GameMode::Simple, 2)
    };
    let handle = start_server(config).await;
    let addr = handle.addr.to_string();

    let mut frank = ServerConnection::connect(&addr).await.unwrap();
    let token = register(&mut frank, "frank").await;
    recv_until(&mut frank, |m| matches!(m, Message::QueueStart(_))).await;

    // Let the token lapse while staying responsive in the queue.
    sleep(Duration::from_millis(400)).await;
    frank
        .send(&Message::QueueResponse("still here".to_string()))
        .await
        .unwrap();

    let refresh = recv_until(&mut frank, |m| {
        matches!(m, Message::QueueTokenRefresh(_))
    })
    .await;
    let new_token = match refresh {
        Message::QueueTokenRefresh(token) => token,
        _ => unreachable!(),
    };
    assert_ne!(new_token, token);
    frank.send(&Message::QueueTokenRefreshOk).await.unwrap();
    recv_until(&mut frank, |m| matches!(m, Message::QueueWaiting(_))).await;

    assert!(handle.directory.read().await.is_logged_in("frank"));
}

#[tokio::test]
async fn test_single_player_game() {
    let handle = start_server(test_config(GameMode::Simple, 1)).await;
    let addr = handle.addr.to_string();

    let mut solo = ServerConnection::connect(&addr).await.unwrap();
    register(&mut solo, "solo").await;

    // With one player per game the queue dispatches immediately.
    let start = recv_until(&mut solo, |m| matches!(m, Message::GameStart(_))).await;
    let scrambled = match &start {
        Message::GameStart(text) => scramble_from_prompt(text).to_string(),
        _ => unreachable!(),
    };

    solo.send(&Message::GameStartReady).await.unwrap();
    recv_until(&mut solo, |m| matches!(m, Message::GameServerGetNewWord(_))).await;

    solo.send(&Message::GameClientWord(unscramble(&scrambled).to_string()))
        .await
        .unwrap();
    recv_until(&mut solo, |m| {
        matches!(m, Message::GameServerCorrectWord(_))
    })
    .await;

    // No losers to penalize; the winner still collects the reward.
    assert_eq!(handle.directory.read().await.get("solo").unwrap().elo, 500);

    solo.send(&Message::GameClientQuit).await.unwrap();
    wait_for("solo signed out", || async {
        !handle.directory.read().await.is_logged_in("solo")
    })
    .await;
}

#[tokio::test]
async fn test_flooding_client_does_not_stall_queue_admissions() {
    // Three players per game so nobody gets matched while we watch the
    // queue loop itself.
    let handle = start_server(test_config(GameMode::Simple, 3)).await;
    let addr = handle.addr.to_string();

    let mut flooder = ServerConnection::connect(&addr).await.unwrap();
    register(&mut flooder, "flooder").await;
    recv_until(&mut flooder, |m| matches!(m, Message::QueueStart(_))).await;

    // Hammer keep-alives without ever reading the replies, so the server
    // side of this socket backs up.
    let flood = tokio::spawn(async move {
        loop {
            if flooder
                .send(&Message::QueueResponse("still here".to_string()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Other clients must still get admitted and greeted promptly.
    let mut grace = ServerConnection::connect(&addr).await.unwrap();
    register(&mut grace, "grace").await;
    recv_until(&mut grace, |m| matches!(m, Message::QueueStart(_))).await;
    grace
        .send(&Message::QueueResponse("hello".to_string()))
        .await
        .unwrap();
    recv_until(&mut grace, |m| matches!(m, Message::QueueWaiting(_))).await;

    assert!(handle.match_queue.read().await.contains("grace"));
    flood.abort();
}

#[tokio::test]
async fn test_play_again_returns_to_queue() {
    let handle = start_server(test_config(GameMode::Simple, 2)).await;
    let addr = handle.addr.to_string();

    let mut alice = ServerConnection::connect(&addr).await.unwrap();
    register(&mut alice, "alice").await;
    let mut bob = ServerConnection::connect(&addr).await.unwrap();
    register(&mut bob, "bob").await;

    let start = recv_until(&mut alice, |m| matches!(m, Message::GameStart(_))).await;
    recv_until(&mut bob, |m| matches!(m, Message::GameStart(_))).await;
    let scrambled = match &start {
        Message::GameStart(text) => scramble_from_prompt(text).to_string(),
        _ => unreachable!(),
    };

    alice.send(&Message::GameStartReady).await.unwrap();
    bob.send(&Message::GameStartReady).await.unwrap();
    recv_until(&mut alice, |m| matches!(m, Message::GameServerGetNewWord(_))).await;

    alice
        .send(&Message::GameClientWord(unscramble(&scrambled).to_string()))
        .await
        .unwrap();
    recv_until(&mut alice, |m| {
        matches!(m, Message::GameServerCorrectWord(_))
    })
    .await;
    recv_until(&mut bob, |m| matches!(m, Message::GameServerPlayerWon(_))).await;

    // Alice queues up again, bob leaves.
    alice.send(&Message::GameClientPlayAgain).await.unwrap();
    bob.send(&Message::GameClientQuit).await.unwrap();

    recv_until(&mut alice, |m| matches!(m, Message::QueueStart(_))).await;
    wait_for("alice back in the queue", || async {
        handle.match_queue.read().await.contains("alice")
    })
    .await;
    wait_for("bob signed out", || async {
        !handle.directory.read().await.is_logged_in("bob")
    })
    .await;
}
