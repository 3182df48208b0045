mod network;

use clap::Parser;
use log::debug;
use network::{AuthOutcome, ServerConnection};
use shared::Message;
use std::io;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:9000")]
    server: String,

    /// Resume a previous session with this token
    #[arg(short = 't', long)]
    token: Option<String>,
}

/// What the next line typed by the player means.
enum InputMode {
    /// In queue: any line is a keep-alive ping.
    Queued,
    /// Mid-round: lines are guesses at the scrambled word.
    Guessing,
    /// After a round: y plays again, anything else quits.
    PlayAgain,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    println!("Connecting to {}...", args.server);
    let mut conn = ServerConnection::connect(&args.server).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let mut token = authenticate(&mut conn, &mut lines, args.token).await?;
    println!("Logged in. Keep this token to resume: {}", token);

    let mut mode = InputMode::Queued;
    loop {
        tokio::select! {
            message = conn.recv() => {
                match message? {
                    Message::QueueStart(text) | Message::QueueWaiting(text) => {
                        println!("{}", text);
                        mode = InputMode::Queued;
                    }
                    Message::QueueTokenRefresh(new_token) => {
                        token = new_token;
                        println!("Session token refreshed: {}", token);
                        conn.send(&Message::QueueTokenRefreshOk).await?;
                    }
                    Message::QueueClientTimeout(text) => {
                        println!("{}", text);
                        return Ok(());
                    }
                    Message::GameStart(text) => {
                        println!("{}", text);
                        conn.send(&Message::GameStartReady).await?;
                    }
                    Message::GameServerGetNewWord(text) => {
                        println!("{}", text);
                        mode = InputMode::Guessing;
                    }
                    Message::GameServerCorrectWord(text)
                    | Message::GameServerPlayerWon(text) => {
                        println!("{}", text);
                        println!("Play again? (y/n)");
                        mode = InputMode::PlayAgain;
                    }
                    Message::GameServerPlayerDisconnected(text) => {
                        println!("{}", text);
                    }
                    other => debug!("unhandled server message: {:?}", other),
                }
            }
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => {
                        conn.send(&Message::GameClientQuit).await.ok();
                        return Ok(());
                    }
                };
                match mode {
                    InputMode::Queued => {
                        conn.send(&Message::QueueResponse("still here".to_string()))
                            .await?;
                    }
                    InputMode::Guessing => {
                        conn.send(&Message::GameClientWord(line.trim().to_string()))
                            .await?;
                    }
                    InputMode::PlayAgain => {
                        if line.trim().eq_ignore_ascii_case("y") {
                            conn.send(&Message::GameClientPlayAgain).await?;
                            mode = InputMode::Queued;
                        } else {
                            conn.send(&Message::GameClientQuit).await?;
                            println!("Goodbye!");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Runs the login conversation, retrying on rejection, and returns the
/// session token.
async fn authenticate(
    conn: &mut ServerConnection,
    lines: &mut Lines<BufReader<Stdin>>,
    token: Option<String>,
) -> io::Result<String> {
    if let Some(token) = token {
        match conn.resume(&token).await? {
            AuthOutcome::Success { token, banner } => {
                println!("{}", banner);
                return Ok(token);
            }
            AuthOutcome::Rejected(text) => println!("{}", text),
        }
        // The server already moved us to the register/login choice.
        return credentials_after_fallback(conn, lines).await;
    }

    loop {
        println!("Register (r) or login (l)?");
        let register = matches!(
            prompt_line(lines).await?.as_str(),
            "r" | "R" | "register"
        );
        let (username, password) = read_credentials(lines).await?;
        let outcome = if register {
            conn.register(&username, &password).await?
        } else {
            conn.login(&username, &password).await?
        };
        match outcome {
            AuthOutcome::Success { token, banner } => {
                println!("{}", banner);
                return Ok(token);
            }
            AuthOutcome::Rejected(text) => println!("{}", text),
        }
    }
}

/// Token rejection leaves the conversation at the register/login choice,
/// so answer that prompt directly rather than restarting the flow.
async fn credentials_after_fallback(
    conn: &mut ServerConnection,
    lines: &mut Lines<BufReader<Stdin>>,
) -> io::Result<String> {
    loop {
        println!("Register (r) or login (l)?");
        let register = matches!(
            prompt_line(lines).await?.as_str(),
            "r" | "R" | "register"
        );
        conn.send(&Message::AuthResponseChoice(if register { 1 } else { 2 }))
            .await?;
        match conn.recv().await? {
            Message::AuthRequestCredentials(text) => println!("{}", text),
            other => debug!("unexpected: {:?}", other),
        }
        let (username, password) = read_credentials(lines).await?;
        conn.send(&Message::AuthResponseCredentials { username, password })
            .await?;
        match conn.recv().await? {
            Message::AuthSuccess(banner) => {
                println!("{}", banner);
                let token = network::parse_token(&banner).unwrap_or_default();
                return Ok(token);
            }
            Message::AuthRequestCredentials(text) => println!("{}", text),
            other => debug!("unexpected: {:?}", other),
        }
    }
}

async fn read_credentials(
    lines: &mut Lines<BufReader<Stdin>>,
) -> io::Result<(String, String)> {
    println!("Username:");
    let username = prompt_line(lines).await?;
    println!("Password:");
    let password = prompt_line(lines).await?;
    Ok((username, password))
}

async fn prompt_line(lines: &mut Lines<BufReader<Stdin>>) -> io::Result<String> {
    match lines.next_line().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stdin closed",
        )),
    }
}
