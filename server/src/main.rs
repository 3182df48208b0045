use clap::Parser;
use log::error;
use server::queue::GameMode;
use server::{start, Config};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "9000")]
    port: u16,
    /// Matchmaking mode: "simple" or "ranked"
    #[clap(short, long, default_value = "simple")]
    game_mode: String,
    /// Number of players per game session
    #[clap(short = 'n', long, default_value = "2")]
    players_per_game: usize,
}

/// Parses command-line arguments, boots every server task, then waits for
/// Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let game_mode = match args.game_mode.to_lowercase().as_str() {
        "simple" => GameMode::Simple,
        "ranked" => GameMode::Ranked,
        other => {
            error!("unknown game mode '{}'; use 'simple' or 'ranked'", other);
            std::process::exit(1);
        }
    };
    if args.players_per_game < 1 {
        error!("players per game must be at least 1");
        std::process::exit(1);
    }

    let config = Config {
        host: args.host,
        port: args.port,
        game_mode,
        players_per_game: args.players_per_game,
        ..Config::default()
    };

    let handle = start(config).await?;
    println!("Word scramble server listening on {}", handle.addr);

    tokio::signal::ctrl_c().await?;
    println!("Received Ctrl+C, shutting down gracefully...");

    Ok(())
}
