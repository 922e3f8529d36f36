use std::collections::BTreeSet;

use clap::Parser;
use peerbridge::prelude::*;
use peerbridge::transport::ConnectionId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Peer -> server: start sharing a board.
const SHARE_BOARD: &str = "SHARE_BOARD";
/// Peer -> server: stop sharing a board.
const UNSHARE_BOARD: &str = "UNSHARE_BOARD";
/// Server -> peers: a board is available.
const SHARING_BOARD: &str = "SHARING_BOARD";
/// Server -> peers: a board is gone.
const UNSHARING_BOARD: &str = "UNSHARING_BOARD";
/// Server -> peer: the last request was malformed.
const ERROR: &str = "ERROR";

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "whiteboard-server")]
#[command(about = "Keeps the directory of shared whiteboards")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 3100)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Secret peers must present to open a session
    #[arg(long)]
    password: Option<String>,
}

// ---------------------------------------------------------------------------
// Boards
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum BoardError {
    #[error("board must be host:port:boardid, got {0:?}")]
    Malformed(String),

    #[error("invalid port in board {0:?}")]
    BadPort(String),

    #[error("missing board argument")]
    Missing,
}

/// Checks a `host:port:boardid` string and returns it unchanged.
fn parse_board(args: &[String]) -> Result<String, BoardError> {
    let board = args.first().ok_or(BoardError::Missing)?;
    let parts: Vec<&str> = board.split(':').collect();
    let [host, port, id] = parts[..] else {
        return Err(BoardError::Malformed(board.clone()));
    };
    if host.is_empty() || id.is_empty() {
        return Err(BoardError::Malformed(board.clone()));
    }
    port.parse::<u16>()
        .map_err(|_| BoardError::BadPort(board.clone()))?;
    Ok(board.clone())
}

enum Command {
    Joined(Endpoint),
    Share { from: ConnectionId, args: Vec<String> },
    Unshare { from: ConnectionId, args: Vec<String> },
}

/// The shared-board registry. Owned by the main loop, so it needs no lock.
#[derive(Default)]
struct Directory {
    boards: BTreeSet<String>,
}

impl Directory {
    fn apply(&mut self, server: &ServerManager, command: Command) {
        match command {
            Command::Joined(peer) => {
                for board in &self.boards {
                    if let Err(e) = peer.emit(SHARING_BOARD, [board.as_str()]) {
                        debug!(peer = %peer.id(), error = %e, "could not send board list");
                        return;
                    }
                }
            }
            Command::Share { from, args } => match parse_board(&args) {
                Ok(board) => {
                    info!(%board, peer = %from, "board shared");
                    self.boards.insert(board.clone());
                    server.broadcast(SHARING_BOARD, [board]);
                }
                Err(e) => reject(server, from, &e),
            },
            Command::Unshare { from, args } => match parse_board(&args) {
                Ok(board) => {
                    if self.boards.remove(&board) {
                        info!(%board, peer = %from, "board unshared");
                        server.broadcast(UNSHARING_BOARD, [board]);
                    } else {
                        debug!(%board, "unshare for unknown board");
                    }
                }
                Err(e) => reject(server, from, &e),
            },
        }
    }
}

fn reject(server: &ServerManager, from: ConnectionId, error: &BoardError) {
    warn!(peer = %from, %error, "bad board request");
    let Some(peer) = server
        .established_endpoints()
        .into_iter()
        .find(|endpoint| endpoint.id() == from)
    else {
        debug!(peer = %from, "peer gone before error could be reported");
        return;
    };
    if let Err(e) = peer.emit(ERROR, [error.to_string()]) {
        debug!(peer = %from, error = %e, "could not report error");
    }
}

/// Subscribes a new peer's board requests into the command queue.
/// Handlers hold the peer's id, not the endpoint that owns them.
fn attach(peer: &Endpoint, commands: &mpsc::UnboundedSender<Command>) {
    let from = peer.id();
    let tx = commands.clone();
    peer.on(SHARE_BOARD, move |args: &[String]| {
        let _ = tx.send(Command::Share {
            from,
            args: args.to_vec(),
        });
    });
    let tx = commands.clone();
    peer.on(UNSHARE_BOARD, move |args: &[String]| {
        let _ = tx.send(Command::Unshare {
            from,
            args: args.to_vec(),
        });
    });
    let _ = commands.send(Command::Joined(peer.clone()));
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match cli.password {
        Some(password) => ManagerConfig::with_secret(password),
        None => ManagerConfig::default(),
    };

    let server = ServerManager::bind(&format!("{}:{}", cli.host, cli.port), config).await?;
    let (commands, mut queue) = mpsc::unbounded_channel();
    server.on(LifecycleKind::SessionStarted, move |event| {
        attach(event.endpoint(), &commands);
    });
    server.on(LifecycleKind::SessionError, |event| {
        debug!(peer = %event.endpoint().id(), reason = event.reason().unwrap_or(""), "peer failed");
    });

    info!(addr = ?server.local_addr(), "whiteboard server starting up");
    server.start();

    let mut directory = Directory::default();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(command) = queue.recv() => directory.apply(&server, command),
        }
    }

    info!("whiteboard server shutting down");
    server.shutdown();
    server.join().await?;
    Ok(())
}
