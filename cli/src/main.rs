use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sceneboard::doc::{self, Element};
use sceneboard::sync::session::{RoomSession, SessionConfig, SessionParams, SessionView};
use sceneboard::sync::transport::TransportError;
use sceneboard::sync::{SyncStatus, WsTransport};
use serde_json::Value;
use uuid::Uuid;

const SYNC_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {status}: {message}")]
    Server { status: u16, message: String },
    #[error("room {0} has no snapshot")]
    NotFound(String),
    #[error("room {0} is retired")]
    Retired(String),
    #[error("invalid scene JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("read input failed: {0}")]
    Io(#[from] io::Error),
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("room session ended unexpectedly")]
    SessionEnded,
    #[error("timed out waiting for room {0} to sync")]
    SyncTimeout(String),
}

#[derive(Parser, Debug)]
#[command(name = "sceneboard-cli", about = "Sceneboard room API and live sync CLI")]
struct Cli {
    #[arg(long, env = "SCENEBOARD_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check server health.
    Ping,
    /// Print a room's snapshot.
    Get { room_id: String },
    /// Replace a room's snapshot with a JSON element array.
    Put {
        room_id: String,
        #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
        input: String,
    },
    /// Print the text of a room's text elements.
    Text { room_id: String },
    /// Create a room from another room's elements.
    Seed {
        room_id: String,
        #[arg(long = "from")]
        source_room: String,
    },
    /// Retire a room. Later writes are ignored.
    Retire { room_id: String },
    /// Join a room over the websocket and print every change until Ctrl-C.
    Watch {
        room_id: String,
        #[arg(long, env = "SCENEBOARD_USER", default_value = "cli")]
        user: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Join a room as an editor and add one text element.
    AddText {
        room_id: String,
        text: String,
        #[arg(long, env = "SCENEBOARD_USER", default_value = "cli")]
        user: String,
        #[arg(long, default_value_t = 0.0)]
        x: f64,
        #[arg(long, default_value_t = 0.0)]
        y: f64,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let base_url = cli.base_url.trim_end_matches('/').to_owned();

    match cli.command {
        Command::Ping => run_ping(&base_url).await,
        Command::Get { room_id } => run_get(&base_url, &room_id).await,
        Command::Put { room_id, input } => run_put(&base_url, &room_id, &input).await,
        Command::Text { room_id } => run_text(&base_url, &room_id).await,
        Command::Seed { room_id, source_room } => run_seed(&base_url, &room_id, &source_room).await,
        Command::Retire { room_id } => run_retire(&base_url, &room_id).await,
        Command::Watch { room_id, user, name } => run_watch(&base_url, &room_id, &user, name).await,
        Command::AddText { room_id, text, user, x, y } => run_add_text(&base_url, &room_id, &user, &text, x, y).await,
    }
}

// =============================================================================
// REST
// =============================================================================

async fn run_ping(base_url: &str) -> Result<(), CliError> {
    let response = reqwest::get(format!("{base_url}/healthz")).await?;
    check_status(response).await?;
    println!("ok");
    Ok(())
}

async fn run_get(base_url: &str, room_id: &str) -> Result<(), CliError> {
    let response = reqwest::get(format!("{base_url}/api/rooms/{room_id}/snapshot")).await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(CliError::NotFound(room_id.to_owned()));
    }
    let body = check_status(response).await?;
    let elements = body.get("elements").and_then(Value::as_str).unwrap_or("[]");
    print_json(&serde_json::from_str(elements)?)
}

async fn run_put(base_url: &str, room_id: &str, input: &str) -> Result<(), CliError> {
    let raw = read_input(input)?;
    // Validate locally so a typo never reaches the room.
    let elements = doc::parse_scene(&raw)?;
    let serialized = doc::serialize_scene(&elements)?;

    let response = reqwest::Client::new()
        .put(format!("{base_url}/api/rooms/{room_id}/snapshot"))
        .json(&serde_json::json!({ "elements": serialized }))
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::GONE {
        return Err(CliError::Retired(room_id.to_owned()));
    }
    let body = check_status(response).await?;
    eprintln!("wrote {} element(s) to {room_id}", elements.len());
    print_json(&body)
}

async fn run_text(base_url: &str, room_id: &str) -> Result<(), CliError> {
    let response = reqwest::get(format!("{base_url}/api/rooms/{room_id}/text")).await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(CliError::NotFound(room_id.to_owned()));
    }
    let body = check_status(response).await?;
    for line in body.get("lines").and_then(Value::as_array).into_iter().flatten() {
        if let Some(line) = line.as_str() {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_seed(base_url: &str, room_id: &str, source_room: &str) -> Result<(), CliError> {
    let response = reqwest::Client::new()
        .post(format!("{base_url}/api/rooms/{room_id}/seed"))
        .json(&serde_json::json!({ "source_room": source_room }))
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::GONE {
        return Err(CliError::Retired(room_id.to_owned()));
    }
    let body = check_status(response).await?;
    print_json(&body)
}

async fn run_retire(base_url: &str, room_id: &str) -> Result<(), CliError> {
    let response = reqwest::Client::new()
        .delete(format!("{base_url}/api/rooms/{room_id}"))
        .send()
        .await?;
    check_status(response).await?;
    eprintln!("retired {room_id}");
    Ok(())
}

/// Return the JSON body of a successful response, or `Value::Null` if empty.
async fn check_status(response: reqwest::Response) -> Result<Value, CliError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(CliError::Server { status: status.as_u16(), message: text });
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
}

// =============================================================================
// LIVE SYNC
// =============================================================================

async fn open_session(base_url: &str, room_id: &str, user: &str, name: Option<String>) -> Result<RoomSession, CliError> {
    let transport = WsTransport::connect(base_url, user).await?;
    let params = SessionParams {
        room_id: room_id.to_owned(),
        user_id: user.to_owned(),
        display_name: name,
        view_only: false,
    };
    Ok(RoomSession::open(Arc::new(transport), params, SessionConfig::from_env()))
}

async fn run_watch(base_url: &str, room_id: &str, user: &str, name: Option<String>) -> Result<(), CliError> {
    let session = open_session(base_url, room_id, user, name).await?;
    let mut view = session.view();

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    return Err(CliError::SessionEnded);
                }
                print_view(room_id, &view.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("leaving {room_id}");
                break;
            }
        }
    }

    session.leave().await.map_err(|_| CliError::SessionEnded)
}

async fn run_add_text(base_url: &str, room_id: &str, user: &str, text: &str, x: f64, y: f64) -> Result<(), CliError> {
    let session = open_session(base_url, room_id, user, None).await?;
    let loaded = wait_for(&session, room_id, |v| !v.loading || v.status == SyncStatus::Failed).await?;
    match loaded.status {
        SyncStatus::RoomRetired => return Err(CliError::Retired(room_id.to_owned())),
        SyncStatus::Failed => return Err(CliError::SessionEnded),
        _ => {}
    }

    let mut element = Element::new(Uuid::new_v4().to_string(), "text");
    element.payload.insert("text".into(), text.into());
    element.payload.insert("x".into(), x.into());
    element.payload.insert("y".into(), y.into());
    let element_id = element.id.clone();

    let mut elements = loaded.elements;
    elements.push(element);
    session.local_change(elements).await.map_err(|_| CliError::SessionEnded)?;

    let synced = wait_for(&session, room_id, |v| {
        v.status != SyncStatus::Pending && v.elements.iter().any(|e| e.id == element_id)
    })
    .await?;
    session.leave().await.map_err(|_| CliError::SessionEnded)?;

    match synced.status {
        SyncStatus::Synced => {
            println!("{element_id}");
            Ok(())
        }
        SyncStatus::RoomRetired => Err(CliError::Retired(room_id.to_owned())),
        _ => Err(CliError::SyncTimeout(room_id.to_owned())),
    }
}

async fn wait_for(
    session: &RoomSession,
    room_id: &str,
    pred: impl FnMut(&SessionView) -> bool,
) -> Result<SessionView, CliError> {
    let mut view = session.view();
    let found = tokio::time::timeout(SYNC_WAIT, view.wait_for(pred))
        .await
        .map_err(|_| CliError::SyncTimeout(room_id.to_owned()))?
        .map_err(|_| CliError::SessionEnded)?;
    Ok(SessionView::clone(&found))
}

fn print_view(room_id: &str, view: &SessionView) {
    let live = view.elements.iter().filter(|e| !e.is_deleted).count();
    let who: Vec<String> = view
        .collaborators
        .iter()
        .map(|c| format!("{}@({:.0},{:.0})", c.display_name, c.x, c.y))
        .collect();
    println!(
        "{room_id} status={:?} elements={live} view_only={} collaborators=[{}]",
        view.status,
        view.view_only,
        who.join(", ")
    );
}

// =============================================================================
// HELPERS
// =============================================================================

fn read_input(input: &str) -> Result<String, CliError> {
    if input == "-" {
        let mut raw = String::new();
        io::stdin().read_to_string(&mut raw)?;
        Ok(raw)
    } else {
        Ok(std::fs::read_to_string(input)?)
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_watch_with_defaults() {
        let cli = Cli::try_parse_from(["sceneboard-cli", "watch", "main"]).unwrap();
        match cli.command {
            Command::Watch { room_id, user, name } => {
                assert_eq!(room_id, "main");
                assert!(!user.is_empty());
                assert!(name.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_seed_source() {
        let cli = Cli::try_parse_from(["sceneboard-cli", "seed", "group-2", "--from", "main"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Seed { ref room_id, ref source_room } if room_id == "group-2" && source_room == "main"
        ));
    }

    #[test]
    fn read_input_reads_files() {
        let path = std::env::temp_dir().join(format!("sceneboard-cli-{}.json", Uuid::new_v4()));
        std::fs::write(&path, "[]").unwrap();
        assert_eq!(read_input(path.to_str().unwrap()).unwrap(), "[]");
        let _ = std::fs::remove_file(path);
    }
}
