//! Line-oriented operator console on stdin.

use std::path::{Path, PathBuf};

use shadow_core::OutgoingFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::node::NodeEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(String),
    Disconnect(String),
    /// Read a local file and broadcast it.
    Send(PathBuf),
    Chat(String),
    Peers,
    Files,
    Save { file_id: String, path: PathBuf },
    Pending,
    Logs(usize),
    Messages,
    Id,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  connect <node-id>        open a session
  disconnect <node-id>     drop a session
  send <path>              send a file to every open session
  chat <text>              send a chat message to every open session
  peers                    list sessions
  files                    list received files
  save <file-id> <path>    write a received file to disk
  pending                  list incomplete transfers
  logs [n]                 show the n most recent events (default 20)
  messages                 show chat history
  id                       show this node's ID
  quit";

const DEFAULT_LOG_LINES: usize = 20;

/// Parse one console line. `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    let cmd = match word {
        "connect" => Command::Connect(required(rest, "connect <node-id>")?.to_string()),
        "disconnect" => Command::Disconnect(required(rest, "disconnect <node-id>")?.to_string()),
        "send" => Command::Send(PathBuf::from(required(rest, "send <path>")?)),
        // empty text goes through so the core can reject it
        "chat" => Command::Chat(rest.to_string()),
        "peers" => Command::Peers,
        "files" => Command::Files,
        "save" => {
            let (id, path) = required(rest, "save <file-id> <path>")?
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: save <file-id> <path>".to_string())?;
            Command::Save {
                file_id: id.to_string(),
                path: PathBuf::from(path.trim()),
            }
        }
        "pending" => Command::Pending,
        "logs" => {
            if rest.is_empty() {
                Command::Logs(DEFAULT_LOG_LINES)
            } else {
                Command::Logs(rest.parse().map_err(|_| "usage: logs [n]".to_string())?)
            }
        }
        "messages" => Command::Messages,
        "id" => Command::Id,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command: {} (try help)", other)),
    };
    Ok(Some(cmd))
}

fn required<'a>(rest: &'a str, usage: &str) -> Result<&'a str, String> {
    if rest.is_empty() {
        Err(format!("usage: {}", usage))
    } else {
        Ok(rest)
    }
}

/// MIME type from the file extension.
pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "zip" => "application/zip",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

async fn read_outgoing(path: &Path) -> std::io::Result<OutgoingFile> {
    let data = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(OutgoingFile::new(name, guess_mime(path), data))
}

/// Read stdin until EOF or `quit`, forwarding commands to the event loop.
pub async fn run(events: mpsc::UnboundedSender<NodeEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        let event = match parse(&line) {
            Ok(None) => continue,
            Ok(Some(Command::Send(path))) => match read_outgoing(&path).await {
                Ok(file) => NodeEvent::SendFile(file),
                Err(e) => {
                    println!("cannot read {}: {}", path.display(), e);
                    continue;
                }
            },
            Ok(Some(cmd)) => NodeEvent::Command(cmd),
            Err(msg) => {
                println!("{}", msg);
                continue;
            }
        };
        let quit = matches!(event, NodeEvent::Command(Command::Quit));
        if events.send(event).is_err() || quit {
            return;
        }
    }
    tracing::debug!("console input ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse("connect shadow-abc").unwrap(),
            Some(Command::Connect("shadow-abc".into()))
        );
        assert_eq!(
            parse("  chat hello there  ").unwrap(),
            Some(Command::Chat("hello there".into()))
        );
        assert_eq!(parse("chat").unwrap(), Some(Command::Chat(String::new())));
        assert_eq!(
            parse("save shadow-a-1-x /tmp/out file.png").unwrap(),
            Some(Command::Save {
                file_id: "shadow-a-1-x".into(),
                path: PathBuf::from("/tmp/out file.png"),
            })
        );
        assert_eq!(parse("logs").unwrap(), Some(Command::Logs(20)));
        assert_eq!(parse("logs 5").unwrap(), Some(Command::Logs(5)));
        assert_eq!(parse("   ").unwrap(), None);
        assert_eq!(parse("exit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn usage_errors() {
        assert!(parse("connect").is_err());
        assert!(parse("send").is_err());
        assert!(parse("save only-id").is_err());
        assert!(parse("logs many").is_err());
        assert!(parse("frobnicate").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(guess_mime(Path::new("report.PNG")), "image/png");
        assert_eq!(guess_mime(Path::new("notes.txt")), "text/plain");
        assert_eq!(guess_mime(Path::new("blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn reads_file_for_sending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.png");
        std::fs::write(&path, b"\x89PNG").unwrap();
        let file = read_outgoing(&path).await.unwrap();
        assert_eq!(file.name, "report.png");
        assert_eq!(file.mime_type, "image/png");
        assert_eq!(file.data, b"\x89PNG");
    }
}
