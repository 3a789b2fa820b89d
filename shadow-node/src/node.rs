//! Event loop: one task owns the core; transport and console tasks feed it `NodeEvent`s and it
//! executes the returned actions.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use shadow_core::{
    Action, ConnectionEvent, ConnectionHandle, NodeId, OutgoingFile, ShadowCore, SignalingEvent,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::console::{Command, HELP};
use crate::transport::{self, NodeError, Session};

const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

/// Everything the event loop reacts to.
pub enum NodeEvent {
    Signaling(SignalingEvent),
    /// Inbound stream whose hello completed.
    Accepted { remote: NodeId, stream: TcpStream },
    /// Outcome of a dial started for `handle`.
    Dialed {
        remote: NodeId,
        handle: ConnectionHandle,
        result: Result<TcpStream, NodeError>,
    },
    Connection {
        remote: NodeId,
        handle: ConnectionHandle,
        event: ConnectionEvent,
    },
    Data {
        remote: NodeId,
        handle: ConnectionHandle,
        payload: Vec<u8>,
    },
    Command(Command),
    SendFile(OutgoingFile),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub struct Node {
    core: ShadowCore,
    config: Config,
    events: mpsc::UnboundedSender<NodeEvent>,
    sessions: HashMap<ConnectionHandle, Session>,
    listener: Option<JoinHandle<()>>,
    registered: bool,
}

impl Node {
    pub fn new(core: ShadowCore, config: Config) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let node = Self {
            core,
            config,
            events,
            sessions: HashMap::new(),
            listener: None,
            registered: false,
        };
        (node, rx)
    }

    pub fn events(&self) -> mpsc::UnboundedSender<NodeEvent> {
        self.events.clone()
    }

    pub fn core(&self) -> &ShadowCore {
        &self.core
    }

    /// Start listening and process events until `quit` or shutdown. Every session is closed on exit.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<NodeEvent>) {
        self.start_signaling(Duration::ZERO);
        while let Some(event) = rx.recv().await {
            if self.handle(event) == Flow::Stop {
                break;
            }
        }
        self.stop().await;
    }

    async fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        let writers: Vec<_> = self.sessions.drain().map(|(_, s)| s.close()).collect();
        let actions = self.core.shutdown();
        self.execute(actions);
        let flush = async {
            for w in writers {
                let _ = w.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_FLUSH, flush).await.is_err() {
            tracing::warn!("gave up flushing sessions");
        }
        tracing::info!(node = %self.core.node_id(), "node stopped");
    }

    pub fn handle(&mut self, event: NodeEvent) -> Flow {
        match event {
            NodeEvent::Signaling(ev) => self.on_signaling(ev),
            NodeEvent::Accepted { remote, stream } => {
                let (handle, actions) = self.core.on_incoming(&remote);
                self.execute(actions);
                self.open_session(remote, handle, stream);
            }
            NodeEvent::Dialed {
                remote,
                handle,
                result,
            } => match result {
                Ok(stream) if self.core.connections().handle_of(&remote) == Some(handle) => {
                    self.open_session(remote, handle, stream)
                }
                Ok(_) => tracing::debug!(%remote, %handle, "dial finished for a replaced session"),
                Err(e) => {
                    let actions = self.core.on_connection(
                        &remote,
                        handle,
                        ConnectionEvent::Failed {
                            reason: e.to_string(),
                        },
                    );
                    self.execute(actions);
                }
            },
            NodeEvent::Connection {
                remote,
                handle,
                event,
            } => {
                if let Some(session) = self.sessions.remove(&handle) {
                    session.close();
                }
                let actions = self.core.on_connection(&remote, handle, event);
                self.execute(actions);
            }
            NodeEvent::Data {
                remote,
                handle,
                payload,
            } => {
                if self.core.connections().handle_of(&remote) == Some(handle) {
                    let actions = self.core.on_data(&remote, &payload);
                    self.execute(actions);
                } else {
                    tracing::debug!(%remote, %handle, "dropping data from stale session");
                }
            }
            NodeEvent::Command(cmd) => return self.on_command(cmd),
            NodeEvent::SendFile(file) => {
                let actions = self.core.send_file(file);
                self.execute(actions);
            }
            NodeEvent::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        let first = matches!(event, SignalingEvent::Registered { .. }) && !self.registered;
        let actions = self.core.on_signaling(event);
        self.execute(actions);
        if first {
            self.registered = true;
            println!("node {} listening on port {}", self.core.node_id(), self.config.listen_port);
            for target in self.config.autoconnect.clone() {
                let actions = self.core.connect(&target);
                self.execute(actions);
            }
        }
    }

    fn open_session(&mut self, remote: NodeId, handle: ConnectionHandle, stream: TcpStream) {
        let session = Session::spawn(stream, remote.clone(), handle, self.events.clone());
        self.sessions.insert(handle, session);
        let actions = self.core.on_connection(&remote, handle, ConnectionEvent::Opened);
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Dial { remote, handle } => {
                    match self.config.directory.get(remote.as_str()).copied() {
                        Some(addr) => self.spawn_dial(remote, handle, addr),
                        None => {
                            let reason = NodeError::Unresolved(remote.clone()).to_string();
                            queue.extend(self.core.on_connection(
                                &remote,
                                handle,
                                ConnectionEvent::Failed { reason },
                            ));
                        }
                    }
                }
                Action::Send { handle, frame } => match self.sessions.get(&handle) {
                    Some(session) if session.send(frame) => {}
                    _ => tracing::debug!(%handle, "no writer for session; frame dropped"),
                },
                Action::Close { handle } => {
                    if let Some(session) = self.sessions.remove(&handle) {
                        session.close();
                    }
                }
                Action::ReconnectSignaling => self.start_signaling(self.config.reconnect_delay()),
                Action::FileReceived { file_id } => {
                    if let Some(f) = self.core.completed_file(&file_id) {
                        println!(
                            "<< file {} from {}: {} ({}, {} bytes)",
                            f.id, f.from_peer_id, f.name, f.mime_type, f.size
                        );
                    }
                }
            }
        }
    }

    fn spawn_dial(&self, remote: NodeId, handle: ConnectionHandle, addr: SocketAddr) {
        let me = self.core.node_id().clone();
        let timeout = self.config.handshake_timeout();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = transport::dial(addr, &me, &remote, timeout).await;
            let _ = events.send(NodeEvent::Dialed {
                remote,
                handle,
                result,
            });
        });
    }

    /// (Re)bind the listener after `delay`. Listening stands in for signaling registration; a bind
    /// or accept failure reports `Disconnected`, which schedules the next attempt.
    fn start_signaling(&mut self, delay: Duration) {
        if let Some(old) = self.listener.take() {
            old.abort();
        }
        let me = self.core.node_id().clone();
        let port = self.config.listen_port;
        let timeout = self.config.handshake_timeout();
        let events = self.events.clone();
        self.listener = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let (kind, e) = match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    let _ = events.send(NodeEvent::Signaling(SignalingEvent::Registered {
                        id: me.clone(),
                    }));
                    match transport::accept_loop(listener, me, timeout, events.clone()).await {
                        Ok(()) => return,
                        Err(e) => ("accept", e),
                    }
                }
                Err(e) => ("bind", e),
            };
            let _ = events.send(NodeEvent::Signaling(SignalingEvent::Error {
                kind: kind.to_string(),
                message: e.to_string(),
            }));
            let _ = events.send(NodeEvent::Signaling(SignalingEvent::Disconnected));
        }));
    }

    fn on_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Connect(target) => {
                let actions = self.core.connect(&target);
                self.execute(actions);
                self.print_latest();
            }
            Command::Disconnect(target) => {
                let remote = NodeId::from(target.trim());
                let actions = self.core.remove(&remote);
                if actions.is_empty() {
                    println!("no session with {}", remote);
                }
                self.execute(actions);
            }
            Command::Send(path) => {
                // files are read by the console before they reach the loop
                tracing::warn!(path = %path.display(), "unexpected send command in event loop");
            }
            Command::Chat(text) => {
                let actions = self.core.send_chat(&text);
                if actions.is_empty() {
                    self.print_latest();
                }
                self.execute(actions);
            }
            Command::Peers => {
                let mut peers: Vec<_> = self.core.connections().iter().collect();
                peers.sort_by(|a, b| a.0.cmp(b.0));
                if peers.is_empty() {
                    println!("no sessions");
                }
                for (id, c) in peers {
                    println!("{} {:?} {:?} {}", id, c.state, c.direction, c.handle);
                }
            }
            Command::Files => {
                let mut n = 0;
                for f in self.core.completed_files() {
                    n += 1;
                    println!(
                        "{} {} ({}, {} bytes) from {} {}",
                        f.id, f.name, f.mime_type, f.size, f.from_peer_id, f.url
                    );
                }
                if n == 0 {
                    println!("no files received");
                }
            }
            Command::Save { file_id, path } => match self.core.completed_file(&file_id) {
                Some(f) => {
                    let data = f.data.clone();
                    tokio::spawn(async move {
                        match tokio::fs::write(&path, &data).await {
                            Ok(()) => println!("saved {} bytes to {}", data.len(), path.display()),
                            Err(e) => println!("cannot write {}: {}", path.display(), e),
                        }
                    });
                }
                None => println!("no file {}", file_id),
            },
            Command::Pending => {
                let pending = self.core.pending_transfers();
                if pending.is_empty() {
                    println!("no pending transfers");
                }
                for p in pending {
                    println!(
                        "{} {} from {}: {}/{} chunks",
                        p.id, p.name, p.from_peer_id, p.received, p.expected
                    );
                }
            }
            Command::Logs(n) => {
                let mut recent: Vec<_> = self.core.log().entries().take(n).collect();
                recent.reverse();
                for e in recent {
                    println!("{} {:<7} {}", format_time(e.timestamp), format!("{:?}", e.severity), e.message);
                }
            }
            Command::Messages => {
                for m in self.core.messages() {
                    println!("{} <{}> {}", format_time(m.created_at), m.from_peer_id, m.text);
                }
            }
            Command::Id => {
                let identity = self.core.identity();
                println!("{} ({:?})", identity.id, identity.origin);
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => return Flow::Stop,
        }
        Flow::Continue
    }

    fn print_latest(&self) {
        if let Some(e) = self.core.log().latest() {
            println!("{:?}: {}", e.severity, e.message);
        }
    }
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadow_core::identity::{Identity, IdentityOrigin};
    use shadow_core::{encode_frame, Packet, Severity};
    use tokio::io::AsyncWriteExt;

    fn node(id: &str, config: Config) -> (Node, mpsc::UnboundedReceiver<NodeEvent>) {
        let core = ShadowCore::new(Identity {
            id: NodeId::from(id),
            origin: IdentityOrigin::Loaded,
        });
        let (mut node, rx) = Node::new(core, config);
        node.handle(NodeEvent::Signaling(SignalingEvent::Registered {
            id: NodeId::from(id),
        }));
        (node, rx)
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn unknown_target_fails_without_dialing() {
        let (mut node, _rx) = node("shadow-aaa", Config::default());
        node.handle(NodeEvent::Command(Command::Connect("shadow-bbb".into())));
        let last = node.core().log().latest().unwrap();
        assert_eq!(last.severity, Severity::Error);
        assert_eq!(
            last.message,
            "Connection error with shadow-bbb: no directory entry for shadow-bbb"
        );
        assert!(node.core().connections().is_empty());
    }

    #[tokio::test]
    async fn accepted_session_delivers_chat() {
        let (mut node, mut rx) = node("shadow-bbb", Config::default());
        let (mut remote_side, local_side) = pair().await;
        node.handle(NodeEvent::Accepted {
            remote: NodeId::from("shadow-aaa"),
            stream: local_side,
        });
        assert!(node.core().connections().is_open(&NodeId::from("shadow-aaa")));

        let chat = Packet::Chat {
            text: "hello".into(),
            from_peer_id: NodeId::from("shadow-aaa"),
            created_at: 1_700_000_000_000,
        };
        remote_side
            .write_all(&encode_frame(&chat).unwrap())
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, NodeEvent::Data { .. }));
        node.handle(event);
        let messages = node.core().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello");

        drop(remote_side);
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            NodeEvent::Connection {
                event: ConnectionEvent::Closed,
                ..
            }
        ));
        node.handle(event);
        assert!(!node.core().connections().is_open(&NodeId::from("shadow-aaa")));
        assert!(node.sessions.is_empty());
    }

    #[tokio::test]
    async fn replacing_inbound_closes_old_session() {
        let (mut node, _rx) = node("shadow-bbb", Config::default());
        let (_r1, l1) = pair().await;
        let (_r2, l2) = pair().await;
        let remote = NodeId::from("shadow-aaa");
        node.handle(NodeEvent::Accepted {
            remote: remote.clone(),
            stream: l1,
        });
        let first = node.core().connections().handle_of(&remote).unwrap();
        node.handle(NodeEvent::Accepted {
            remote: remote.clone(),
            stream: l2,
        });
        let second = node.core().connections().handle_of(&remote).unwrap();
        assert_ne!(first, second);
        assert_eq!(node.sessions.len(), 1);
        assert!(node.sessions.contains_key(&second));

        // late data on the replaced session is dropped
        let before = node.core().log().len();
        node.handle(NodeEvent::Data {
            remote,
            handle: first,
            payload: br#"{"type":"text","text":"old"}"#.to_vec(),
        });
        assert_eq!(node.core().log().len(), before);
    }

    #[tokio::test]
    async fn disconnect_logs_termination() {
        let (mut node, _rx) = node("shadow-bbb", Config::default());
        let (_remote_side, local_side) = pair().await;
        node.handle(NodeEvent::Accepted {
            remote: NodeId::from("shadow-aaa"),
            stream: local_side,
        });
        node.handle(NodeEvent::Command(Command::Disconnect("shadow-aaa".into())));
        let last = node.core().log().latest().unwrap();
        assert_eq!(last.severity, Severity::Warning);
        assert_eq!(last.message, "Connection terminated: shadow-aaa");
        assert!(node.sessions.is_empty());
        assert!(node.core().connections().is_empty());
    }

    #[tokio::test]
    async fn quit_and_shutdown_stop_the_loop() {
        let (mut node, _rx) = node("shadow-aaa", Config::default());
        assert_eq!(node.handle(NodeEvent::Command(Command::Peers)), Flow::Continue);
        assert_eq!(node.handle(NodeEvent::Command(Command::Quit)), Flow::Stop);
        assert_eq!(node.handle(NodeEvent::Shutdown), Flow::Stop);
    }

    #[tokio::test]
    async fn two_nodes_exchange_a_file() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let b_config = Config {
            listen_port: port,
            ..Config::default()
        };
        let mut a_config = Config::default();
        a_config.directory.insert(
            "shadow-bbb".into(),
            SocketAddr::from(([127, 0, 0, 1], port)),
        );

        let (b, b_rx) = Node::new(
            ShadowCore::new(Identity {
                id: NodeId::from("shadow-bbb"),
                origin: IdentityOrigin::Loaded,
            }),
            b_config,
        );
        let b_events = b.events();
        let b_task = tokio::spawn(async move {
            let mut b = b;
            let mut rx = b_rx;
            b.start_signaling(Duration::ZERO);
            while let Some(ev) = rx.recv().await {
                if b.handle(ev) == Flow::Stop {
                    break;
                }
                if b.core().completed_files().count() == 1 {
                    break;
                }
            }
            b
        });

        let (mut a, mut a_rx) = node("shadow-aaa", a_config);
        // wait for b's listener
        let mut dialed = false;
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                dialed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dialed);

        a.handle(NodeEvent::Command(Command::Connect("shadow-bbb".into())));
        let ev = a_rx.recv().await.unwrap();
        assert!(matches!(ev, NodeEvent::Dialed { result: Ok(_), .. }));
        a.handle(ev);
        assert!(a.core().connections().is_open(&NodeId::from("shadow-bbb")));

        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        a.handle(NodeEvent::SendFile(OutgoingFile::new(
            "report.bin",
            "application/octet-stream",
            data.clone(),
        )));

        let b = tokio::time::timeout(Duration::from_secs(10), b_task)
            .await
            .unwrap()
            .unwrap();
        let f = b.core().completed_files().next().unwrap();
        assert_eq!(f.data, data);
        assert_eq!(f.from_peer_id.as_str(), "shadow-aaa");
        let _ = b_events.send(NodeEvent::Shutdown);
    }
}
