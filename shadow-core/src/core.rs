//! Host-driven API: ShadowCore receives events from the host, returns actions.
//!
//! Every mutation (registry, incoming buffers, completed files, chat, event log) happens
//! inside one of the `on_*` / user-action methods below, called from a single event loop.

use std::collections::VecDeque;

use crate::chat::{ChatLog, ChatMessage};
use crate::identity::{Identity, IdentityOrigin, IdentityStore, NodeId};
use crate::log::EventLog;
use crate::protocol::{FileChunk, Packet};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Registration};
use crate::transfer::{
    self, ChunkOutcome, CompleteOutcome, CompletedFile, OutgoingFile, PendingTransfer, Reassembler,
};
use crate::wire;

/// Event from the signaling collaborator.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Local node registered under `id`.
    Registered { id: NodeId },
    /// Registration lost; the core asks the host to reconnect.
    Disconnected,
    Error { kind: String, message: String },
}

/// Lifecycle event for one transport session.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Opened,
    Closed,
    Failed { reason: String },
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a transport session to `remote`; report back with `handle`.
    Dial {
        remote: NodeId,
        handle: ConnectionHandle,
    },
    /// Write one encoded frame on the session. Frames for a handle must be written in order.
    Send {
        handle: ConnectionHandle,
        frame: Vec<u8>,
    },
    /// Tear down the session.
    Close { handle: ConnectionHandle },
    /// Re-register with the signaling collaborator.
    ReconnectSignaling,
    /// A file finished reassembly and is available via `completed_file`.
    FileReceived { file_id: String },
}

/// Main coordinator. Host passes events; core returns actions.
pub struct ShadowCore {
    identity: Identity,
    kernel_ready: bool,
    registry: ConnectionRegistry,
    reassembler: Reassembler,
    completed: VecDeque<CompletedFile>,
    chat: ChatLog,
    log: EventLog,
}

impl ShadowCore {
    pub fn new(identity: Identity) -> Self {
        let mut log = EventLog::new();
        if identity.origin == IdentityOrigin::Ephemeral {
            log.warning("Identity storage unavailable. Using a temporary node ID.");
        }
        log.info(format!(
            "Initializing Shadow Node with ID: {}...",
            identity.id
        ));
        Self {
            identity,
            kernel_ready: false,
            registry: ConnectionRegistry::new(),
            reassembler: Reassembler::new(),
            completed: VecDeque::new(),
            chat: ChatLog::new(),
            log,
        }
    }

    /// Resolve identity from `store` and build the core.
    pub fn from_store<S: IdentityStore + ?Sized>(store: &mut S) -> Self {
        Self::new(crate::identity::ensure_identity(store))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.identity.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// True once signaling has registered the node at least once.
    pub fn is_ready(&self) -> bool {
        self.kernel_ready
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Chat messages sorted by creation time.
    pub fn messages(&self) -> Vec<&ChatMessage> {
        self.chat.sorted()
    }

    /// Completed files, newest first.
    pub fn completed_files(&self) -> impl Iterator<Item = &CompletedFile> {
        self.completed.iter()
    }

    pub fn completed_file(&self, file_id: &str) -> Option<&CompletedFile> {
        self.completed.iter().find(|f| f.id == file_id)
    }

    pub fn pending_transfers(&self) -> Vec<PendingTransfer> {
        self.reassembler.pending()
    }

    /// Signaling registration, loss, and errors.
    pub fn on_signaling(&mut self, event: SignalingEvent) -> Vec<Action> {
        match event {
            SignalingEvent::Registered { id } => {
                self.kernel_ready = true;
                self.log
                    .success(format!("Node active. Identity confirmed: {}", id));
                vec![]
            }
            SignalingEvent::Disconnected => {
                self.log
                    .warning("Peer disconnected from signaling server. Reconnecting...");
                vec![Action::ReconnectSignaling]
            }
            SignalingEvent::Error { kind, message } => {
                self.log.error(format!("Peer Error: {} - {}", kind, message));
                vec![]
            }
        }
    }

    /// User asked to connect to `target`. Emits a Dial unless a session already exists.
    pub fn connect(&mut self, target: &str) -> Vec<Action> {
        if !self.kernel_ready {
            self.log.error("Kernel not ready. Cannot connect.");
            return vec![];
        }
        let trimmed = target.trim();
        if trimmed.is_empty() {
            self.log.warning("Target ID cannot be empty.");
            return vec![];
        }
        if trimmed == self.identity.id.as_str() {
            self.log.warning("Cannot connect to self.");
            return vec![];
        }
        let remote = NodeId::from(trimmed);
        match self.registry.register_outbound(&remote) {
            Registration::Reused(handle) => {
                self.log.info(format!(
                    "Session with {} already exists ({}).",
                    remote, handle
                ));
                vec![]
            }
            registration => {
                self.log
                    .info(format!("Initiating handshake with {}...", remote));
                vec![Action::Dial {
                    remote,
                    handle: registration.handle(),
                }]
            }
        }
    }

    /// Remote peer opened a session to us. Returns the handle the host must report events with.
    pub fn on_incoming(&mut self, remote: &NodeId) -> (ConnectionHandle, Vec<Action>) {
        self.log
            .info(format!("Incoming connection request from {}", remote));
        match self.registry.register_inbound(remote) {
            Registration::Replaced { handle, old } => {
                self.log
                    .warning(format!("Connection terminated: {}", remote));
                (handle, vec![Action::Close { handle: old }])
            }
            registration => (registration.handle(), vec![]),
        }
    }

    /// Transport lifecycle for `handle`. Events for a handle that is no longer current are ignored.
    pub fn on_connection(
        &mut self,
        remote: &NodeId,
        handle: ConnectionHandle,
        event: ConnectionEvent,
    ) -> Vec<Action> {
        match event {
            ConnectionEvent::Opened => {
                if self.registry.mark_open(remote, handle) {
                    self.log
                        .success(format!("Secure channel established with {}", remote));
                } else {
                    tracing::debug!(%remote, %handle, "ignoring open for stale session");
                }
            }
            ConnectionEvent::Closed => {
                if self.registry.close(remote, handle).is_some() {
                    self.log
                        .warning(format!("Connection terminated: {}", remote));
                }
            }
            ConnectionEvent::Failed { reason } => {
                if self.registry.close(remote, handle).is_some() {
                    self.log.error(format!(
                        "Connection error with {}: {}",
                        remote, reason
                    ));
                }
            }
        }
        vec![]
    }

    /// Drop the session for `remote`. Idempotent.
    pub fn remove(&mut self, remote: &NodeId) -> Vec<Action> {
        match self.registry.remove(remote) {
            Some(c) => {
                self.log
                    .warning(format!("Connection terminated: {}", remote));
                vec![Action::Close { handle: c.handle }]
            }
            None => vec![],
        }
    }

    /// Raw frame payload from `remote`. Undecodable payloads are logged and dropped.
    pub fn on_data(&mut self, remote: &NodeId, payload: &[u8]) -> Vec<Action> {
        if !self.registry.is_open(remote) {
            self.log
                .warning(format!("Data from {} without an open session. Ignoring.", remote));
            return vec![];
        }
        match wire::decode_packet(payload) {
            Ok(packet) => self.on_packet(remote, packet),
            Err(e) => {
                tracing::debug!(%remote, error = %e, "dropping packet");
                self.log
                    .warning(format!("Unknown packet type from {}. Ignoring.", remote));
                vec![]
            }
        }
    }

    /// Dispatch a decoded packet by tag.
    pub fn on_packet(&mut self, remote: &NodeId, packet: Packet) -> Vec<Action> {
        if let Packet::FileChunk(_) = packet {
            tracing::debug!(%remote, "file-chunk received");
        } else {
            self.log.info(format!(
                "Packet received from {}: {}",
                remote,
                packet.kind()
            ));
        }
        match packet {
            Packet::FileChunk(chunk) => self.on_file_chunk(remote, chunk),
            Packet::FileComplete { file_id } => self.on_file_complete(&file_id),
            Packet::Text { text } => {
                self.log.info(format!("Message from {}: {}", remote, text));
                vec![]
            }
            Packet::Chat {
                text,
                from_peer_id,
                created_at,
            } => {
                self.log.info(format!("Chat from {}: {}", remote, text));
                self.chat
                    .push(ChatMessage::new(remote, from_peer_id, text, created_at));
                vec![]
            }
        }
    }

    fn on_file_chunk(&mut self, remote: &NodeId, chunk: FileChunk) -> Vec<Action> {
        let file_id = chunk.file_id.clone();
        match self
            .reassembler
            .on_chunk(remote, chunk, crate::now_millis())
        {
            ChunkOutcome::Complete(file) => self.store_completed(file),
            ChunkOutcome::OutOfRange { index, expected } => {
                self.log.warning(format!(
                    "Chunk {} of {} for {} from {} is out of range. Ignoring.",
                    index, expected, file_id, remote
                ));
                vec![]
            }
            ChunkOutcome::Stored { received, expected } => {
                tracing::debug!(%file_id, received, expected, "chunk stored");
                vec![]
            }
            ChunkOutcome::Duplicate | ChunkOutcome::AlreadyFinalized => vec![],
        }
    }

    fn on_file_complete(&mut self, file_id: &str) -> Vec<Action> {
        match self.reassembler.on_complete(file_id, crate::now_millis()) {
            CompleteOutcome::Finalized { file, missing } => {
                if missing > 0 {
                    self.log.warning(format!(
                        "Transfer {} completed with {} missing chunk(s).",
                        file_id, missing
                    ));
                }
                self.store_completed(file)
            }
            CompleteOutcome::Ignored => vec![],
        }
    }

    fn store_completed(&mut self, file: CompletedFile) -> Vec<Action> {
        self.log.success(format!(
            "File received from {}: {} ({} KB)",
            file.from_peer_id,
            file.name,
            kib(file.size)
        ));
        let file_id = file.id.clone();
        self.completed.push_front(file);
        vec![Action::FileReceived { file_id }]
    }

    /// Broadcast a file to every open session: ordered chunks, then the completion signal.
    pub fn send_file(&mut self, file: OutgoingFile) -> Vec<Action> {
        if !self.kernel_ready {
            self.log.error("Kernel not ready. Cannot send file.");
            return vec![];
        }
        let peers = self.registry.open_peers();
        if peers.is_empty() {
            self.log.warning("No active connections to send file.");
            return vec![];
        }
        let file_id = transfer::new_transfer_id(&self.identity.id, crate::now_millis());
        self.log.info(format!(
            "Transmitting {} to {} peer(s)...",
            file.name,
            peers.len()
        ));

        let mut frames = Vec::new();
        for packet in transfer::file_packets(&file, &file_id) {
            match wire::encode_frame(&packet) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    self.log
                        .error(format!("Failed to encode {}: {}", file.name, e));
                    return vec![];
                }
            }
        }
        let mut actions = Vec::with_capacity(frames.len() * peers.len());
        for (_, handle) in &peers {
            for frame in &frames {
                actions.push(Action::Send {
                    handle: *handle,
                    frame: frame.clone(),
                });
            }
        }
        self.log.success(format!(
            "File dispatch complete: {} ({} KB)",
            file.name,
            kib(file.size())
        ));
        actions
    }

    /// Record a local chat line and broadcast it to every open session.
    pub fn send_chat(&mut self, text: &str) -> Vec<Action> {
        if !self.kernel_ready {
            self.log.error("Kernel not ready. Cannot send chat.");
            return vec![];
        }
        let trimmed = text.trim();
        if trimmed.is_empty() {
            self.log.warning("Chat message cannot be empty.");
            return vec![];
        }
        let created_at = crate::now_millis();
        let me = self.identity.id.clone();
        self.chat.push(ChatMessage::new(
            &me,
            me.clone(),
            trimmed.to_string(),
            created_at,
        ));
        let packet = Packet::Chat {
            text: trimmed.to_string(),
            from_peer_id: me,
            created_at,
        };
        let frame = match wire::encode_frame(&packet) {
            Ok(f) => f,
            Err(e) => {
                self.log.error(format!("Failed to encode chat: {}", e));
                return vec![];
            }
        };
        let actions = self
            .registry
            .open_peers()
            .into_iter()
            .map(|(_, handle)| Action::Send {
                handle,
                frame: frame.clone(),
            })
            .collect();
        self.log.info(format!("Chat broadcast: {}", trimmed));
        actions
    }

    /// Tear down every session.
    pub fn shutdown(&mut self) -> Vec<Action> {
        self.registry
            .drain()
            .into_iter()
            .map(|handle| Action::Close { handle })
            .collect()
    }
}

fn kib(bytes: u64) -> u64 {
    (bytes + 512) / 1024
}
