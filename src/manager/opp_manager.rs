// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide session manager.
//!
//! Owns the session lifecycle: listen on both carrier sockets, attach
//! whichever link arrives first (or an outbound connect), run exactly one
//! session, then return to listening. All protocol work happens on one task;
//! the public API and the platform glue post messages into it.

use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::sleep_until,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    session::{
        engine::{Session, SessionDeps},
        events::EventSink,
        file_sink::{FileStore, MountLockBroker},
        file_source::{MimeResolver, SourceObject},
    },
    transport::{LinkKind, ListenerGuard, Platform, Transport},
};

/// Failures surfaced by the public control API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OppError {
    #[error("no available resource")]
    NoAvailableResource,

    #[error("already connected to this device")]
    AlreadyConnected,

    #[error("reached the connection limit")]
    ReachedConnectionLimit,

    #[error("service channel not found")]
    ServiceChannelNotFound,

    #[error("socket connection error: {0}")]
    SocketConnectionError(String),

    #[error("manager is gone")]
    ManagerGone,
}

/// Everything the manager borrows from its host.
pub struct OppDeps {
    pub config: Config,
    pub platform: Arc<dyn Platform>,
    pub events: Arc<dyn EventSink>,
    pub store: Arc<dyn FileStore>,
    pub locks: Arc<dyn MountLockBroker>,
    pub mime: Arc<dyn MimeResolver>,
}

/// Control requests from the public API.
pub enum Command {
    Connect {
        address: String,
        reply: oneshot::Sender<Result<(), OppError>>,
    },
    Disconnect,
    SendFile {
        address: String,
        object: Box<dyn SourceObject>,
        reply: oneshot::Sender<bool>,
    },
    StopSending { reply: oneshot::Sender<bool> },
    Confirm {
        accept: bool,
        reply: oneshot::Sender<bool>,
    },
    IsConnected { reply: oneshot::Sender<bool> },
    Address { reply: oneshot::Sender<Option<String>> },
    Shutdown,
}

/// Stimulus from the platform glue and the reader worker.
pub enum Input {
    Accepted {
        kind: LinkKind,
        address: String,
        link: Box<dyn Transport>,
    },
    Connected {
        address: String,
        link: Box<dyn Transport>,
    },
    ConnectFailed { address: String, error: String },
    Message { link: u64, data: Bytes },
    SocketError { link: u64, error: String },
    SocketClosed { link: u64 },
    ServiceChannel { address: String, channel: i32 },
    SdpUpdated { address: String },
    Chunk(io::Result<Bytes>),
}

/// Posts platform callbacks onto the protocol task. Clone freely; every
/// socket pump and resolver keeps one.
#[derive(Clone)]
pub struct OppMailbox {
    tx: mpsc::UnboundedSender<Input>,
}

impl OppMailbox {
    pub fn accepted(&self, kind: LinkKind, address: String, link: Box<dyn Transport>) {
        let _ = self.tx.send(Input::Accepted { kind, address, link });
    }

    pub fn connected(&self, address: String, link: Box<dyn Transport>) {
        let _ = self.tx.send(Input::Connected { address, link });
    }

    pub fn connect_failed(&self, address: String, error: String) {
        let _ = self.tx.send(Input::ConnectFailed { address, error });
    }

    pub fn socket_message(&self, link: u64, data: Bytes) {
        let _ = self.tx.send(Input::Message { link, data });
    }

    pub fn socket_error(&self, link: u64, error: String) {
        let _ = self.tx.send(Input::SocketError { link, error });
    }

    pub fn socket_closed(&self, link: u64) {
        let _ = self.tx.send(Input::SocketClosed { link });
    }

    pub fn service_channel(&self, address: String, channel: i32) {
        let _ = self.tx.send(Input::ServiceChannel { address, channel });
    }

    pub fn sdp_updated(&self, address: String) {
        let _ = self.tx.send(Input::SdpUpdated { address });
    }
}

/// Cloneable handle over the manager task; the public control API.
#[derive(Clone)]
pub struct OppHandle {
    tx: mpsc::UnboundedSender<Command>,
    mailbox: OppMailbox,
}

impl OppHandle {
    /// Mailbox for wiring additional platform glue to this manager.
    pub fn mailbox(&self) -> OppMailbox {
        self.mailbox.clone()
    }

    pub async fn connect(&self, address: &str) -> Result<(), OppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Connect { address: address.to_owned(), reply })
            .map_err(|_| OppError::ManagerGone)?;
        rx.await.map_err(|_| OppError::ManagerGone)?
    }

    pub fn disconnect(&self) {
        let _ = self.tx.send(Command::Disconnect);
    }

    /// Queue `object` for `address`. Starts a session when idle, appends when
    /// already pushing to the same peer, refuses any other peer.
    pub async fn send_file(&self, address: &str, object: Box<dyn SourceObject>) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::SendFile { address: address.to_owned(), object, reply })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn stop_sending_file(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::StopSending { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn confirm_receiving_file(&self, accept: bool) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Confirm { accept, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn is_connected(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::IsConnected { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn get_address(&self) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Address { reply }).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Stop accepting work and tear the active session down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

struct PendingConnect {
    address: String,
    needs_sdp_update: bool,
    reply: Option<oneshot::Sender<Result<(), OppError>>>,
    queue: Vec<Box<dyn SourceObject>>,
}

pub struct OppManager {
    deps: OppDeps,
    tx_input: mpsc::UnboundedSender<Input>,
    shutdown: CancellationToken,

    rfcomm: Option<Box<dyn ListenerGuard>>,
    l2cap: Option<Box<dyn ListenerGuard>>,
    session: Option<Session>,
    session_link: u64,
    pending: Option<PendingConnect>,
}

impl OppManager {
    /// Spawn a manager task and return its handle. Starts listening
    /// immediately.
    pub fn spawn(deps: OppDeps) -> OppHandle {
        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let (tx_input, rx_input) = mpsc::unbounded_channel();
        let mailbox = OppMailbox { tx: tx_input.clone() };

        let mut manager = Self {
            deps,
            tx_input,
            shutdown: CancellationToken::new(),
            rfcomm: None,
            l2cap: None,
            session: None,
            session_link: 0,
            pending: None,
        };
        manager.listen();
        tokio::spawn(manager.run(rx_cmd, rx_input));

        OppHandle { tx: tx_cmd, mailbox }
    }

    async fn run(
        mut self,
        mut rx_cmd: mpsc::UnboundedReceiver<Command>,
        mut rx_input: mpsc::UnboundedReceiver<Input>,
    ) {
        loop {
            let grace = self.session.as_ref().and_then(|s| s.grace_deadline());
            let shutdown = self.shutdown.clone();

            select! {
                _ = shutdown.cancelled() => break,
                cmd = rx_cmd.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                input = rx_input.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => break,
                },
                _ = sleep_until(grace.unwrap_or_else(tokio::time::Instant::now)),
                    if grace.is_some() =>
                {
                    self.handle_grace_elapsed();
                },
            }
        }

        if let Some(session) = self.session.as_mut() {
            session.close_link();
            session.on_transport_gone();
        }
        self.session = None;
        self.rfcomm = None;
        self.l2cap = None;
        debug!("manager task finished");
    }

    fn mailbox(&self) -> OppMailbox {
        OppMailbox { tx: self.tx_input.clone() }
    }

    /// Open both listening sockets. One active session at a time, so this is
    /// a no-op while a transport is attached.
    fn listen(&mut self) {
        if self.session.is_some() {
            warn!("transport attached, not listening");
            return;
        }

        if self.rfcomm.is_none() {
            match self.deps.platform.listen(LinkKind::Rfcomm, self.mailbox()) {
                Ok(guard) => self.rfcomm = Some(guard),
                Err(e) => {
                    warn!("failed to listen on the RFCOMM carrier: {e}");
                    return;
                },
            }
        }
        if self.l2cap.is_none() {
            match self.deps.platform.listen(LinkKind::L2cap, self.mailbox()) {
                Ok(guard) => self.l2cap = Some(guard),
                Err(e) => {
                    warn!("failed to listen on the L2CAP carrier: {e}");
                    self.rfcomm = None;
                },
            }
        }
    }

    fn stop_listening(&mut self) {
        self.rfcomm = None;
        self.l2cap = None;
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { address, reply } => {
                match self.start_connect(address) {
                    // Resolved when the transport attaches or the connect
                    // fails, like the platform's reply runnable.
                    Ok(()) => {
                        if let Some(pending) = self.pending.as_mut() {
                            pending.reply = Some(reply);
                        }
                    },
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    },
                }
            },
            Command::Disconnect => {
                if let Some(session) = &self.session {
                    session.close_link();
                }
            },
            Command::SendFile { address, object, reply } => {
                let _ = reply.send(self.send_file(address, object));
            },
            Command::StopSending { reply } => {
                let stopped = match self.session.as_mut() {
                    Some(session) => {
                        session.stop_sending();
                        true
                    },
                    None => false,
                };
                let _ = reply.send(stopped);
            },
            Command::Confirm { accept, reply } => {
                let confirmed = self
                    .session
                    .as_mut()
                    .map(|s| s.confirm_receiving(accept))
                    .unwrap_or(false);
                let _ = reply.send(confirmed);
            },
            Command::IsConnected { reply } => {
                let _ =
                    reply.send(self.session.as_ref().is_some_and(Session::is_connected));
            },
            Command::Address { reply } => {
                let _ = reply
                    .send(self.session.as_ref().map(|s| s.peer_address().to_owned()));
            },
            Command::Shutdown => self.shutdown.cancel(),
        }
    }

    /// Begin an outbound session: stop listening and resolve the peer's
    /// channel; the rest happens when the resolver posts back.
    fn start_connect(&mut self, address: String) -> Result<(), OppError> {
        if IN_SHUTDOWN.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return Err(OppError::NoAvailableResource);
        }
        if let Some(session) = &self.session {
            return Err(if session.peer_address() == address {
                OppError::AlreadyConnected
            } else {
                OppError::ReachedConnectionLimit
            });
        }
        if self.pending.is_some() {
            return Err(OppError::ReachedConnectionLimit);
        }

        self.stop_listening();
        self.pending = Some(PendingConnect {
            address: address.clone(),
            needs_sdp_update: true,
            reply: None,
            queue: Vec::new(),
        });

        if self
            .deps
            .platform
            .get_service_channel(&address, self.mailbox())
            .is_err()
        {
            self.pending = None;
            self.listen();
            return Err(OppError::ServiceChannelNotFound);
        }

        Ok(())
    }

    fn send_file(&mut self, address: String, object: Box<dyn SourceObject>) -> bool {
        if let Some(session) = self.session.as_mut() {
            if !session.accepts_appends_for(&address) {
                return false;
            }
            session.append_outbound(object);
            return true;
        }

        if let Some(pending) = self.pending.as_mut() {
            if pending.address != address {
                return false;
            }
            pending.queue.push(object);
            return true;
        }

        // The Length header cannot describe anything larger.
        if object.size() > u32::MAX as u64 {
            warn!("refusing to queue an object of {} bytes", object.size());
            return false;
        }

        match self.start_connect(address) {
            Ok(()) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.queue.push(object);
                }
                true
            },
            Err(e) => {
                warn!("failed to start an outbound session: {e}");
                false
            },
        }
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Accepted { kind, address, link } => {
                if self.session.is_some() || self.pending.is_some() {
                    debug!("busy, refusing an inbound link from {address}");
                    link.close();
                    return;
                }
                debug!("accepted {kind:?} link from {address}");
                self.stop_listening();
                self.attach(link, address);
            },
            Input::Connected { address, link } => self.outbound_connected(address, link),
            Input::ConnectFailed { address, error } => {
                if self.pending.as_ref().is_some_and(|p| p.address == address) {
                    self.fail_pending(OppError::SocketConnectionError(error));
                }
            },
            Input::Message { link, data } => {
                if link != self.session_link {
                    return;
                }
                if let Some(session) = self.session.as_mut()
                    && let Err(e) = session.on_message(&data)
                {
                    warn!("session failed on delivery: {e}");
                    self.transport_failed();
                }
            },
            Input::SocketError { link, error } => {
                if link == self.session_link && self.session.is_some() {
                    warn!("transport error: {error}");
                    self.transport_failed();
                }
            },
            Input::SocketClosed { link } => {
                if link == self.session_link && self.session.is_some() {
                    self.transport_failed();
                }
            },
            Input::ServiceChannel { address, channel } => {
                self.service_channel_resolved(address, channel);
            },
            Input::SdpUpdated { address } => {
                if self.pending.as_ref().is_some_and(|p| p.address == address)
                    && self
                        .deps
                        .platform
                        .get_service_channel(&address, self.mailbox())
                        .is_err()
                {
                    self.fail_pending(OppError::ServiceChannelNotFound);
                }
            },
            Input::Chunk(res) => {
                if let Some(session) = self.session.as_mut()
                    && let Err(e) = session.on_chunk(res)
                {
                    warn!("session failed on body chunk: {e}");
                    self.transport_failed();
                }
            },
        }
    }

    /// A negative channel gets one SDP refresh before giving up.
    fn service_channel_resolved(&mut self, address: String, channel: i32) {
        let Some(pending) = self.pending.as_mut() else { return };
        if pending.address != address {
            return;
        }

        if channel < 0 {
            if pending.needs_sdp_update {
                pending.needs_sdp_update = false;
                if self
                    .deps
                    .platform
                    .update_sdp_records(&address, self.mailbox())
                    .is_err()
                {
                    self.fail_pending(OppError::ServiceChannelNotFound);
                }
            } else {
                self.fail_pending(OppError::ServiceChannelNotFound);
            }
            return;
        }

        if self
            .deps
            .platform
            .connect(&address, channel, self.mailbox())
            .is_err()
        {
            self.fail_pending(OppError::SocketConnectionError(
                "failed to start the connection".to_owned(),
            ));
        }
    }

    fn outbound_connected(&mut self, address: String, link: Box<dyn Transport>) {
        let Some(pending) = self.pending.take() else {
            debug!("unexpected outbound link to {address}, closing");
            link.close();
            return;
        };

        self.attach(link, address);
        if let Some(reply) = pending.reply {
            let _ = reply.send(Ok(()));
        }

        let start_push = !pending.queue.is_empty();
        if let Some(session) = self.session.as_mut() {
            for object in pending.queue {
                session.append_outbound(object);
            }
            // append_outbound needs the client role latched first.
            if start_push && let Err(e) = session.start_sending_next() {
                warn!("failed to start pushing: {e}");
                session.close_link();
            }
        }
    }

    fn attach(&mut self, link: Box<dyn Transport>, address: String) {
        self.session_link = link.id();

        let tx = self.tx_input.clone();
        let deps = SessionDeps {
            events: self.deps.events.clone(),
            store: self.deps.store.clone(),
            locks: self.deps.locks.clone(),
            mime: self.deps.mime.clone(),
            chunk_post: Arc::new(move |res| {
                let _ = tx.send(Input::Chunk(res));
            }),
            grace: Duration::from_millis(self.deps.config.connection.disconnect_grace_ms),
        };
        self.session = Some(Session::new(link, address, deps));
    }

    fn fail_pending(&mut self, error: OppError) {
        if let Some(pending) = self.pending.take() {
            warn!("outbound session to {} failed: {error}", pending.address);
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(error));
            }
        }
        self.listen();
    }

    /// The link died or the session gave up on it: finish bookkeeping,
    /// destroy the session and go back to listening.
    fn transport_failed(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close_link();
            session.on_transport_gone();
        }
        self.session_link = 0;
        self.listen();
    }

    fn handle_grace_elapsed(&mut self) {
        if let Some(session) = self.session.as_mut() {
            debug!("peer kept the transport open after DISCONNECT, closing it");
            session.clear_grace_deadline();
            session.close_link();
        }
    }
}

static MANAGER: Lazy<Mutex<Option<OppHandle>>> = Lazy::new(|| Mutex::new(None));
static IN_SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Process-wide manager access: returns the live handle or spawns one.
/// Refused after [`shutdown`].
pub fn get(deps: OppDeps) -> Result<OppHandle, OppError> {
    if IN_SHUTDOWN.load(Ordering::SeqCst) {
        return Err(OppError::NoAvailableResource);
    }
    let mut slot = MANAGER.lock().map_err(|_| OppError::NoAvailableResource)?;
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = OppManager::spawn(deps);
    *slot = Some(handle.clone());
    Ok(handle)
}

/// Flip the shutdown latch, tear down the active session and release the
/// process-wide handle. Later `get` and `connect` calls are refused.
pub fn shutdown() {
    IN_SHUTDOWN.store(true, Ordering::SeqCst);
    if let Ok(mut slot) = MANAGER.lock()
        && let Some(handle) = slot.take()
    {
        handle.shutdown();
    }
}

/// Re-arm the process-wide slot; test support.
#[doc(hidden)]
pub fn reset_for_tests() {
    IN_SHUTDOWN.store(false, Ordering::SeqCst);
    if let Ok(mut slot) = MANAGER.lock() {
        *slot = None;
    }
}
