// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The OPP session state machine.
//!
//! A session is created when a transport attaches and destroyed when it
//! detaches. Its role is latched once: the first CONNECT received makes it a
//! server, the first `send_file` makes it a client. All handlers run on the
//! protocol task; the only other thread involved is the reader worker, which
//! posts body chunks back through `SessionDeps::chunk_post`.

use std::{io, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::{
    models::{
        header::{HeaderSet, ObexHeader, append_header},
        opcode::{RequestCode, ResponseCode},
        packet::{ConnectFields, PUT_HEADER_OVERHEAD, frame},
    },
    session::{
        events::{EventSink, OppEvent},
        file_sink::{
            FileSink, FileStore, MOUNT_LOCK_VOLUME, MountLock, MountLockBroker,
            sanitize_file_name,
        },
        file_source::{MimeResolver, ReaderWorker, SourceObject, name_hint},
        queue::SendQueue,
        reassembly::{CompletePacket, Reassembler},
    },
    transport::Transport,
};

/// Progress events fire every time the processed count crosses another
/// multiple of this many bytes.
pub const UPDATE_PROGRESS_BASE: u64 = 50 * 1024;

/// Collaborators a session borrows from its host for its whole lifetime.
pub struct SessionDeps {
    pub events: Arc<dyn EventSink>,
    pub store: Arc<dyn FileStore>,
    pub locks: Arc<dyn MountLockBroker>,
    pub mime: Arc<dyn MimeResolver>,
    /// Posts reader-worker chunks back onto the protocol task.
    pub chunk_post: Arc<dyn Fn(io::Result<Bytes>) + Send + Sync>,
    /// How long to wait after a DISCONNECT reply before closing the
    /// transport ourselves.
    pub grace: Duration,
}

#[derive(Default)]
struct ServerState {
    awaiting_confirmation: bool,
    new_file: bool,
    /// Finality of the last completed PUT-class packet; a fresh PUT while
    /// this is set means a new object has begun.
    last_final: bool,
    /// Body segment of the packet held back while awaiting confirmation.
    body: Bytes,
    sink: Option<Box<dyn FileSink>>,
    mount_lock: Option<Box<dyn MountLock>>,
}

struct ClientState {
    last_command: u8,
    queue: SendQueue<Box<dyn SourceObject>>,
    reader: Option<ReaderWorker>,
    stream_opened: bool,
    waiting_put_final: bool,
}

impl ClientState {
    fn new() -> Self {
        Self {
            last_command: 0,
            queue: SendQueue::new(),
            reader: None,
            stream_opened: false,
            waiting_put_final: false,
        }
    }
}

enum Role {
    Server(ServerState),
    Client(ClientState),
}

pub struct Session {
    link: Box<dyn Transport>,
    peer_address: String,
    deps: SessionDeps,

    role: Role,
    connected: bool,
    remote_version: u8,
    remote_flags: u8,
    remote_max_packet: u16,

    reasm: Reassembler,

    file_name: String,
    content_type: String,
    file_length: u32,
    processed: u64,
    progress_tick: u32,

    success: bool,
    completion_emitted: bool,
    abort_requested: bool,

    grace_deadline: Option<Instant>,
}

impl Session {
    pub fn new(link: Box<dyn Transport>, peer_address: String, deps: SessionDeps) -> Self {
        Self {
            link,
            peer_address,
            deps,
            role: Role::Server(ServerState::default()),
            connected: false,
            remote_version: 0,
            remote_flags: 0,
            remote_max_packet: 0,
            reasm: Reassembler::new(),
            file_name: String::new(),
            content_type: String::new(),
            file_length: 0,
            processed: 0,
            progress_tick: 1,
            success: false,
            completion_emitted: false,
            abort_requested: false,
            grace_deadline: None,
        }
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Connected and still mid-transfer: once the completion event has gone
    /// out the session only lingers for teardown.
    pub fn is_connected(&self) -> bool {
        self.connected && !self.completion_emitted
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        self.grace_deadline
    }

    pub fn clear_grace_deadline(&mut self) {
        self.grace_deadline = None;
    }

    pub fn close_link(&self) {
        self.link.close();
    }

    /// An object may be appended behind the cursor of an active push.
    pub fn accepts_appends_for(&self, address: &str) -> bool {
        match &self.role {
            Role::Client(cli) => cli.queue.is_active() && self.peer_address == address,
            Role::Server(_) => false,
        }
    }

    /// Queue one more object; the cursor picks it up after the current one.
    /// The first append latches the client role on a pristine session.
    pub fn append_outbound(&mut self, object: Box<dyn SourceObject>) {
        if matches!(self.role, Role::Server(_)) && !self.connected {
            self.role = Role::Client(ClientState::new());
        }
        if let Role::Client(cli) = &mut self.role {
            cli.queue.append(object);
        } else {
            warn!("dropping an outbound object queued on a receiving session");
        }
    }

    /// Request an abort at the next reply boundary.
    pub fn stop_sending(&mut self) {
        self.abort_requested = true;
    }

    // --- inbound dispatch ---

    /// Feed one transport delivery through reassembly and dispatch every
    /// completed packet.
    pub fn on_message(&mut self, data: &[u8]) -> Result<()> {
        let completed = match self.reasm.push(data) {
            Ok(done) => done,
            Err(e) => {
                warn!("malformed OBEX delivery: {e}");
                self.reasm.reset();
                self.reply_error(ResponseCode::BadRequest)?;
                return Ok(());
            },
        };

        for pkt in completed {
            if matches!(self.role, Role::Server(_)) {
                self.server_handle(pkt)?;
            } else {
                self.client_handle(pkt)?;
            }
        }
        Ok(())
    }

    // --- server role ---

    fn server_handle(&mut self, pkt: CompletePacket) -> Result<()> {
        match RequestCode::from_u8(pkt.opcode) {
            Some(RequestCode::Connect) => self.server_on_connect(&pkt.packet),
            Some(RequestCode::Put) | Some(RequestCode::PutFinal) => {
                self.server_on_put(&pkt)
            },
            Some(RequestCode::Abort) => {
                self.reply_simple(ResponseCode::Success)?;
                self.delete_received_file();
                Ok(())
            },
            Some(RequestCode::Disconnect) => {
                self.reply_simple(ResponseCode::Success)?;
                self.quiesce();
                self.file_transfer_complete();
                Ok(())
            },
            Some(RequestCode::Get)
            | Some(RequestCode::GetFinal)
            | Some(RequestCode::SetPath) => {
                warn!("unsupported OBEX request 0x{:02x}", pkt.opcode);
                self.reply_error(ResponseCode::BadRequest)
            },
            _ => {
                warn!("unrecognized OBEX request 0x{:02x}", pkt.opcode);
                self.reply_error(ResponseCode::NotImplemented)
            },
        }
    }

    fn server_on_connect(&mut self, packet: &[u8]) -> Result<()> {
        if self.connected {
            debug!("CONNECT while connected, ignored");
            return Ok(());
        }

        let fields = match ConnectFields::parse(&packet[3..]) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("malformed CONNECT: {e}");
                return self.reply_error(ResponseCode::BadRequest);
            },
        };
        self.remote_version = fields.version;
        self.remote_flags = fields.flags;
        self.remote_max_packet = fields.max_packet.get();
        debug!(
            "peer OBEX 0x{:02x}, flags 0x{:02x}, max packet {}",
            self.remote_version, self.remote_flags, self.remote_max_packet
        );

        let local = ConnectFields::local();
        self.send_packet(ResponseCode::Success as u8, local.as_bytes())?;
        self.after_connected();
        Ok(())
    }

    fn server_on_put(&mut self, pkt: &CompletePacket) -> Result<()> {
        let is_final = pkt.opcode == RequestCode::PutFinal as u8;

        // A PUT-class packet right after a PutFinal starts a new object.
        if matches!(&self.role, Role::Server(srv) if srv.last_final) {
            if let Role::Server(srv) = &mut self.role {
                srv.new_file = true;
            }
            self.reset_per_file();
        }
        if let Role::Server(srv) = &mut self.role {
            srv.last_final = is_final;
        }

        let headers = match HeaderSet::parse(&pkt.packet[3..]) {
            Ok(headers) => headers,
            Err(e) => {
                warn!("malformed PUT headers: {e}");
                return self.reply_error(ResponseCode::BadRequest);
            },
        };

        if let Some(name) = headers.name() {
            self.file_name = sanitize_file_name(name);
        }
        if let Some(content_type) = headers.content_type() {
            self.content_type = content_type.to_owned();
        }
        if let Some(length) = headers.length() {
            self.file_length = length;
        }
        let body = headers.body().cloned().unwrap_or_default();
        if let Role::Server(srv) = &mut self.role {
            srv.body = body.clone();
        }

        if self.abort_requested {
            self.reply_to_put(is_final, false)?;
            self.processed += body.len() as u64;
            self.delete_received_file();
            self.file_transfer_complete();
            return Ok(());
        }

        if self.server_awaiting_confirmation() {
            // The reply is deferred until the confirmation callback runs.
            self.deps.events.emit(OppEvent::ReceivingFileConfirmation {
                address: self.peer_address.clone(),
                file_name: self.file_name.clone(),
                file_length: self.file_length as u64,
                content_type: self.content_type.clone(),
            });
            self.processed += body.len() as u64;
            return Ok(());
        }

        if self.server_new_file() {
            self.start_file_transfer();
            if !self.create_received_file() {
                return self.reply_to_put(is_final, false);
            }
            if let Role::Server(srv) = &mut self.role {
                srv.new_file = false;
            }
        }

        if !self.write_received(&body) {
            return self.reply_to_put(is_final, false);
        }

        self.reply_to_put(is_final, true)?;
        self.processed += body.len() as u64;
        self.maybe_update_progress();

        if is_final {
            self.finish_inbound();
        }
        Ok(())
    }

    /// Host decision for the deferred first PUT. Legal only while a
    /// confirmation is pending and no partial packet is buffered.
    pub fn confirm_receiving(&mut self, accept: bool) -> bool {
        if !self.connected || !self.server_awaiting_confirmation() || !self.reasm.is_idle()
        {
            return false;
        }
        let (body, is_final) = match &mut self.role {
            Role::Server(srv) => {
                srv.awaiting_confirmation = false;
                (srv.body.clone(), srv.last_final)
            },
            Role::Client(_) => return false,
        };

        let mut ok = false;
        if accept {
            self.start_file_transfer();
            if self.create_received_file() {
                ok = self.write_received(&body);
            }
        }

        if ok && is_final {
            self.finish_inbound();
        }
        if let Err(e) = self.reply_to_put(is_final, ok) {
            warn!("failed to reply after confirmation: {e}");
        }
        true
    }

    fn server_awaiting_confirmation(&self) -> bool {
        matches!(&self.role, Role::Server(srv) if srv.awaiting_confirmation)
    }

    fn server_new_file(&self) -> bool {
        matches!(&self.role, Role::Server(srv) if srv.new_file)
    }

    /// Create the sink; the unique leaf name it picked replaces the peer's
    /// name locally (the peer is never told).
    fn create_received_file(&mut self) -> bool {
        let sink = match self.deps.store.create_unique(&self.file_name) {
            Ok(sink) => sink,
            Err(e) => {
                warn!("failed to create {:?}: {e}", self.file_name);
                return false;
            },
        };
        self.file_name = sink.file_name().to_owned();
        if let Role::Server(srv) = &mut self.role {
            srv.sink = Some(sink);
        }
        true
    }

    fn write_received(&mut self, body: &[u8]) -> bool {
        let Role::Server(srv) = &mut self.role else { return false };
        let Some(sink) = srv.sink.as_mut() else {
            warn!("no open sink for received body");
            return false;
        };
        if let Err(e) = sink.append(body) {
            warn!("failed to write received body: {e}");
            return false;
        }
        true
    }

    /// PutFinal landed: the object is complete on disk.
    fn finish_inbound(&mut self) {
        self.success = true;
        self.file_transfer_complete();

        let Role::Server(srv) = &mut self.role else { return };
        if let Some(mut sink) = srv.sink.take() {
            if let Err(e) = sink.finalize() {
                warn!("failed to finalize received file: {e}");
                return;
            }
            self.deps.events.emit(OppEvent::FileWatcherNotify {
                data: "modified".to_owned(),
                path: sink.path().to_path_buf(),
            });
        }
    }

    fn delete_received_file(&mut self) {
        if let Role::Server(srv) = &mut self.role
            && let Some(mut sink) = srv.sink.take()
            && let Err(e) = sink.discard()
        {
            warn!("failed to remove partial file: {e}");
        }
    }

    // --- client role ---

    /// Latch the client role if needed, advance the queue and announce the
    /// next object: CONNECT for the first push on this transport, a PUT
    /// header directly otherwise.
    pub fn start_sending_next(&mut self) -> Result<()> {
        if matches!(self.role, Role::Server(_)) {
            self.role = Role::Client(ClientState::new());
        }

        let (size, mime, hint) = {
            let Role::Client(cli) = &mut self.role else { unreachable!() };
            let object = cli.queue.advance().context("send queue is exhausted")?;
            (
                object.size(),
                object.mime_type(),
                name_hint(object.as_ref(), self.deps.mime.as_ref()),
            )
        };

        // The OBEX Length header is 4 bytes; larger objects cannot be
        // described on the wire.
        if size > u32::MAX as u64 {
            warn!("object of {size} bytes exceeds the OBEX length header");
            self.send_disconnect()?;
            anyhow::bail!("object too large for OBEX: {size} bytes");
        }

        self.file_name = hint;
        self.content_type = mime;
        self.file_length = size as u32;

        self.start_file_transfer();

        if !self.connected {
            self.send_connect()
        } else {
            self.send_put_header()?;
            self.reset_per_file();
            Ok(())
        }
    }

    fn client_handle(&mut self, pkt: CompletePacket) -> Result<()> {
        let last_command = match &self.role {
            Role::Client(cli) => cli.last_command,
            Role::Server(_) => return Ok(()),
        };

        let expected = if last_command == RequestCode::Put as u8 {
            ResponseCode::Continue as u8
        } else {
            ResponseCode::Success as u8
        };

        if pkt.opcode != expected {
            if last_command == RequestCode::Put as u8
                || last_command == RequestCode::PutFinal as u8
                || last_command == RequestCode::Abort as u8
            {
                self.send_disconnect()?;
            }
            warn!(
                "request 0x{last_command:02x} failed with reply 0x{:02x}",
                pkt.opcode
            );
            self.file_transfer_complete();
            return Ok(());
        }

        match RequestCode::from_u8(last_command) {
            Some(RequestCode::Connect) => self.client_on_connected(&pkt.packet),
            Some(RequestCode::Put) => self.client_on_put_reply(),
            Some(RequestCode::PutFinal) => self.client_on_put_final_reply(),
            Some(RequestCode::Abort) => {
                self.send_disconnect()?;
                self.file_transfer_complete();
                Ok(())
            },
            Some(RequestCode::Disconnect) => {
                self.quiesce();
                // Most peers close the socket right after the reply; if this
                // one has not within the grace period, close it locally.
                self.grace_deadline = Some(Instant::now() + self.deps.grace);
                Ok(())
            },
            _ => {
                warn!("reply for unhandled request 0x{last_command:02x}");
                Ok(())
            },
        }
    }

    fn client_on_connected(&mut self, packet: &[u8]) -> Result<()> {
        let (version, flags, max_packet) = match ConnectFields::parse(&packet[3..]) {
            Ok(fields) => (fields.version, fields.flags, fields.max_packet.get()),
            Err(e) => {
                warn!("malformed CONNECT reply: {e}");
                self.send_disconnect()?;
                self.file_transfer_complete();
                return Ok(());
            },
        };

        self.after_connected();
        self.remote_version = version;
        self.remote_flags = flags;
        self.remote_max_packet = max_packet;
        debug!(
            "peer OBEX 0x{:02x}, flags 0x{:02x}, max packet {}",
            self.remote_version, self.remote_flags, self.remote_max_packet
        );

        self.send_put_header()
    }

    fn client_on_put_reply(&mut self) -> Result<()> {
        let (waiting_final, stream_opened) = match &self.role {
            Role::Client(cli) => (cli.waiting_put_final, cli.stream_opened),
            Role::Server(_) => return Ok(()),
        };

        if waiting_final {
            return self.send_put_final();
        }
        if self.abort_requested {
            return self.send_abort();
        }

        self.maybe_update_progress();

        if self.remote_max_packet as usize <= PUT_HEADER_OVERHEAD {
            warn!(
                "peer max packet {} leaves no room for a body",
                self.remote_max_packet
            );
            return self.send_disconnect();
        }
        let max = self.remote_max_packet as usize - PUT_HEADER_OVERHEAD;

        if !stream_opened {
            let stream = {
                let Role::Client(cli) = &self.role else { return Ok(()) };
                match cli.queue.current() {
                    Some(object) => object.open(),
                    None => {
                        warn!("no current object to read from");
                        return self.send_disconnect();
                    },
                }
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to open object stream: {e}");
                    return self.send_disconnect();
                },
            };

            let post = self.deps.chunk_post.clone();
            let Role::Client(cli) = &mut self.role else { return Ok(()) };
            let reader = cli
                .reader
                .get_or_insert_with(|| ReaderWorker::spawn(move |res| post(res)));
            if reader.open(stream).is_err() {
                return self.send_disconnect();
            }
            cli.stream_opened = true;
        }

        let Role::Client(cli) = &self.role else { return Ok(()) };
        let Some(reader) = cli.reader.as_ref() else { return Ok(()) };
        if reader.request(max).is_err() {
            return self.send_disconnect();
        }
        Ok(())
    }

    fn client_on_put_final_reply(&mut self) -> Result<()> {
        self.success = true;
        self.file_transfer_complete();

        let has_next = {
            let Role::Client(cli) = &mut self.role else { return Ok(()) };
            if let Some(reader) = cli.reader.as_ref() {
                reader.close_stream();
            }
            cli.stream_opened = false;
            cli.queue.has_next()
        };

        if has_next {
            self.start_sending_next()
        } else {
            self.send_disconnect()
        }
    }

    /// A chunk came back from the reader worker.
    pub fn on_chunk(&mut self, res: io::Result<Bytes>) -> Result<()> {
        if !matches!(self.role, Role::Client(_)) {
            return Ok(());
        }

        let chunk = match res {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("failed to read object body: {e}");
                return self.send_disconnect();
            },
        };

        if chunk.is_empty() {
            // The stream dried up short of its declared length.
            warn!(
                "object stream ended at {} of {} bytes",
                self.processed, self.file_length
            );
            return self.send_disconnect();
        }

        if self.processed + chunk.len() as u64 >= self.file_length as u64
            && let Role::Client(cli) = &mut self.role
        {
            cli.waiting_put_final = true;
        }

        self.send_put_body(&chunk)
    }

    // --- outbound framing ---

    fn send_connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let local = ConnectFields::local();
        self.send_packet(RequestCode::Connect as u8, local.as_bytes())
    }

    fn send_put_header(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        let mut payload = BytesMut::new();
        append_header(&mut payload, &ObexHeader::Name(self.file_name.clone()))?;
        append_header(&mut payload, &ObexHeader::Length(self.file_length))?;
        self.send_packet(RequestCode::Put as u8, &payload)
    }

    fn send_put_body(&mut self, body: &[u8]) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        if body.len() + PUT_HEADER_OVERHEAD > self.remote_max_packet as usize {
            warn!(
                "body of {} bytes does not fit the peer's max packet {}",
                body.len(),
                self.remote_max_packet
            );
            return Ok(());
        }
        let mut payload = BytesMut::new();
        append_header(&mut payload, &ObexHeader::Body(Bytes::copy_from_slice(body)))?;
        self.send_packet(RequestCode::Put as u8, &payload)?;
        self.processed += body.len() as u64;
        Ok(())
    }

    /// A PutFinal carries a single zero-length End-of-Body header.
    fn send_put_final(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        let mut payload = BytesMut::new();
        append_header(&mut payload, &ObexHeader::EndOfBody(Bytes::new()))?;
        self.send_packet(RequestCode::PutFinal as u8, &payload)?;
        if let Role::Client(cli) = &mut self.role {
            cli.waiting_put_final = false;
        }
        Ok(())
    }

    fn send_disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.send_packet(RequestCode::Disconnect as u8, &[])
    }

    fn send_abort(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.send_packet(RequestCode::Abort as u8, &[])
    }

    fn reply_to_put(&mut self, is_final: bool, ok: bool) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        let code = if ok {
            if is_final { ResponseCode::Success as u8 } else { ResponseCode::Continue as u8 }
        } else {
            ResponseCode::Unauthorized.with_final(is_final)
        };
        self.send_packet(code, &[])
    }

    fn reply_simple(&mut self, code: ResponseCode) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.send_packet(code as u8, &[])
    }

    /// Error replies go out even before CONNECT completes, so a peer probing
    /// with garbage gets an answer instead of silence.
    fn reply_error(&mut self, code: ResponseCode) -> Result<()> {
        self.send_packet(code as u8, &[])
    }

    fn send_packet(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let packet = frame(opcode, payload)?;
        debug!("SEND 0x{opcode:02x}, {} bytes", packet.len());
        if let Role::Client(cli) = &mut self.role {
            cli.last_command = opcode;
        }
        self.link.send(packet)
    }

    // --- shared bookkeeping ---

    fn after_connected(&mut self) {
        self.connected = true;
        self.abort_requested = false;
        self.reset_per_file();

        if let Role::Server(srv) = &mut self.role {
            srv.awaiting_confirmation = true;
            // Keep the removable volume mounted for the whole inbound
            // session; losing it mid-write corrupts the object.
            match self.deps.locks.acquire(MOUNT_LOCK_VOLUME) {
                Ok(lock) => srv.mount_lock = Some(lock),
                Err(e) => {
                    warn!("failed to acquire the mount lock: {e}");
                    self.link.close();
                },
            }
        }
    }

    /// Per-object counters, reset before the first PUT of every object.
    fn reset_per_file(&mut self) {
        self.processed = 0;
        self.progress_tick = 1;
        self.success = false;
        self.completion_emitted = false;
        match &mut self.role {
            Role::Server(srv) => {
                srv.last_final = false;
                srv.body = Bytes::new();
            },
            Role::Client(cli) => {
                cli.waiting_put_final = false;
                cli.stream_opened = false;
            },
        }
    }

    fn start_file_transfer(&mut self) {
        self.deps.events.emit(OppEvent::TransferStart {
            address: self.peer_address.clone(),
            received: matches!(self.role, Role::Server(_)),
            file_name: self.file_name.clone(),
            file_length: self.file_length as u64,
            content_type: self.content_type.clone(),
        });
    }

    fn maybe_update_progress(&mut self) {
        if self.processed > UPDATE_PROGRESS_BASE * self.progress_tick as u64 {
            self.deps.events.emit(OppEvent::UpdateProgress {
                address: self.peer_address.clone(),
                received: matches!(self.role, Role::Server(_)),
                processed_length: self.processed,
                file_length: self.file_length as u64,
            });
            self.progress_tick = (self.processed / UPDATE_PROGRESS_BASE) as u32 + 1;
        }
    }

    /// Emitted at most once per object; the gate survives teardown so a late
    /// socket close cannot produce a duplicate.
    fn file_transfer_complete(&mut self) {
        if self.completion_emitted {
            return;
        }
        self.deps.events.emit(OppEvent::TransferComplete {
            address: self.peer_address.clone(),
            success: self.success,
            received: matches!(self.role, Role::Server(_)),
            file_name: self.file_name.clone(),
            file_length: self.processed,
            content_type: self.content_type.clone(),
        });
        self.completion_emitted = true;
    }

    /// Release session I/O after an OBEX-level disconnect, in order: source
    /// stream, reader worker, inbound sink, mount lock. The peer address and
    /// the completion gate stay for the host's teardown.
    pub fn quiesce(&mut self) {
        self.connected = false;
        self.reasm.reset();

        match &mut self.role {
            Role::Client(cli) => {
                cli.last_command = 0;
                if let Some(reader) = cli.reader.as_ref() {
                    reader.close_stream();
                }
                cli.reader = None;
                cli.queue.clear();
            },
            Role::Server(srv) => {
                if let Some(mut sink) = srv.sink.take()
                    && let Err(e) = sink.finalize()
                {
                    warn!("failed to close received file: {e}");
                }
                srv.mount_lock = None;
            },
        }
        self.role = Role::Server(ServerState::default());
    }

    /// The transport dropped out from under the session.
    pub fn on_transport_gone(&mut self) {
        if !self.success {
            if matches!(self.role, Role::Server(_)) {
                self.delete_received_file();
            }
            self.file_transfer_complete();
        }
        self.quiesce();
    }
}
