// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reference carrier over TCP.
//!
//! Not a Bluetooth transport: it exists so the engine can be driven end to
//! end by the demo binary and the loopback tests. The RFCOMM-role listener
//! binds the configured port, the L2CAP-role listener the next one; the
//! "service channel" is a fixed placeholder since TCP needs no SDP.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    manager::OppMailbox,
    transport::{LinkKind, ListenerGuard, Platform, Transport, next_link_id},
};

/// TCP stand-in for the Bluetooth socket layer.
#[derive(Debug, Clone)]
pub struct TcpCarrier {
    bind_addr: String,
}

impl TcpCarrier {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self { bind_addr: bind_addr.into() }
    }

    fn addr_for(&self, kind: LinkKind) -> Result<String> {
        let (host, port) = self
            .bind_addr
            .rsplit_once(':')
            .context("bind address must be host:port")?;
        let port: u16 = port.parse().context("bind port is not a number")?;
        let port = match kind {
            LinkKind::Rfcomm => port,
            LinkKind::L2cap => port
                .checked_add(1)
                .context("no room for the second listening port")?,
        };
        Ok(format!("{host}:{port}"))
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl ListenerGuard for AbortOnDrop {}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Platform for TcpCarrier {
    fn listen(&self, kind: LinkKind, mailbox: OppMailbox) -> Result<Box<dyn ListenerGuard>> {
        let addr = self.addr_for(kind)?;
        let task = tokio::spawn(async move {
            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("failed to listen on {addr}: {e}");
                    return;
                },
            };
            debug!("listening on {addr} ({kind:?})");
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let link = spawn_stream_pump(stream, mailbox.clone());
                        mailbox.accepted(kind, peer.to_string(), link);
                    },
                    Err(e) => {
                        warn!("accept failed on {addr}: {e}");
                        break;
                    },
                }
            }
        });
        Ok(Box::new(AbortOnDrop(task)))
    }

    fn get_service_channel(&self, address: &str, mailbox: OppMailbox) -> Result<()> {
        // TCP has no SDP; the port in the address is the channel.
        mailbox.service_channel(address.to_owned(), 1);
        Ok(())
    }

    fn update_sdp_records(&self, address: &str, mailbox: OppMailbox) -> Result<()> {
        mailbox.sdp_updated(address.to_owned());
        Ok(())
    }

    fn connect(&self, address: &str, _channel: i32, mailbox: OppMailbox) -> Result<()> {
        let address = address.to_owned();
        tokio::spawn(async move {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    let link = spawn_stream_pump(stream, mailbox.clone());
                    mailbox.connected(address, link);
                },
                Err(e) => {
                    mailbox.connect_failed(address, e.to_string());
                },
            }
        });
        Ok(())
    }
}

/// Split the stream into a write queue and a read pump; raw read chunks are
/// posted as deliveries, so OBEX reassembly sees arbitrary splits exactly as
/// it would over RFCOMM.
fn spawn_stream_pump(stream: TcpStream, mailbox: OppMailbox) -> Box<dyn Transport> {
    let _ = stream.set_nodelay(true);
    let id = next_link_id();
    let (mut reader, mut writer) = stream.into_split();
    let cancel = CancellationToken::new();
    let alive = Arc::new(AtomicBool::new(true));
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let write_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            select! {
                _ = write_cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(data) => {
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                    },
                    None => break,
                },
            }
        }
        let _ = writer.shutdown().await;
    });

    let read_cancel = cancel.clone();
    let read_alive = alive.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            select! {
                _ = read_cancel.cancelled() => break,
                res = reader.read(&mut buf) => match res {
                    Ok(0) => break,
                    Ok(n) => mailbox.socket_message(id, Bytes::copy_from_slice(&buf[..n])),
                    Err(e) => {
                        read_alive.store(false, Ordering::SeqCst);
                        mailbox.socket_error(id, e.to_string());
                        return;
                    },
                },
            }
        }
        read_alive.store(false, Ordering::SeqCst);
        mailbox.socket_closed(id);
    });

    Box::new(TcpLink { id, tx, cancel, alive })
}

struct TcpLink {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl Transport for TcpLink {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, data: Bytes) -> Result<()> {
        self.tx.send(data).map_err(|_| anyhow!("link is closed"))
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
