// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{env, process, sync::Arc};

use anyhow::{Context, Result, bail};
use obex_opp_rs::{
    cfg::{
        config::Config,
        logger::{init_default_logger, init_logger},
    },
    manager::{OppDeps, OppHandle, OppManager},
    session::{
        events::{EventSink, OppEvent},
        file_sink::{LocalFileStore, NoopMountLockBroker},
        file_source::{FileSourceObject, StaticMimeResolver},
    },
    transport::tcp::TcpCarrier,
};
use tokio::{sync::mpsc, time::{Duration, timeout}};
use tracing::info;

const CONFIG_FILE: &str = "opp.yaml";
const LOGGER_CONFIG_FILE: &str = "opp_logger.yaml";

struct ForwardSink(mpsc::UnboundedSender<OppEvent>);

impl EventSink for ForwardSink {
    fn emit(&self, event: OppEvent) {
        let _ = self.0.send(event);
    }
}

fn build_manager(cfg: &Config) -> (OppHandle, mpsc::UnboundedReceiver<OppEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = OppManager::spawn(OppDeps {
        config: cfg.clone(),
        platform: Arc::new(TcpCarrier::new(cfg.connection.carrier_bind.clone())),
        events: Arc::new(ForwardSink(tx)),
        store: Arc::new(LocalFileStore::new(cfg.transfer.download_root.clone())),
        locks: Arc::new(NoopMountLockBroker),
        mime: Arc::new(StaticMimeResolver),
    });
    (handle, rx)
}

/// Receive pushes over the TCP carrier until interrupted.
async fn serve(cfg: Config) -> Result<()> {
    let (handle, mut events) = build_manager(&cfg);
    info!("receiving OBEX pushes on {}", cfg.connection.carrier_bind);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                info!(name = event.name(), bag = %event.to_bag(), "opp event");
                if matches!(event, OppEvent::ReceivingFileConfirmation { .. }) {
                    handle.confirm_receiving_file(cfg.transfer.auto_confirm).await;
                }
            },
        }
    }

    handle.shutdown();
    Ok(())
}

/// Push the given files to a peer carrier and wait for the completions.
async fn push(cfg: Config, peer: String, files: Vec<String>) -> Result<()> {
    if files.is_empty() {
        bail!("nothing to push");
    }

    let (handle, mut events) = build_manager(&cfg);

    for file in &files {
        let object = FileSourceObject::from_path(file)
            .with_context(|| format!("failed to open {file}"))?;
        if !handle.send_file(&peer, Box::new(object)).await {
            bail!("{peer} refused to queue {file}");
        }
    }

    let mut completions = 0usize;
    while completions < files.len() {
        let event = timeout(Duration::from_secs(60), events.recv())
            .await
            .context("timed out waiting for the transfer to finish")?
            .context("manager went away")?;
        info!(name = event.name(), bag = %event.to_bag(), "opp event");
        if let OppEvent::TransferComplete { success, file_name, .. } = &event {
            if !success {
                bail!("transfer of {file_name} failed");
            }
            completions += 1;
        }
    }

    info!("pushed {} file(s) to {peer}", files.len());
    handle.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _logger = match init_logger(LOGGER_CONFIG_FILE) {
        Ok(guard) => guard,
        Err(_) => init_default_logger()?,
    };

    let cfg = Config::load_or_default(CONFIG_FILE)?;

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("serve") => {
            let mut cfg = cfg;
            if let Some(bind) = args.next() {
                cfg.connection.carrier_bind = bind;
            }
            serve(cfg).await
        },
        Some("push") => {
            let Some(peer) = args.next() else {
                bail!("push needs a peer address");
            };
            push(cfg, peer, args.collect()).await
        },
        _ => {
            eprintln!("usage: obex-opp-rs serve [bind-addr]");
            eprintln!("       obex-opp-rs push <peer-addr> <file>...");
            process::exit(2);
        },
    }
}
