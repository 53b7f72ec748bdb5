// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime parameters that live outside the OBEX protocol. Wire constants
/// (advertised max packet size, opcodes) are compile-time and not
/// configurable.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Where received objects land and how inbound pushes are confirmed.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Socket-adjacent timing and the demo carrier's bind address.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransferConfig {
    /// Base directory the `Download/Bluetooth/` target subdirectory is
    /// created under.
    #[serde(default = "default_download_root")]
    pub download_root: PathBuf,

    /// Accept inbound pushes without asking; headless receivers keep this
    /// on, interactive hosts drive the confirmation callback instead.
    #[serde(default = "default_auto_confirm")]
    pub auto_confirm: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_root: default_download_root(),
            auto_confirm: default_auto_confirm(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to wait for the peer to close the transport after a
    /// DISCONNECT reply before closing it locally.
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,

    /// Bind address of the TCP reference carrier.
    #[serde(default = "default_carrier_bind")]
    pub carrier_bind: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_ms: default_disconnect_grace_ms(),
            carrier_bind: default_carrier_bind(),
        }
    }
}

fn default_download_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_auto_confirm() -> bool {
    true
}

fn default_disconnect_grace_ms() -> u64 {
    1000
}

fn default_carrier_bind() -> String {
    "127.0.0.1:9750".to_owned()
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {path:?}"))
    }

    /// Like [`Config::load_from_file`], but an absent file simply means the
    /// built-in defaults. A file that exists and fails to parse is still an
    /// error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(path)
    }
}
