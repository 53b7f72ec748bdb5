// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Lifecycle events published to the host.
//!
//! Hosts bridge these as `name` plus a named-value bag (the serde shape),
//! which is how system messages looked in the Gecko Bluetooth stack this
//! engine descends from.

use std::{path::PathBuf, sync::Mutex};

use serde::Serialize;

/// Milestone events of one transfer session. All emissions happen on the
/// protocol task, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OppEvent {
    #[serde(rename_all = "camelCase")]
    TransferStart {
        address: String,
        received: bool,
        file_name: String,
        file_length: u64,
        content_type: String,
    },
    #[serde(rename_all = "camelCase")]
    ReceivingFileConfirmation {
        address: String,
        file_name: String,
        file_length: u64,
        content_type: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateProgress {
        address: String,
        received: bool,
        processed_length: u64,
        file_length: u64,
    },
    #[serde(rename_all = "camelCase")]
    TransferComplete {
        address: String,
        success: bool,
        received: bool,
        file_name: String,
        file_length: u64,
        content_type: String,
    },
    #[serde(rename_all = "camelCase")]
    FileWatcherNotify { data: String, path: PathBuf },
}

impl OppEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TransferStart { .. } => "transfer-start",
            Self::ReceivingFileConfirmation { .. } => "receiving-file-confirmation",
            Self::UpdateProgress { .. } => "update-progress",
            Self::TransferComplete { .. } => "transfer-complete",
            Self::FileWatcherNotify { .. } => "file-watcher-notify",
        }
    }

    /// Named-value bag for hosts that forward events as loose messages.
    pub fn to_bag(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Host-supplied receiver of lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OppEvent);
}

/// Collects events in memory; used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<OppEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<OppEvent> {
        self.events.lock().map(|mut e| e.split_off(0)).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<OppEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: OppEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
