// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod opp_manager;

pub use opp_manager::{
    Command, Input, OppDeps, OppError, OppHandle, OppMailbox, OppManager, get, shutdown,
};
