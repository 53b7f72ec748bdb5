// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod engine;
pub mod events;
pub mod file_sink;
pub mod file_source;
pub mod queue;
pub mod reassembly;
