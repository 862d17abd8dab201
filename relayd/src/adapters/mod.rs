// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod bus;
pub mod cli;
pub mod db;
pub mod network;
pub mod ssh;
pub mod time;
