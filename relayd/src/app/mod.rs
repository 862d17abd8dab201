// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod dispatcher;
pub mod errors;
pub mod ingest;
pub mod monitor;
pub mod ports;
pub mod scheduler;
pub mod services;
pub mod session;
#[cfg(test)]
pub(crate) mod test_support;
pub mod types;
