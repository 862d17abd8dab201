// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use thiserror::Error as ThisError;

/// The server rejected every key we offered.
#[derive(Debug, ThisError)]
#[error("publickey authentication rejected")]
pub struct AuthenticationFailure;
