// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::{
    io,
    net::{IpAddr, SocketAddr},
};
use thiserror::Error as ThisError;
use tokio::net::lookup_host;

use crate::app::errors::{AppError, connection_error};

#[derive(ThisError, Debug)]
pub enum NetError {
    #[error("DNS name not found for {0}")]
    DnsNotFound(String),

    #[error("couldn't resolve host: {0}")]
    Resolve(io::Error),

    #[error("no addresses resolved from {0}")]
    NoAddrs(String),
}

impl From<NetError> for AppError {
    fn from(err: NetError) -> Self {
        connection_error(err.to_string())
    }
}

/// Resolves the login node; IP literals skip DNS.
pub async fn resolve_first_addr(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => NetError::DnsNotFound(host.to_owned()),
            _ => NetError::Resolve(e),
        })?;
    addrs.next().ok_or_else(|| NetError::NoAddrs(host.to_owned()))
}
