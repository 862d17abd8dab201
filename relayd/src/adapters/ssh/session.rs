// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::anyhow;
use russh::client::Config;
use russh::keys::known_hosts::learn_known_hosts_path;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::app::types::SshConfig;

mod auth;
mod exec;
mod sftp;

/// russh client handler; only server key verification is customised.
#[derive(Clone, Debug)]
struct ClientHandler {
    host: String,
    addr: SocketAddr,
    known_hosts_path: Option<PathBuf>,
    learn_unknown_hosts: bool,
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_server_key(
            &self.host,
            self.addr,
            server_public_key,
            self.known_hosts_path.as_deref(),
            self.learn_unknown_hosts,
        )
    }
}

/// Parameters for establishing the SSH connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshParams {
    /// Original hostname or IP used for known_hosts lookup.
    pub host: String,
    pub addr: SocketAddr,
    pub username: String,
    pub identity_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,
    pub learn_unknown_hosts: bool,
    pub keepalive_secs: u64,
}

impl From<&SshConfig> for SshParams {
    fn from(config: &SshConfig) -> Self {
        Self {
            host: config.host.clone(),
            addr: config.addr,
            username: config.username.clone(),
            identity_path: config.identity_path.as_ref().map(PathBuf::from),
            known_hosts_path: config.known_hosts_path.as_ref().map(PathBuf::from),
            learn_unknown_hosts: config.learn_unknown_hosts,
            keepalive_secs: config.keepalive_secs,
        }
    }
}

fn check_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, russh::keys::Error> {
    match known_hosts_path {
        Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
        None => russh::keys::check_known_hosts(host, port, key),
    }
}

fn learn_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<(), russh::keys::Error> {
    match known_hosts_path {
        Some(path) => learn_known_hosts_path(host, port, key, path),
        None => russh::keys::known_hosts::learn_known_hosts(host, port, key),
    }
}

/// Accepts a key listed under the host name or its IP. A changed key is an
/// error; an unlisted key is learned only when `learn` is set.
fn verify_server_key(
    host: &str,
    addr: SocketAddr,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
    learn: bool,
) -> std::result::Result<bool, anyhow::Error> {
    let port = addr.port();
    let ip_host = addr.ip().to_string();
    let mut candidates = vec![host.to_string()];
    if ip_host != host {
        candidates.push(ip_host);
    }

    for candidate in &candidates {
        match check_known_hosts_for(candidate, port, key, known_hosts_path) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => {
                log::warn!("server key validation failed for {host}:{port}: {err}");
                return Err(anyhow!(
                    "server key validation failed for {host}:{port}: {err}"
                ));
            }
        }
    }

    let tried = candidates.join(", ");
    if !learn {
        log::warn!(
            "server key for {host}:{port} is not present in known_hosts (tried {tried}); rejecting"
        );
        return Ok(false);
    }
    log::info!(
        "server key for {host}:{port} is not present in known_hosts (tried {tried}); learning"
    );
    learn_known_hosts_for(host, port, key, known_hosts_path).map_err(|err| {
        log::warn!("failed to learn server key for {host}:{port}: {err}");
        anyhow!("failed to learn server key for {host}:{port}: {err}")
    })?;
    Ok(true)
}

/// Owns one SSH connection. Commands on it are serialized by the handle lock.
pub struct SessionManager {
    params: SshParams,
    config: Arc<Config>,
    handle: Arc<Mutex<Option<russh::client::Handle<ClientHandler>>>>,
    keepalive_task_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SessionManager {
    pub fn new(params: SshParams) -> Self {
        let cfg = Config {
            inactivity_timeout: Some(Duration::from_secs(params.keepalive_secs.max(1) * 4)),
            keepalive_interval: Some(Duration::from_secs(params.keepalive_secs.max(1))),
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(cfg),
            handle: Arc::new(Mutex::new(None)),
            keepalive_task_handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn params(&self) -> &SshParams {
        &self.params
    }

    pub async fn needs_connect(&self) -> bool {
        let handle_field = self.handle.lock().await;
        match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        }
    }

    /// Stops the keepalive task and closes the transport. Safe to repeat.
    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive_task_handle.lock().await.take() {
            task.abort();
        }
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };
        if handle.is_closed() {
            return;
        }
        if let Err(err) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            log::debug!(
                "error while closing connection to {}: {err}",
                self.params.addr
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::PublicKey;

    const HOST_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIIAAuJZ+0RZHqKX43aDVSiwE3xsv9rny06LLqXvOt2Jx";

    fn addr() -> SocketAddr {
        "10.0.0.5:2222".parse().unwrap()
    }

    #[test]
    fn unknown_host_key_is_rejected_unless_learning() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        std::fs::write(&known_hosts, "").unwrap();
        let key = PublicKey::from_openssh(HOST_KEY).unwrap();

        let accepted =
            verify_server_key("login.cluster", addr(), &key, Some(&known_hosts), false).unwrap();
        assert!(!accepted);

        let accepted =
            verify_server_key("login.cluster", addr(), &key, Some(&known_hosts), true).unwrap();
        assert!(accepted);

        // Learned keys are accepted without the learn flag afterwards.
        let accepted =
            verify_server_key("login.cluster", addr(), &key, Some(&known_hosts), false).unwrap();
        assert!(accepted);
    }

    #[test]
    fn params_follow_config() {
        let config = SshConfig {
            host: "login.cluster".into(),
            addr: addr(),
            username: "hpc".into(),
            identity_path: Some("/keys/id_ed25519".into()),
            known_hosts_path: None,
            learn_unknown_hosts: false,
            keepalive_secs: 15,
        };
        let params = SshParams::from(&config);
        assert_eq!(params.identity_path, Some(PathBuf::from("/keys/id_ed25519")));
        assert_eq!(params.addr.port(), 2222);
        assert_eq!(params.keepalive_secs, 15);
    }

    #[tokio::test]
    async fn fresh_manager_needs_connect_and_shutdown_is_idempotent() {
        let config = SshConfig {
            host: "login.cluster".into(),
            addr: addr(),
            username: "hpc".into(),
            identity_path: None,
            known_hosts_path: None,
            learn_unknown_hosts: false,
            keepalive_secs: 30,
        };
        let manager = SessionManager::new(SshParams::from(&config));
        assert!(manager.needs_connect().await);
        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.needs_connect().await);
    }
}
