// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh::client::AuthResult;
use russh::keys::PrivateKeyWithHashAlg;
use std::sync::Arc;

use crate::adapters::ssh::AuthenticationFailure;

use super::exec::run_on_handle;
use super::{ClientHandler, SessionManager};

const PING_COMMAND: &str = "echo ping";

#[derive(Debug, PartialEq, Eq)]
enum AuthDecision {
    Success,
    Failure,
}

fn auth_decision(result: AuthResult) -> AuthDecision {
    match result {
        AuthResult::Success => AuthDecision::Success,
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            log::debug!(
                "publickey authentication failed (partial_success={partial_success}, remaining={remaining_methods:?})"
            );
            AuthDecision::Failure
        }
    }
}

fn ping_succeeded(stdout: &[u8], exit_code: i32) -> bool {
    exit_code == 0 && String::from_utf8_lossy(stdout).contains("ping")
}

impl SessionManager {
    /// Ensure we have a connected, authenticated and verified handle.
    /// A handle whose transport has closed is dropped and re-established.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut handle_field = self.handle.lock().await;

        let needs_connect = match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        };
        if !needs_connect {
            log::debug!(
                "don't need to re-establish connection to {}@{}",
                &self.params.username,
                &self.params.addr
            );
            return Ok(());
        }

        log::info!(
            "establishing connection with {}@{}",
            &self.params.username,
            &self.params.addr
        );
        let handler = ClientHandler {
            host: self.params.host.clone(),
            addr: self.params.addr,
            known_hosts_path: self.params.known_hosts_path.clone(),
            learn_unknown_hosts: self.params.learn_unknown_hosts,
        };
        let mut handle = russh::client::connect(self.config.clone(), self.params.addr, handler)
            .await
            .context("SSH connect failed")?;
        log::debug!(
            "established transport with {}@{}, proceeding with auth",
            &self.params.username,
            &self.params.addr
        );

        let path = self
            .params
            .identity_path
            .as_ref()
            .ok_or_else(|| anyhow!("no identity file configured"))?;
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load secret key at {}", path.display()))?;
        // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys)
        let pk = PrivateKeyWithHashAlg::new(
            Arc::new(key),
            handle.best_supported_rsa_hash().await?.flatten(),
        );
        let result = handle
            .authenticate_publickey(self.params.username.clone(), pk)
            .await?;
        if auth_decision(result) == AuthDecision::Failure {
            return Err(AuthenticationFailure.into());
        }

        let (stdout, _stderr, code) = run_on_handle(&handle, PING_COMMAND)
            .await
            .context("connection check failed")?;
        if !ping_succeeded(&stdout, code) {
            return Err(anyhow!(
                "connection check '{PING_COMMAND}' returned exit code {code}"
            ));
        }
        log::info!(
            "connected to {}@{}",
            &self.params.username,
            &self.params.addr
        );

        *handle_field = Some(handle);
        drop(handle_field);
        self.spawn_keepalive().await;
        Ok(())
    }

    async fn spawn_keepalive(&self) {
        let Some(interval) = self.config.keepalive_interval else {
            return;
        };
        let handle_clone = self.handle.clone();
        let jh = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval / 2);
            loop {
                ticker.tick().await;
                let guard = handle_clone.lock().await;
                let Some(handle) = guard.as_ref() else {
                    break;
                };
                if handle.is_closed() {
                    log::debug!("keepalive handle is closed");
                    break;
                }
                if let Err(e) = handle.send_keepalive(true).await {
                    log::debug!("error when sending a keepalive: {e}");
                }
            }
        });
        if let Some(previous) = self.keepalive_task_handle.lock().await.replace(jh) {
            previous.abort();
        }
    }
}
