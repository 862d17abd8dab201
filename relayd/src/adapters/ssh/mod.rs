// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::app::errors::{
    AppError, AppErrorKind, AppResult, DIAGNOSTIC_EXCERPT_LIMIT, codes, connection_error, excerpt,
    transfer_failed,
};
use crate::app::ports::{ExecCapture, RemoteShellPort, ShellFactoryPort};
use crate::app::types::SshConfig;

mod error;
mod session;

pub use error::AuthenticationFailure;
pub use session::{SessionManager, SshParams};

/// `RemoteShellPort` over one russh connection. Usable as a managed session
/// (kept across calls) or handed out per operation by `SshShellFactory`.
pub struct SshShell {
    session: SessionManager,
}

impl SshShell {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            session: SessionManager::new(SshParams::from(config)),
        }
    }
}

fn map_connect_error(err: anyhow::Error) -> AppError {
    if err.chain().any(|cause| cause.is::<AuthenticationFailure>()) {
        return AppError::with_message(
            AppErrorKind::Connection,
            codes::AUTHENTICATION_FAILURE,
            "ssh authentication failed",
        );
    }
    connection_error(format!("ssh connect failed: {err:#}"))
}

fn map_exec_error(err: anyhow::Error) -> AppError {
    connection_error(format!("ssh exec failed: {err:#}"))
}

fn map_transfer_error(direction: &str, err: anyhow::Error) -> AppError {
    transfer_failed(format!("{direction} failed: {err:#}"))
}

#[async_trait]
impl RemoteShellPort for SshShell {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self),
        fields(op = "connect", host = %self.session.params().host, user = %self.session.params().username)
    )]
    async fn connect(&self) -> AppResult<()> {
        self.session
            .ensure_connected()
            .await
            .map_err(map_connect_error)
    }

    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, command),
        fields(op = "exec_capture", host = %self.session.params().host, user = %self.session.params().username)
    )]
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture> {
        let (stdout, stderr, exit_code) = self
            .session
            .exec_capture(command)
            .await
            .map_err(map_exec_error)?;
        if exit_code != 0 {
            tracing::debug!(
                "'{}' exited with {exit_code}: {}",
                excerpt(command, DIAGNOSTIC_EXCERPT_LIMIT),
                excerpt(
                    String::from_utf8_lossy(&stderr).trim(),
                    DIAGNOSTIC_EXCERPT_LIMIT
                )
            );
        }
        Ok(ExecCapture {
            stdout,
            stderr,
            exit_code,
        })
    }

    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, local, remote),
        fields(op = "upload", host = %self.session.params().host, user = %self.session.params().username)
    )]
    async fn upload_file(&self, local: &Path, remote: &str) -> AppResult<()> {
        self.session
            .upload_file(local, remote)
            .await
            .map_err(|err| map_transfer_error("upload", err))
    }

    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, remote, local),
        fields(op = "download", host = %self.session.params().host, user = %self.session.params().username)
    )]
    async fn download_file(&self, remote: &str, local: &Path) -> AppResult<()> {
        self.session
            .download_file(remote, local)
            .await
            .map_err(|err| map_transfer_error("download", err))
    }

    async fn disconnect(&self) -> AppResult<()> {
        self.session.shutdown().await;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.session.needs_connect().await
    }
}

/// Opens a fresh, unconnected `SshShell` per call.
#[derive(Clone)]
pub struct SshShellFactory {
    config: SshConfig,
}

impl SshShellFactory {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

impl ShellFactoryPort for SshShellFactory {
    fn open_session(&self) -> Arc<dyn RemoteShellPort> {
        Arc::new(SshShell::new(&self.config))
    }
}
