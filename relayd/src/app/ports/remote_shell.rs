// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::app::errors::{AppResult, command_failed};

#[derive(Debug, Clone, Default)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[async_trait]
/// Remote command execution and file transfer over one connection.
/// A single session must not be driven by two callers at once.
pub trait RemoteShellPort: Send + Sync {
    /// No-op when already connected; reconnects when the transport was dropped.
    async fn connect(&self) -> AppResult<()>;

    /// Runs `command` and returns whatever it produced, including non-zero exits.
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture>;

    /// Like `exec_capture`, but a non-zero exit becomes `CommandFailed`.
    async fn run_command(&self, command: &str) -> AppResult<ExecCapture> {
        let capture = self.exec_capture(command).await?;
        if capture.exit_code != 0 {
            return Err(command_failed(
                command,
                capture.exit_code,
                &capture.stderr,
            ));
        }
        Ok(capture)
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> AppResult<()>;

    async fn download_file(&self, remote: &str, local: &Path) -> AppResult<()>;

    /// Always safe to call; a second call is a no-op.
    async fn disconnect(&self) -> AppResult<()>;

    async fn is_connected(&self) -> bool;
}

/// Hands out fresh, not-yet-connected sessions.
pub trait ShellFactoryPort: Send + Sync {
    fn open_session(&self) -> Arc<dyn RemoteShellPort>;
}
