// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use std::path::Path;
use tokio::fs as tokiofs;
use tokio::io::AsyncWriteExt;

use super::SessionManager;

impl SessionManager {
    async fn sftp(&self) -> Result<SftpSession> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .filter(|h| !h.is_closed())
            .ok_or_else(|| anyhow!("SSH session is not connected"))?;
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    /// Copies a local file to `remote_path`, replacing any existing file.
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let sftp = self.sftp().await?;
        let res = upload_single_file(&sftp, local_path, remote_path).await;
        let _ = sftp.close().await;
        res
    }

    pub async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let sftp = self.sftp().await?;
        let res = download_single_file(&sftp, remote_path, local_path).await;
        let _ = sftp.close().await;
        res
    }
}

async fn upload_single_file(sftp: &SftpSession, local_path: &Path, remote_path: &str) -> Result<()> {
    log::debug!(
        "uploading file over sftp: {} -> {}",
        local_path.display(),
        remote_path
    );
    let mut lf = tokiofs::File::open(local_path)
        .await
        .with_context(|| format!("failed to open {}", local_path.display()))?;
    let flags = OpenFlags::WRITE
        .union(OpenFlags::CREATE)
        .union(OpenFlags::TRUNCATE);
    let mut rfile = sftp
        .open_with_flags(remote_path, flags)
        .await
        .with_context(|| format!("failed to open remote file {remote_path}"))?;
    tokio::io::copy(&mut lf, &mut rfile).await?;
    rfile.flush().await?;
    rfile.shutdown().await?;
    Ok(())
}

async fn download_single_file(
    sftp: &SftpSession,
    remote_path: &str,
    local_path: &Path,
) -> Result<()> {
    log::debug!(
        "downloading file over sftp: {} -> {}",
        remote_path,
        local_path.display()
    );
    if let Some(parent) = local_path.parent() {
        tokiofs::create_dir_all(parent).await?;
    }
    let mut rfile = sftp
        .open(remote_path)
        .await
        .with_context(|| format!("failed to open remote file {remote_path}"))?;
    let mut lfile = tokiofs::File::create(local_path).await?;
    tokio::io::copy(&mut rfile, &mut lfile).await?;
    lfile.flush().await?;
    Ok(())
}
