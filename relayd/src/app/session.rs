// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::app::errors::AppResult;
use crate::app::ports::{RemoteShellPort, ShellFactoryPort};

/// Opens a fresh session, runs `body` against it and disconnects on every
/// exit path, including errors and panics inside `body`.
pub async fn with_scoped_session<F, Fut, T>(
    factory: &dyn ShellFactoryPort,
    operation: &str,
    body: F,
) -> AppResult<T>
where
    F: FnOnce(Arc<dyn RemoteShellPort>) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let shell = factory.open_session();
    if let Err(err) = shell.connect().await {
        release(shell.as_ref(), operation).await;
        return Err(err);
    }

    let outcome = AssertUnwindSafe(body(Arc::clone(&shell)))
        .catch_unwind()
        .await;
    release(shell.as_ref(), operation).await;

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

async fn release(shell: &dyn RemoteShellPort, operation: &str) {
    if let Err(err) = shell.disconnect().await {
        tracing::warn!("failed to close session after {operation}: {err}");
    }
}
