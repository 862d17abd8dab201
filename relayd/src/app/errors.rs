// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

pub mod codes {
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const COMMAND_FAILED: &str = "command_failed";
    pub const TRANSFER_FAILED: &str = "transfer_failed";
    pub const SUBMISSION_FAILED: &str = "submission_failed";
    pub const UNKNOWN_JOB: &str = "unknown_job";
    pub const MALFORMED_CORRELATION_ID: &str = "malformed_correlation_id";
    pub const STORE_CONFLICT: &str = "store_conflict";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const LOCAL_ERROR: &str = "local_error";
}

/// Longest stderr prefix carried by a `CommandFailed` error.
pub const STDERR_EXCERPT_LIMIT: usize = 100;
/// Longest transport diagnostic carried by a `Connection` error.
pub const DIAGNOSTIC_EXCERPT_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    /// Transport-level failure; fatal to the current operation, retryable by the caller.
    Connection,
    CommandFailed,
    TransferFailed,
    SubmissionFailed,
    /// Handle absent from every scheduler view. Not a job failure.
    UnknownJob,
    MalformedCorrelationId,
    StoreConflict,
    InvalidArgument,
    NotFound,
    Internal,
}

/// Details of a remote command that exited non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub command: String,
    pub exit_code: i32,
    pub stderr_excerpt: String,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
    remote: Option<RemoteFailure>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
            remote: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
            remote: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_remote(mut self, remote: RemoteFailure) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn remote(&self) -> Option<&RemoteFailure> {
        self.remote.as_ref()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

/// Truncates `text` to at most `limit` characters.
pub fn excerpt(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

pub fn connection_error(message: impl AsRef<str>) -> AppError {
    AppError::with_message(
        AppErrorKind::Connection,
        codes::CONNECTION_FAILURE,
        excerpt(message.as_ref(), DIAGNOSTIC_EXCERPT_LIMIT),
    )
}

pub fn command_failed(command: &str, exit_code: i32, stderr: &[u8]) -> AppError {
    let stderr_excerpt = excerpt(
        String::from_utf8_lossy(stderr).trim(),
        STDERR_EXCERPT_LIMIT,
    );
    AppError::with_message(
        AppErrorKind::CommandFailed,
        codes::COMMAND_FAILED,
        format!("command '{command}' exited with {exit_code}: {stderr_excerpt}"),
    )
    .with_remote(RemoteFailure {
        command: command.to_string(),
        exit_code,
        stderr_excerpt,
    })
}

pub fn transfer_failed(message: impl AsRef<str>) -> AppError {
    AppError::with_message(
        AppErrorKind::TransferFailed,
        codes::TRANSFER_FAILED,
        excerpt(message.as_ref(), DIAGNOSTIC_EXCERPT_LIMIT),
    )
}

pub fn invalid_argument(message: impl Into<String>) -> AppError {
    AppError::with_message(
        AppErrorKind::InvalidArgument,
        codes::INVALID_ARGUMENT,
        message,
    )
}

pub fn local_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::Internal, codes::LOCAL_ERROR, message)
}
