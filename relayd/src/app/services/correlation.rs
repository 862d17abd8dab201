// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Correlation ids: `<owner>:<version tag>:<suffix>`.
//!
//! The id is embedded verbatim in a rendered script and is the only link
//! between out-of-band telemetry and the RemoteJob it belongs to.

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes, invalid_argument};
use crate::app::services::random::random_suffix;
use crate::app::types::CorrelationId;

pub const DELIMITER: char = ':';
pub const SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationParts {
    pub owner_id: String,
    pub version_tag: String,
    pub suffix: String,
}

pub fn new_correlation_id(owner_id: &str, version_tag: &str) -> AppResult<CorrelationId> {
    correlation_id_with_suffix(owner_id, version_tag, &random_suffix(SUFFIX_LEN))
}

/// Builds an id from explicit parts. Every part must be non-empty and free of
/// the delimiter.
pub fn correlation_id_with_suffix(
    owner_id: &str,
    version_tag: &str,
    suffix: &str,
) -> AppResult<CorrelationId> {
    for (label, part) in [
        ("owner id", owner_id),
        ("version tag", version_tag),
        ("suffix", suffix),
    ] {
        validate_part(label, part)?;
    }
    Ok(CorrelationId::from_raw(format!(
        "{owner_id}{DELIMITER}{version_tag}{DELIMITER}{suffix}"
    )))
}

pub fn parse_correlation_id(raw: &str) -> AppResult<CorrelationParts> {
    let parts: Vec<&str> = raw.split(DELIMITER).collect();
    let [owner_id, version_tag, suffix] = parts.as_slice() else {
        return Err(malformed(raw, "expected exactly two delimiters"));
    };
    if owner_id.is_empty() || version_tag.is_empty() || suffix.is_empty() {
        return Err(malformed(raw, "empty component"));
    }
    Ok(CorrelationParts {
        owner_id: owner_id.to_string(),
        version_tag: version_tag.to_string(),
        suffix: suffix.to_string(),
    })
}

fn validate_part(label: &str, part: &str) -> AppResult<()> {
    if part.trim().is_empty() {
        return Err(invalid_argument(format!("{label} must not be empty")));
    }
    if part.contains(DELIMITER) {
        return Err(invalid_argument(format!(
            "{label} '{part}' must not contain '{DELIMITER}'"
        )));
    }
    if part.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid_argument(format!(
            "{label} '{part}' must not contain whitespace"
        )));
    }
    Ok(())
}

fn malformed(raw: &str, reason: &str) -> AppError {
    AppError::with_message(
        AppErrorKind::MalformedCorrelationId,
        codes::MALFORMED_CORRELATION_ID,
        format!("malformed correlation id '{raw}': {reason}"),
    )
}
