// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Control plane for batch jobs on a remote Slurm cluster: submission over
//! SSH, status reconciliation and telemetry ingestion.

pub mod adapters;
pub mod app;
pub mod config;
pub mod logging;
