// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod batch_scheduler;
pub mod clock;
pub mod job_store;
pub mod message_bus;
pub mod remote_shell;
pub mod telemetry_store;

pub use batch_scheduler::{BatchSchedulerPort, RenderedScript};
pub use clock::ClockPort;
pub use job_store::JobStorePort;
pub use message_bus::{MessageBusPort, MessageHandler, Subscription};
pub use remote_shell::{ExecCapture, RemoteShellPort, ShellFactoryPort};
pub use telemetry_store::TelemetryStorePort;
