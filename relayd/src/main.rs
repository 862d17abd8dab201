// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use relayd::adapters;
use relayd::app::ingest::{CorrelationCache, IngestPipeline, TelemetryIngestor};
use relayd::app::monitor::JobMonitor;
use relayd::app::ports::RemoteShellPort;
use relayd::app::scheduler::SlurmScheduler;
use relayd::{config, logging};

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => tracing::info!(
            "config path: {} (source={}, present={})",
            path.display(),
            source.as_str(),
            report.config_file_present
        ),
        (Some(path), None) => tracing::info!(
            "config path: {} (present={})",
            path.display(),
            report.config_file_present
        ),
        (None, _) => tracing::info!("config path: (none)"),
    }
    tracing::info!(
        "config database_path: {} (source={})",
        report.database_path.value.display(),
        report.database_path.source.as_str()
    );
    tracing::info!(
        "config job_check_interval_secs: {} (source={})",
        report.job_check_interval_secs.value,
        report.job_check_interval_secs.source.as_str()
    );
    tracing::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
    tracing::info!(
        "config telemetry.enabled: {} (source={})",
        report.telemetry_enabled.value,
        report.telemetry_enabled.source.as_str()
    );
    tracing::info!(
        "config telemetry.nats_url: {} (source={})",
        report.nats_url.value,
        report.nats_url.source.as_str()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database_path,
            job_check_interval_secs: opts.job_check_interval_secs,
            verbose: parsed.verbose_override,
            telemetry_enabled: parsed.telemetry_override,
            nats_url: opts.nats_url,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);

    config::ensure_database_dir(&config.database_path)?;
    let db = adapters::db::JobStore::open(&config.database_path).await?;
    let store = Arc::new(adapters::db::SqliteStoreAdapter::new(db));

    let addr = adapters::network::resolve_first_addr(&config.ssh.host, config.ssh.port).await?;
    let ssh_config = config.ssh.to_ssh_config(addr);
    tracing::info!(
        "cluster login {}@{} ({addr})",
        ssh_config.username,
        ssh_config.host
    );

    let scheduler = Arc::new(SlurmScheduler::new(config.slurm.clone()));
    let managed_shell: Arc<dyn RemoteShellPort> =
        Arc::new(adapters::ssh::SshShell::new(&ssh_config));
    let monitor = JobMonitor::new(
        store.clone(),
        scheduler,
        managed_shell.clone(),
        Arc::new(adapters::time::SystemClock),
        Duration::from_secs(config.job_check_interval_secs),
    );
    monitor.start().await;

    let pipeline: Option<IngestPipeline> = if config.telemetry.enabled {
        let bus = adapters::bus::NatsBus::connect(&config.telemetry.nats_url).await?;
        let ingestor = Arc::new(TelemetryIngestor::new(
            store.clone(),
            store.clone(),
            CorrelationCache::new(
                config.telemetry.correlation_cache_capacity,
                config.telemetry.correlation_cache_ttl,
            ),
        ));
        Some(
            ingestor
                .start(&bus, &config.telemetry.subject, config.telemetry.queue_depth)
                .await?,
        )
    } else {
        tracing::info!("telemetry ingestion is disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    monitor.stop().await;
    if let Some(pipeline) = pipeline {
        pipeline.shutdown().await;
    }
    if let Err(err) = managed_shell.disconnect().await {
        tracing::warn!("failed to close the managed session: {err}");
    }
    Ok(())
}
