// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::app::errors::{
    AppError, AppErrorKind, AppResult, STDERR_EXCERPT_LIMIT, codes, command_failed, excerpt,
    local_error,
};
use crate::app::ports::{BatchSchedulerPort, ExecCapture, RemoteShellPort, RenderedScript};
use crate::app::services::random::random_suffix;
use crate::app::services::sbatch;
use crate::app::services::shell::sh_escape;
use crate::app::services::slurm;
use crate::app::types::{
    CorrelationId, ExternalJobHandle, JobSpec, SchedulerSnapshot, SlurmSettings,
};

const JOB_NAME_SUFFIX_LEN: usize = 6;

/// Slurm implementation of the batch scheduler boundary.
pub struct SlurmScheduler {
    settings: SlurmSettings,
}

impl SlurmScheduler {
    pub fn new(settings: SlurmSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SlurmSettings {
        &self.settings
    }

    async fn active_view(
        &self,
        shell: &dyn RemoteShellPort,
        job_ids: &[i64],
    ) -> AppResult<Vec<SchedulerSnapshot>> {
        let command = slurm::squeue_command(&self.settings.squeue_command, job_ids);
        let capture = shell.exec_capture(&command).await?;
        if capture.exit_code != 0 {
            if slurm::is_invalid_job_id(&capture.stderr_text()) {
                tracing::debug!("squeue knows none of {} requested job(s)", job_ids.len());
                return Ok(Vec::new());
            }
            return Err(command_failed(&command, capture.exit_code, &capture.stderr));
        }
        Ok(slurm::parse_squeue_output(&capture.stdout_text()))
    }

    async fn accounting_view(
        &self,
        shell: &dyn RemoteShellPort,
        job_ids: &[i64],
    ) -> AppResult<Vec<SchedulerSnapshot>> {
        let command = slurm::sacct_command(&self.settings.sacct_command, job_ids);
        let capture = shell.run_command(&command).await?;
        Ok(slurm::parse_sacct_output(&capture.stdout_text()))
    }
}

#[async_trait]
impl BatchSchedulerPort for SlurmScheduler {
    fn render_submission_script(
        &self,
        spec: &JobSpec,
        correlation_id: &CorrelationId,
    ) -> AppResult<RenderedScript> {
        let job_name = sbatch::job_name(
            spec.kind(),
            &spec.owner_id,
            &random_suffix(JOB_NAME_SUFFIX_LEN),
        );
        let text = sbatch::render_script(&self.settings, spec, &job_name, correlation_id)?;
        Ok(RenderedScript {
            remote_path: sbatch::remote_script_path(&self.settings, &job_name),
            job_name,
            text,
        })
    }

    async fn submit(
        &self,
        shell: &dyn RemoteShellPort,
        local_script: &Path,
        remote_script: &str,
    ) -> AppResult<ExternalJobHandle> {
        let script = tokio::fs::read_to_string(local_script).await.map_err(|err| {
            local_error(format!(
                "failed to read script {}: {err}",
                local_script.display()
            ))
        })?;
        let job_name = sbatch::script_job_name(&script).ok_or_else(|| {
            submission_failed(
                remote_script,
                "script has no --job-name directive".to_string(),
            )
        })?;

        shell.connect().await?;
        let remote_dir = match remote_script.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir,
            _ => ".",
        };
        shell
            .run_command(&format!(
                "mkdir -p {} {}",
                sh_escape(remote_dir),
                sh_escape(&self.settings.log_base_path)
            ))
            .await?;
        shell.upload_file(local_script, remote_script).await?;

        let command = slurm::sbatch_command(&self.settings.sbatch_command, remote_script);
        let capture = shell.exec_capture(&command).await?;
        if capture.exit_code != 0 {
            return Err(submission_failed(&command, capture_detail(&capture)));
        }
        let stdout = capture.stdout_text();
        let job_id = slurm::parse_submitted_job_id(&stdout).ok_or_else(|| {
            submission_failed(
                &command,
                format!("unrecognised sbatch output: {}", stdout.trim()),
            )
        })?;
        tracing::info!("submitted {job_name} as scheduler job {job_id}");
        Ok(ExternalJobHandle { job_id, job_name })
    }

    async fn query_status(
        &self,
        shell: &dyn RemoteShellPort,
        job_ids: &[i64],
    ) -> AppResult<Vec<SchedulerSnapshot>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        shell.connect().await?;

        let active = self.active_view(shell, job_ids).await;
        let accounting = self.accounting_view(shell, job_ids).await;
        let (active, accounting) = match (active, accounting) {
            (Err(err), Err(_)) => return Err(err),
            (Ok(active), Err(err)) => {
                tracing::warn!("sacct query failed, using active queue only: {err}");
                (active, Vec::new())
            }
            (Err(err), Ok(accounting)) => {
                tracing::warn!("squeue query failed, using accounting only: {err}");
                (Vec::new(), accounting)
            }
            (Ok(active), Ok(accounting)) => (active, accounting),
        };

        let mut merged: BTreeMap<i64, SchedulerSnapshot> = BTreeMap::new();
        for snapshot in active.into_iter().chain(accounting) {
            if job_ids.contains(&snapshot.job_id) {
                merged.insert(snapshot.job_id, snapshot);
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn job_status(
        &self,
        shell: &dyn RemoteShellPort,
        job_id: i64,
    ) -> AppResult<SchedulerSnapshot> {
        shell.connect().await?;
        let ids = [job_id];
        if let Some(snapshot) = self
            .active_view(shell, &ids)
            .await?
            .into_iter()
            .find(|s| s.job_id == job_id)
        {
            return Ok(snapshot);
        }
        self.accounting_view(shell, &ids)
            .await?
            .into_iter()
            .find(|s| s.job_id == job_id)
            .ok_or_else(|| {
                AppError::with_message(
                    AppErrorKind::UnknownJob,
                    codes::UNKNOWN_JOB,
                    format!("scheduler does not know job {job_id} yet"),
                )
            })
    }
}

fn capture_detail(capture: &ExecCapture) -> String {
    let stderr = capture.stderr_text();
    let text = if stderr.trim().is_empty() {
        capture.stdout_text()
    } else {
        stderr
    };
    format!(
        "exit code {}: {}",
        capture.exit_code,
        excerpt(text.trim(), STDERR_EXCERPT_LIMIT)
    )
}

fn submission_failed(command: &str, detail: String) -> AppError {
    AppError::with_message(
        AppErrorKind::SubmissionFailed,
        codes::SUBMISSION_FAILED,
        format!("submission via '{command}' failed: {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap as Map, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::app::services::correlation::correlation_id_with_suffix;
    use crate::app::types::{ResourceRequest, SnapshotSource, Workload};

    /// Shell that expects commands in order, answering each with a canned capture.
    struct SequencedShell {
        steps: Mutex<VecDeque<(&'static str, ExecCapture)>>,
        uploads: Mutex<Vec<String>>,
        connects: AtomicUsize,
    }

    impl SequencedShell {
        fn new(steps: Vec<(&'static str, ExecCapture)>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                uploads: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            }
        }

        fn assert_done(&self) {
            assert!(self.steps.lock().expect("steps").is_empty());
        }
    }

    #[async_trait]
    impl RemoteShellPort for SequencedShell {
        async fn connect(&self) -> AppResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture> {
            let (expected, capture) = self
                .steps
                .lock()
                .expect("steps")
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected command: {command}"));
            let bare = command.strip_prefix("TZ=UTC ").unwrap_or(command);
            assert!(
                bare.starts_with(expected),
                "expected '{expected}...', got '{command}'"
            );
            Ok(capture)
        }

        async fn upload_file(&self, _local: &Path, remote: &str) -> AppResult<()> {
            self.uploads.lock().expect("uploads").push(remote.to_string());
            Ok(())
        }

        async fn download_file(&self, _remote: &str, _local: &Path) -> AppResult<()> {
            panic!("download_file should not be called");
        }

        async fn disconnect(&self) -> AppResult<()> {
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            true
        }
    }

    fn ok(stdout: &str) -> ExecCapture {
        ExecCapture {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
        }
    }

    fn fail(code: i32, stderr: &str) -> ExecCapture {
        ExecCapture {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code: code,
        }
    }

    fn spec() -> JobSpec {
        JobSpec {
            owner_id: "42".into(),
            resources: ResourceRequest {
                cpus: 2,
                memory_gb: 8,
                time_limit: "30:00".into(),
                ..ResourceRequest::default()
            },
            environment: Map::new(),
            workload: Workload::Simulation {
                image_name: "sim".into(),
                config_path: "base.json".into(),
                output_dir: "run".into(),
            },
        }
    }

    #[tokio::test]
    async fn query_prefers_accounting_and_filters_unrequested_rows() {
        let shell = SequencedShell::new(vec![
            ("squeue", ok("1001|sim-42-a|RUNNING|2026-01-01T10:00:00\n")),
            (
                "sacct",
                ok("1001|sim-42-a|COMPLETED|2026-01-01T10:00:00|2026-01-01T11:00:00|0:0|\n\
                    1001.batch|batch|COMPLETED|2026-01-01T10:00:00|2026-01-01T11:00:00|0:0|\n\
                    1002|sim-42-b|PENDING|Unknown|Unknown|0:0|\n\
                    9999|other|FAILED|Unknown|Unknown|1:0|\n"),
            ),
        ]);
        let scheduler = SlurmScheduler::new(SlurmSettings::default());
        let rows = scheduler
            .query_status(&shell, &[1001, 1002, 1003])
            .await
            .expect("query");
        shell.assert_done();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_id, 1001);
        assert_eq!(rows[0].state, "COMPLETED");
        assert_eq!(rows[0].source, SnapshotSource::Accounting);
        assert_eq!(rows[1].job_id, 1002);
        assert!(rows.iter().all(|r| r.job_id != 1003));
    }

    #[tokio::test]
    async fn invalid_job_id_from_squeue_is_an_empty_view() {
        let shell = SequencedShell::new(vec![
            ("squeue", fail(1, "slurm_load_jobs error: Invalid job id specified")),
            ("sacct", ok("")),
        ]);
        let scheduler = SlurmScheduler::new(SlurmSettings::default());
        let rows = scheduler.query_status(&shell, &[5]).await.expect("query");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn query_fails_when_both_views_fail() {
        let shell = SequencedShell::new(vec![
            ("squeue", fail(1, "slurm controller down")),
            ("sacct", fail(1, "slurmdbd down")),
        ]);
        let scheduler = SlurmScheduler::new(SlurmSettings::default());
        let err = scheduler.query_status(&shell, &[5]).await.expect_err("fail");
        assert_eq!(err.kind(), AppErrorKind::CommandFailed);
    }

    #[tokio::test]
    async fn empty_handle_list_skips_the_remote() {
        let shell = SequencedShell::new(Vec::new());
        let scheduler = SlurmScheduler::new(SlurmSettings::default());
        let rows = scheduler.query_status(&shell, &[]).await.expect("query");
        assert!(rows.is_empty());
        assert_eq!(shell.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn submit_uploads_then_parses_the_handle() {
        let scheduler = SlurmScheduler::new(SlurmSettings::default());
        let cid = correlation_id_with_suffix("42", "v1", "ab12cd").expect("cid");
        let rendered = scheduler
            .render_submission_script(&spec(), &cid)
            .expect("render");
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(file.path(), &rendered.text).expect("write");

        let shell = SequencedShell::new(vec![("mkdir -p", ok("")), ("sbatch --parsable", ok("1001\n"))]);
        let handle = scheduler
            .submit(&shell, file.path(), &rendered.remote_path)
            .await
            .expect("submit");
        shell.assert_done();
        assert_eq!(handle.job_id, 1001);
        assert_eq!(handle.job_name, rendered.job_name);
        assert_eq!(
            *shell.uploads.lock().expect("uploads"),
            vec![rendered.remote_path.clone()]
        );
    }

    #[tokio::test]
    async fn rejected_submission_is_reported() {
        let scheduler = SlurmScheduler::new(SlurmSettings::default());
        let cid = correlation_id_with_suffix("42", "v1", "ab12cd").expect("cid");
        let rendered = scheduler
            .render_submission_script(&spec(), &cid)
            .expect("render");
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(file.path(), &rendered.text).expect("write");

        let shell = SequencedShell::new(vec![
            ("mkdir -p", ok("")),
            (
                "sbatch --parsable",
                fail(1, "sbatch: error: Batch job submission failed: Invalid qos"),
            ),
        ]);
        let err = scheduler
            .submit(&shell, file.path(), &rendered.remote_path)
            .await
            .expect_err("rejected");
        assert_eq!(err.kind(), AppErrorKind::SubmissionFailed);
        assert!(err.message().contains("Invalid qos"));
        assert!(err.message().contains("sbatch --parsable"));
    }

    #[tokio::test]
    async fn job_status_falls_back_to_accounting_then_unknown() {
        let scheduler = SlurmScheduler::new(SlurmSettings::default());
        let shell = SequencedShell::new(vec![
            ("squeue", ok("")),
            ("sacct", ok("77|x|TIMEOUT|2026-01-01T10:00:00|2026-01-01T12:00:00|0:1|\n")),
        ]);
        let snapshot = scheduler.job_status(&shell, 77).await.expect("status");
        assert_eq!(snapshot.state, "TIMEOUT");

        let shell = SequencedShell::new(vec![("squeue", ok("")), ("sacct", ok(""))]);
        let err = scheduler.job_status(&shell, 78).await.expect_err("unknown");
        assert_eq!(err.kind(), AppErrorKind::UnknownJob);
    }
}
