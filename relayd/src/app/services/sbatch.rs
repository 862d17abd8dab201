// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Submission script rendering.
//!
//! Output depends only on the job spec, the job name and the correlation id.
//! Randomness lives in the job name alone.

use tera::Context;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes, invalid_argument};
use crate::app::services::shell::{is_env_name, sh_escape};
use crate::app::types::{CorrelationId, JobKind, JobSpec, SlurmSettings, Workload};

/// Variable the remote worker reads to tag its telemetry.
pub const CORRELATION_ENV: &str = "HPC_CORRELATION_ID";
/// Placeholder replaced in simulation config files before launch.
pub const CORRELATION_PLACEHOLDER: &str = "CORRELATION_ID_REPLACE_ME";

const HEADER_TEMPLATE: &str = r#"#!/bin/bash
#SBATCH --job-name={{ job_name }}
#SBATCH --time={{ time_limit }}
#SBATCH --cpus-per-task={{ cpus }}
#SBATCH --mem={{ memory_gb }}GB
{% if partition %}#SBATCH --partition={{ partition }}
{% endif %}{% if qos %}#SBATCH --qos={{ qos }}
{% endif %}{% if node_list %}#SBATCH --nodelist={{ node_list }}
{% endif %}#SBATCH --output={{ log_path }}

set -euo pipefail

export {{ correlation_env }}={{ correlation_id }}
{% for entry in environment %}export {{ entry.name }}={{ entry.value }}
{% endfor %}"#;

const IMAGE_BUILD_TEMPLATE: &str = r#"
image={{ image_path }}
repo={{ repo_path }}
mkdir -p "$(dirname "$image")"
if [ -f "$image" ]; then
    echo "image $image already exists, skipping build"
    exit 0
fi
if [ ! -d "$repo/.git" ]; then
    git clone {{ repo_url }} "$repo"
fi
cd "$repo"
git fetch --all --tags
git checkout {{ git_ref }}
apptainer build "$image" Singularity
if [ ! -f "$image" ]; then
    echo "image build failed, $image not found" >&2
    exit 1
fi
echo "build completed, image saved to $image"
"#;

const DATASET_PREP_TEMPLATE: &str = r#"
dataset_dir={{ dataset_dir }}
mkdir -p "$dataset_dir"
cd "$dataset_dir"
curl -fsSL --retry 3 -o source.archive {{ source_uri }}
tar -xf source.archive
rm -f source.archive
echo "dataset ready in $dataset_dir"
"#;

const SIMULATION_TEMPLATE: &str = r#"
image={{ image_path }}
output_dir={{ output_dir }}
config_file="$output_dir/config.json"
mkdir -p "$output_dir"
cp {{ config_path }} "$config_file"
sed -i "s/{{ placeholder }}/${{ correlation_env }}/g" "$config_file"
singularity run --bind "$output_dir" "$image" \
    uv run runscripts/workflow.py --config "$config_file"
"#;

const ANALYSIS_TEMPLATE: &str = r#"
image={{ image_path }}
run_dir={{ run_dir }}
singularity run --bind "$run_dir" "$image" \
    {{ entrypoint }} --input "$run_dir"
"#;

#[derive(serde::Serialize)]
struct EnvEntry {
    name: String,
    value: String,
}

/// Scheduler job name: `<kind prefix>-<owner>-<suffix>`. The suffix keeps
/// names unique under retries and is never used for correlation.
pub fn job_name(kind: JobKind, owner_id: &str, suffix: &str) -> String {
    let owner: String = owner_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}-{}-{}", kind.name_prefix(), owner, suffix)
}

pub fn remote_script_path(settings: &SlurmSettings, job_name: &str) -> String {
    format!(
        "{}/{}.sbatch",
        settings.submit_base_path.trim_end_matches('/'),
        job_name
    )
}

/// Job name from the first `#SBATCH --job-name` / `-J` directive.
pub fn script_job_name(script: &str) -> Option<String> {
    for line in script.lines() {
        let line = line.trim();
        if !line.starts_with("#SBATCH") {
            continue;
        }
        let mut tokens = line.trim_start_matches("#SBATCH").split_whitespace();
        while let Some(tok) = tokens.next() {
            if let Some(value) = tok.strip_prefix("--job-name=") {
                return Some(value.trim_matches('"').to_string());
            }
            if tok == "--job-name" || tok == "-J" {
                return tokens.next().map(|v| v.trim_matches('"').to_string());
            }
        }
    }
    None
}

pub fn render_script(
    settings: &SlurmSettings,
    spec: &JobSpec,
    job_name: &str,
    correlation_id: &CorrelationId,
) -> AppResult<String> {
    validate_resources(spec)?;

    let resources = &spec.resources;
    let mut header = Context::new();
    header.insert("job_name", job_name);
    header.insert("time_limit", &resources.time_limit);
    header.insert("cpus", &resources.cpus);
    header.insert("memory_gb", &resources.memory_gb);
    header.insert(
        "partition",
        &resources.partition.as_ref().or(settings.partition.as_ref()),
    );
    header.insert("qos", &resources.qos.as_ref().or(settings.qos.as_ref()));
    header.insert(
        "node_list",
        &resources.node_list.as_ref().or(settings.node_list.as_ref()),
    );
    header.insert(
        "log_path",
        &format!(
            "{}/{}.out",
            settings.log_base_path.trim_end_matches('/'),
            job_name
        ),
    );
    header.insert("correlation_env", CORRELATION_ENV);
    header.insert("correlation_id", &sh_escape(correlation_id.as_str()));

    let mut environment = Vec::with_capacity(spec.environment.len());
    for (name, value) in &spec.environment {
        if !is_env_name(name) || name == CORRELATION_ENV {
            return Err(invalid_argument(format!(
                "environment variable name '{name}' is not allowed"
            )));
        }
        environment.push(EnvEntry {
            name: name.clone(),
            value: sh_escape(value),
        });
    }
    header.insert("environment", &environment);

    let (template, body) = workload_context(settings, &spec.workload);

    let mut script = render("header", HEADER_TEMPLATE, &header)?;
    script.push_str(&render(spec.kind().as_str(), template, &body)?);
    Ok(script)
}

fn workload_context(settings: &SlurmSettings, workload: &Workload) -> (&'static str, Context) {
    let mut ctx = Context::new();
    match workload {
        Workload::ImageBuild {
            repo_url,
            git_ref,
            image_name,
        } => {
            ctx.insert("image_path", &image_path(settings, image_name));
            ctx.insert(
                "repo_path",
                &join_remote(&settings.repo_base_path, image_name),
            );
            ctx.insert("repo_url", &sh_escape(repo_url));
            ctx.insert("git_ref", &sh_escape(git_ref));
            (IMAGE_BUILD_TEMPLATE, ctx)
        }
        Workload::DatasetPrep {
            dataset_name,
            source_uri,
        } => {
            ctx.insert(
                "dataset_dir",
                &join_remote(&settings.dataset_base_path, dataset_name),
            );
            ctx.insert("source_uri", &sh_escape(source_uri));
            (DATASET_PREP_TEMPLATE, ctx)
        }
        Workload::Simulation {
            image_name,
            config_path,
            output_dir,
        } => {
            ctx.insert("image_path", &image_path(settings, image_name));
            ctx.insert(
                "output_dir",
                &join_remote(&settings.experiment_base_path, output_dir),
            );
            ctx.insert("config_path", &sh_escape(config_path));
            ctx.insert("placeholder", CORRELATION_PLACEHOLDER);
            ctx.insert("correlation_env", CORRELATION_ENV);
            (SIMULATION_TEMPLATE, ctx)
        }
        Workload::Analysis {
            image_name,
            simulation_run,
            entrypoint,
        } => {
            ctx.insert("image_path", &image_path(settings, image_name));
            ctx.insert(
                "run_dir",
                &join_remote(&settings.experiment_base_path, simulation_run),
            );
            ctx.insert("entrypoint", &sh_escape(entrypoint));
            (ANALYSIS_TEMPLATE, ctx)
        }
    }
}

fn validate_resources(spec: &JobSpec) -> AppResult<()> {
    let resources = &spec.resources;
    if resources.cpus == 0 {
        return Err(invalid_argument("cpus must be at least 1"));
    }
    if resources.memory_gb == 0 {
        return Err(invalid_argument("memory must be at least 1 GB"));
    }
    if resources.time_limit.is_empty()
        || !resources
            .time_limit
            .chars()
            .all(|c| c.is_ascii_digit() || c == ':' || c == '-')
    {
        return Err(invalid_argument(format!(
            "invalid time limit '{}'",
            resources.time_limit
        )));
    }
    for (label, value) in [
        ("partition", &resources.partition),
        ("qos", &resources.qos),
        ("node list", &resources.node_list),
    ] {
        if let Some(value) = value
            && !value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ',' | '[' | ']'))
        {
            return Err(invalid_argument(format!("invalid {label} '{value}'")));
        }
    }
    Ok(())
}

fn image_path(settings: &SlurmSettings, image_name: &str) -> String {
    join_remote(&settings.image_base_path, &format!("{image_name}.sif"))
}

/// Relative bases resolve against the login directory on the cluster.
fn join_remote(base: &str, leaf: &str) -> String {
    sh_escape(&format!("{}/{}", base.trim_end_matches('/'), leaf))
}

fn render(name: &str, template: &str, context: &Context) -> AppResult<String> {
    tera::Tera::one_off(template, context, false).map_err(|err| {
        AppError::with_message(
            AppErrorKind::Internal,
            codes::INTERNAL_ERROR,
            format!("failed to render {name} script: {err}"),
        )
    })
}
