// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::types::{SlurmSettings, SshConfig};

const APP_DIR_NAME: &str = "relay";
const CONFIG_FILE_NAME: &str = "relay.toml";
const CONFIG_ENV_VAR: &str = "RELAY_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "relay.sqlite";
const DEFAULT_JOB_CHECK_INTERVAL_SECS: u64 = 30;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_TELEMETRY_SUBJECT: &str = "hpc.telemetry";
const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
const DEFAULT_CACHE_CAPACITY: usize = 1024;
const DEFAULT_CACHE_TTL_SECS: u64 = 600;
const DEFAULT_QUEUE_DEPTH: usize = 256;
const DEFAULT_VERSION_TAG: &str = "v1";
const DEFAULT_IDENTITY_FILES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database_path: Option<String>,
    job_check_interval_secs: Option<u64>,
    verbose: Option<bool>,
    #[serde(default)]
    ssh: FileSsh,
    #[serde(default)]
    slurm: FileSlurm,
    #[serde(default)]
    telemetry: FileTelemetry,
    #[serde(default)]
    correlation: FileCorrelation,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSsh {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    identity_path: Option<String>,
    known_hosts_path: Option<String>,
    learn_unknown_hosts: Option<bool>,
    keepalive_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSlurm {
    partition: Option<String>,
    qos: Option<String>,
    node_list: Option<String>,
    log_base_path: Option<String>,
    submit_base_path: Option<String>,
    repo_base_path: Option<String>,
    image_base_path: Option<String>,
    dataset_base_path: Option<String>,
    experiment_base_path: Option<String>,
    sbatch_command: Option<String>,
    squeue_command: Option<String>,
    sacct_command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTelemetry {
    enabled: Option<bool>,
    nats_url: Option<String>,
    subject: Option<String>,
    correlation_cache_capacity: Option<usize>,
    correlation_cache_ttl_secs: Option<u64>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileCorrelation {
    version_tag: Option<String>,
}

/// Login node to reach over SSH. The address is resolved at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,
    pub learn_unknown_hosts: bool,
    pub keepalive_secs: u64,
}

impl SshTarget {
    pub fn to_ssh_config(&self, addr: SocketAddr) -> SshConfig {
        SshConfig {
            host: self.host.clone(),
            addr,
            username: self.username.clone(),
            identity_path: self
                .identity_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            known_hosts_path: self
                .known_hosts_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            learn_unknown_hosts: self.learn_unknown_hosts,
            keepalive_secs: self.keepalive_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub nats_url: String,
    pub subject: String,
    pub correlation_cache_capacity: usize,
    pub correlation_cache_ttl: Duration,
    pub queue_depth: usize,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub job_check_interval_secs: u64,
    pub verbose: bool,
    pub ssh: SshTarget,
    pub slurm: SlurmSettings,
    pub telemetry: TelemetrySettings,
    pub version_tag: String,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub database_path: ConfigValue<PathBuf>,
    pub job_check_interval_secs: ConfigValue<u64>,
    pub verbose: ConfigValue<bool>,
    pub telemetry_enabled: ConfigValue<bool>,
    pub nats_url: ConfigValue<String>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub job_check_interval_secs: Option<u64>,
    pub verbose: Option<bool>,
    pub telemetry_enabled: Option<bool>,
    pub nats_url: Option<String>,
}

/// Flag value, else file value, else default, with where it came from.
fn pick<T>(flag: Option<T>, file: Option<T>, default: impl FnOnce() -> T) -> ConfigValue<T> {
    match (flag, file) {
        (Some(value), _) => ConfigValue {
            value,
            source: ConfigSource::Override,
        },
        (None, Some(value)) => ConfigValue {
            value,
            source: ConfigSource::ConfigFile,
        },
        (None, None) => ConfigValue {
            value: default(),
            source: ConfigSource::Default,
        },
    }
}

#[cfg(test)]
pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path.as_deref().is_some_and(Path::exists);

    let file = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(Path::parent);

    let database_path = match overrides.database_path {
        Some(path) => ConfigValue {
            value: expand_path(path),
            source: ConfigSource::Override,
        },
        None => match file.database_path.as_deref() {
            Some(raw) => ConfigValue {
                value: resolve_path(raw, base_dir),
                source: ConfigSource::ConfigFile,
            },
            None => ConfigValue {
                value: default_database_path().with_context(|| {
                    "failed to resolve default database path; specify --database-path or set database_path in the config file"
                })?,
                source: ConfigSource::Default,
            },
        },
    };

    let job_check_interval_secs = pick(
        overrides.job_check_interval_secs,
        file.job_check_interval_secs,
        || DEFAULT_JOB_CHECK_INTERVAL_SECS,
    );
    if job_check_interval_secs.value == 0 {
        anyhow::bail!("job_check_interval_secs must be at least 1");
    }
    let verbose = pick(overrides.verbose, file.verbose, || false);
    let telemetry_enabled = pick(overrides.telemetry_enabled, file.telemetry.enabled, || false);
    let nats_url = pick(overrides.nats_url, file.telemetry.nats_url, || {
        DEFAULT_NATS_URL.to_string()
    });

    let ssh = ssh_target(file.ssh, base_dir)?;
    let slurm = slurm_settings(file.slurm);
    let telemetry = TelemetrySettings {
        enabled: telemetry_enabled.value,
        nats_url: nats_url.value.clone(),
        subject: file
            .telemetry
            .subject
            .unwrap_or_else(|| DEFAULT_TELEMETRY_SUBJECT.to_string()),
        correlation_cache_capacity: file
            .telemetry
            .correlation_cache_capacity
            .unwrap_or(DEFAULT_CACHE_CAPACITY),
        correlation_cache_ttl: Duration::from_secs(
            file.telemetry
                .correlation_cache_ttl_secs
                .unwrap_or(DEFAULT_CACHE_TTL_SECS),
        ),
        queue_depth: file.telemetry.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
    };
    if telemetry.queue_depth == 0 {
        anyhow::bail!("telemetry.queue_depth must be at least 1");
    }
    let version_tag = file
        .correlation
        .version_tag
        .unwrap_or_else(|| DEFAULT_VERSION_TAG.to_string());

    let config = Config {
        database_path: database_path.value.clone(),
        job_check_interval_secs: job_check_interval_secs.value,
        verbose: verbose.value,
        ssh,
        slurm,
        telemetry,
        version_tag,
        config_path: config_path.clone(),
    };
    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        database_path,
        job_check_interval_secs,
        verbose,
        telemetry_enabled,
        nats_url,
    };
    Ok(LoadResult { config, report })
}

fn ssh_target(file: FileSsh, base_dir: Option<&Path>) -> Result<SshTarget> {
    let host = file
        .host
        .filter(|h| !h.trim().is_empty())
        .context("ssh.host must be set in the config file")?;
    let username = file
        .username
        .filter(|u| !u.trim().is_empty())
        .context("ssh.username must be set in the config file")?;
    let identity_path = match file.identity_path.as_deref() {
        Some(raw) => Some(resolve_path(raw, base_dir)),
        None => default_identity_path(),
    };
    Ok(SshTarget {
        host,
        port: file.port.unwrap_or(DEFAULT_SSH_PORT),
        username,
        identity_path,
        known_hosts_path: file
            .known_hosts_path
            .as_deref()
            .map(|raw| resolve_path(raw, base_dir)),
        learn_unknown_hosts: file.learn_unknown_hosts.unwrap_or(false),
        keepalive_secs: file.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS),
    })
}

fn slurm_settings(file: FileSlurm) -> SlurmSettings {
    let defaults = SlurmSettings::default();
    SlurmSettings {
        partition: file.partition,
        qos: file.qos,
        node_list: file.node_list,
        log_base_path: file.log_base_path.unwrap_or(defaults.log_base_path),
        submit_base_path: file.submit_base_path.unwrap_or(defaults.submit_base_path),
        repo_base_path: file.repo_base_path.unwrap_or(defaults.repo_base_path),
        image_base_path: file.image_base_path.unwrap_or(defaults.image_base_path),
        dataset_base_path: file.dataset_base_path.unwrap_or(defaults.dataset_base_path),
        experiment_base_path: file
            .experiment_base_path
            .unwrap_or(defaults.experiment_base_path),
        sbatch_command: file.sbatch_command.unwrap_or(defaults.sbatch_command),
        squeue_command: file.squeue_command.unwrap_or(defaults.squeue_command),
        sacct_command: file.sacct_command.unwrap_or(defaults.sacct_command),
    }
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME).join(DATABASE_FILE_NAME))
}

fn default_identity_path() -> Option<PathBuf> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    DEFAULT_IDENTITY_FILES
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const MINIMAL: &str = "[ssh]\nhost = \"login.cluster\"\nusername = \"hpc\"\n";

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn clear(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                match &self.prev {
                    Some(value) => std::env::set_var(self.key, value),
                    None => std::env::remove_var(self.key),
                }
            }
        }
    }

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        let config_path = config_dir.join("relay.toml");
        fs::write(&config_path, body).unwrap();
        config_path
    }

    #[test]
    fn missing_optional_config_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let cfg = read_config_file(&dir.path().join("missing.toml"), false).unwrap();
        assert!(cfg.database_path.is_none());
        assert!(cfg.ssh.host.is_none());
    }

    #[test]
    fn missing_required_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let err = read_config_file(&dir.path().join("missing.toml"), true).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn ssh_host_is_required() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"relay.sqlite\"\n");
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("ssh.host"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &format!("{MINIMAL}[slurm]\npartiton = \"gpu\"\n"));
        assert!(load(Some(path), Overrides::default()).is_err());
    }

    #[test]
    fn defaults_fill_everything_but_the_login() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &format!("database_path = \"db/relay.sqlite\"\n{MINIMAL}"));
        let config = load(Some(path), Overrides::default()).unwrap();
        assert_eq!(config.job_check_interval_secs, DEFAULT_JOB_CHECK_INTERVAL_SECS);
        assert_eq!(config.ssh.port, 22);
        assert!(!config.ssh.learn_unknown_hosts);
        assert_eq!(config.slurm, SlurmSettings::default());
        assert!(!config.telemetry.enabled);
        assert_eq!(config.telemetry.subject, DEFAULT_TELEMETRY_SUBJECT);
        assert_eq!(config.telemetry.correlation_cache_capacity, 1024);
        assert_eq!(config.telemetry.correlation_cache_ttl, Duration::from_secs(600));
        assert_eq!(config.version_tag, "v1");
    }

    #[test]
    fn relative_paths_resolve_from_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "database_path = \"db/relay.sqlite\"\n{MINIMAL}identity_path = \"keys/id\"\nknown_hosts_path = \"/etc/ssh/known_hosts\"\n"
            ),
        );
        let config_dir = path.parent().unwrap().to_path_buf();
        let config = load(Some(path.clone()), Overrides::default()).unwrap();
        assert_eq!(config.database_path, config_dir.join("db").join("relay.sqlite"));
        assert_eq!(config.ssh.identity_path, Some(config_dir.join("keys").join("id")));
        assert_eq!(
            config.ssh.known_hosts_path,
            Some(PathBuf::from("/etc/ssh/known_hosts"))
        );
        assert_eq!(config.config_path, Some(path));
    }

    #[test]
    fn sections_are_read() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
database_path = "relay.sqlite"
job_check_interval_secs = 9
verbose = true

[ssh]
host = "login.cluster"
port = 2222
username = "hpc"
learn_unknown_hosts = true
keepalive_secs = 10

[slurm]
partition = "gpu"
log_base_path = "/scratch/logs"
sacct_command = "/opt/slurm/bin/sacct"

[telemetry]
enabled = true
nats_url = "nats://bus:4222"
subject = "jobs.telemetry"
correlation_cache_ttl_secs = 30
queue_depth = 8

[correlation]
version_tag = "v7"
"#,
        );
        let config = load(Some(path), Overrides::default()).unwrap();
        assert_eq!(config.job_check_interval_secs, 9);
        assert!(config.verbose);
        assert_eq!(config.ssh.port, 2222);
        assert!(config.ssh.learn_unknown_hosts);
        assert_eq!(config.slurm.partition.as_deref(), Some("gpu"));
        assert_eq!(config.slurm.log_base_path, "/scratch/logs");
        assert_eq!(config.slurm.sacct_command, "/opt/slurm/bin/sacct");
        assert_eq!(config.slurm.squeue_command, "squeue");
        assert!(config.telemetry.enabled);
        assert_eq!(config.telemetry.nats_url, "nats://bus:4222");
        assert_eq!(config.telemetry.subject, "jobs.telemetry");
        assert_eq!(config.telemetry.correlation_cache_ttl, Duration::from_secs(30));
        assert_eq!(config.telemetry.queue_depth, 8);
        assert_eq!(config.version_tag, "v7");

        let ssh = config.ssh.to_ssh_config("10.0.0.5:2222".parse().unwrap());
        assert_eq!(ssh.host, "login.cluster");
        assert_eq!(ssh.keepalive_secs, 10);
    }

    #[test]
    fn overrides_take_precedence_per_field() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "database_path = \"db/from_config.sqlite\"\njob_check_interval_secs = 9\n{MINIMAL}[telemetry]\nenabled = true\n"
            ),
        );
        let config_dir = path.parent().unwrap().to_path_buf();
        let LoadResult { config, report } = load_with_report(
            Some(path),
            Overrides {
                job_check_interval_secs: Some(2),
                telemetry_enabled: Some(false),
                ..Overrides::default()
            },
        )
        .unwrap();

        assert_eq!(
            config.database_path,
            config_dir.join("db").join("from_config.sqlite")
        );
        assert_eq!(report.database_path.source, ConfigSource::ConfigFile);
        assert_eq!(config.job_check_interval_secs, 2);
        assert_eq!(report.job_check_interval_secs.source, ConfigSource::Override);
        assert!(!config.telemetry.enabled);
        assert_eq!(report.nats_url.source, ConfigSource::Default);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        let err = load(
            Some(path),
            Overrides {
                job_check_interval_secs: Some(0),
                database_path: Some(PathBuf::from("relay.sqlite")),
                ..Overrides::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("job_check_interval_secs"));
    }

    #[test]
    fn ensure_database_dir_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("relay.sqlite");
        ensure_database_dir(&db_path).unwrap();
        assert!(dir.path().join("nested").is_dir());
        ensure_database_dir(Path::new("relay.sqlite")).unwrap();
    }

    #[test]
    fn env_config_path_used_when_no_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let config_path = write_config(&dir, &format!("database_path = \"relay.sqlite\"\n{MINIMAL}"));
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, config_path.to_str().unwrap());

        let LoadResult { config, report } = load_with_report(None, Overrides::default()).unwrap();
        assert_eq!(config.config_path, Some(config_path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Env));
    }

    #[test]
    fn cli_config_path_takes_precedence_over_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("env.toml");
        let cli_path = dir.path().join("cli.toml");
        fs::write(&env_path, format!("job_check_interval_secs = 1\n{MINIMAL}")).unwrap();
        fs::write(&cli_path, format!("job_check_interval_secs = 2\n{MINIMAL}")).unwrap();
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, env_path.to_str().unwrap());

        let LoadResult { config, report } = load_with_report(
            Some(cli_path.clone()),
            Overrides {
                database_path: Some(PathBuf::from("relay.sqlite")),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.job_check_interval_secs, 2);
        assert_eq!(config.config_path, Some(cli_path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Override));
    }
}
