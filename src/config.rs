use anyhow::{Context, Result, ensure};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::services::registry::SessionPolicy;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub chunk_size: u64,
    pub max_upload_size: u64,
    pub session_ttl_secs: u64,
    pub reap_interval_secs: u64,
    pub append_timeout_secs: u64,
}

/// What the process was asked to do.
#[derive(Debug, Clone)]
pub enum RunMode {
    Serve,
    Migrate,
    Push(PushArgs),
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked upload service")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where partial and finished objects live (overrides UPLOAD_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Chunk size handed out when the client has no preference (overrides UPLOAD_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Largest accepted upload in bytes (overrides UPLOAD_MAX_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<u64>,

    /// Seconds an idle session stays resumable (overrides UPLOAD_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Seconds between reaper sweeps (overrides UPLOAD_REAP_INTERVAL_SECS)
    #[arg(long)]
    pub reap_interval_secs: Option<u64>,

    /// Seconds a single chunk append may take (overrides UPLOAD_APPEND_TIMEOUT_SECS)
    #[arg(long)]
    pub append_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a local file to a running server.
    Push(PushArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct PushArgs {
    /// File to upload
    pub file: PathBuf,

    /// Base URL of the upload server
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    pub server: String,

    /// Principal id sent in x-principal-id
    #[arg(long)]
    pub principal: String,

    /// Send the elevated role header
    #[arg(long)]
    pub admin: bool,

    #[arg(long, default_value = "application/octet-stream")]
    pub mime_type: String,

    /// Name stored in the catalog; defaults to the file's name
    #[arg(long)]
    pub name: Option<String>,

    /// Destination folder id
    #[arg(long)]
    pub folder: Option<String>,

    /// Continue an interrupted session instead of opening a new one
    #[arg(long)]
    pub resume: Option<String>,

    /// Chunk size to propose at init
    #[arg(long, default_value_t = 5 * 1024 * 1024)]
    pub chunk_size: u64,

    /// Initial number of chunks in flight
    #[arg(long, default_value_t = 2)]
    pub parallelism: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::resolve(Args::parse())
    }

    fn resolve(args: Args) -> Result<(Self, RunMode)> {
        let defaults = SessionPolicy::default();

        // --- Merge CLI over environment ---
        let cfg = Self {
            host: args.host.map_or_else(|| env_or("UPLOAD_HOST", "0.0.0.0".to_string()), Ok)?,
            port: args.port.map_or_else(|| env_or("UPLOAD_PORT", 3000), Ok)?,
            storage_dir: args
                .storage_dir
                .map_or_else(|| env_or("UPLOAD_STORAGE_DIR", "./data/objects".to_string()), Ok)?,
            database_url: args.database_url.map_or_else(
                || env_or("UPLOAD_DATABASE_URL", "sqlite://./data/meta/uploads.db".to_string()),
                Ok,
            )?,
            chunk_size: args
                .chunk_size
                .map_or_else(|| env_or("UPLOAD_CHUNK_SIZE", defaults.default_chunk_size), Ok)?,
            max_upload_size: args
                .max_upload_size
                .map_or_else(|| env_or("UPLOAD_MAX_SIZE", defaults.max_upload_size), Ok)?,
            session_ttl_secs: args.session_ttl_secs.map_or_else(
                || env_or("UPLOAD_SESSION_TTL_SECS", defaults.session_ttl.as_secs()),
                Ok,
            )?,
            reap_interval_secs: args
                .reap_interval_secs
                .map_or_else(|| env_or("UPLOAD_REAP_INTERVAL_SECS", 300), Ok)?,
            append_timeout_secs: args
                .append_timeout_secs
                .map_or_else(|| env_or("UPLOAD_APPEND_TIMEOUT_SECS", 30), Ok)?,
        };
        cfg.validate()?;

        let mode = match args.command {
            Some(Command::Push(push)) => RunMode::Push(push),
            None if args.migrate => RunMode::Migrate,
            None => RunMode::Serve,
        };
        Ok((cfg, mode))
    }

    fn validate(&self) -> Result<()> {
        let policy = SessionPolicy::default();
        ensure!(
            (policy.min_chunk_size..=policy.max_chunk_size).contains(&self.chunk_size),
            "chunk size {} outside [{}, {}]",
            self.chunk_size,
            policy.min_chunk_size,
            policy.max_chunk_size
        );
        ensure!(self.max_upload_size > 0, "max upload size must be positive");
        ensure!(self.session_ttl_secs > 0, "session TTL must be positive");
        ensure!(self.reap_interval_secs > 0, "reap interval must be positive");
        ensure!(self.append_timeout_secs > 0, "append timeout must be positive");
        Ok(())
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            default_chunk_size: self.chunk_size,
            max_upload_size: self.max_upload_size,
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            ..SessionPolicy::default()
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn append_timeout(&self) -> Duration {
        Duration::from_secs(self.append_timeout_secs)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(argv: &[&str]) -> Result<(AppConfig, RunMode)> {
        AppConfig::resolve(Args::try_parse_from(argv)?)
    }

    #[test]
    fn cli_flags_override_environment() {
        let (cfg, mode) = resolve(&[
            "resumable-upload",
            "--port",
            "8080",
            "--chunk-size",
            "1048576",
            "--session-ttl-secs",
            "60",
        ])
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.addr(), format!("{}:8080", cfg.host));
        assert!(matches!(mode, RunMode::Serve));

        let policy = cfg.session_policy();
        assert_eq!(policy.default_chunk_size, 1024 * 1024);
        assert_eq!(policy.session_ttl, Duration::from_secs(60));
    }

    #[test]
    fn migrate_flag_selects_migrate_mode() {
        let (_, mode) = resolve(&["resumable-upload", "--migrate", "--chunk-size", "1048576"]).unwrap();
        assert!(matches!(mode, RunMode::Migrate));
    }

    #[test]
    fn push_subcommand_parses() {
        let (_, mode) = resolve(&[
            "resumable-upload",
            "--chunk-size",
            "1048576",
            "push",
            "movie.mp4",
            "--principal",
            "alice",
            "--resume",
            "abc123",
        ])
        .unwrap();
        let RunMode::Push(push) = mode else {
            panic!("expected push mode");
        };
        assert_eq!(push.file, PathBuf::from("movie.mp4"));
        assert_eq!(push.principal, "alice");
        assert_eq!(push.resume.as_deref(), Some("abc123"));
        assert_eq!(push.server, "http://127.0.0.1:3000");
        assert_eq!(push.parallelism, 2);
    }

    #[test]
    fn rejects_chunk_size_outside_policy() {
        let err = resolve(&["resumable-upload", "--chunk-size", "1"]).unwrap_err();
        assert!(err.to_string().contains("chunk size"));
    }
}
