use anyhow::{Context, Result, bail};
use clap::Parser;
use cos_rename::services::{rename_engine::EngineOptions, retry::RetryPolicy};
use std::{env, fmt, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub secret_id: String,
    pub secret_key: String,
    pub concurrency: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub job_timeout_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Bulk COS object rename service")]
pub struct Args {
    /// Host to bind to (overrides COS_RENAME_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides COS_RENAME_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides COS_RENAME_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides COS_RENAME_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Objects renamed at once per job (overrides COS_RENAME_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Seconds before a running job is canceled (overrides COS_RENAME_JOB_TIMEOUT_SECS)
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn required_env(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        Ok(_) | Err(env::VarError::NotPresent) => bail!("{} must be set", name),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => env_or("COS_RENAME_HOST", "0.0.0.0".to_string())?,
            },
            port: match args.port {
                Some(port) => port,
                None => env_or("COS_RENAME_PORT", 3000)?,
            },
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => env_or("COS_RENAME_STORAGE_DIR", "./data/objects".to_string())?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => env_or(
                    "COS_RENAME_DATABASE_URL",
                    "sqlite://./data/meta/cos_rename.db".to_string(),
                )?,
            },
            secret_id: required_env("TENCENTCLOUD_SECRETID")?,
            secret_key: required_env("TENCENTCLOUD_SECRETKEY")?,
            concurrency: match args.concurrency {
                Some(concurrency) => concurrency,
                None => env_or("COS_RENAME_CONCURRENCY", 3)?,
            },
            retry_attempts: env_or("COS_RENAME_RETRY_ATTEMPTS", 3)?,
            retry_delay_ms: env_or("COS_RENAME_RETRY_DELAY_MS", 500)?,
            job_timeout_secs: match args.job_timeout_secs {
                Some(secs) => secs,
                None => env_or("COS_RENAME_JOB_TIMEOUT_SECS", 600)?,
            },
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            concurrency: self.concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                delay: Duration::from_millis(self.retry_delay_ms),
            },
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"***")
            .field("concurrency", &self.concurrency)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("job_timeout_secs", &self.job_timeout_secs)
            .finish()
    }
}
