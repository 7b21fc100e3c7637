use std::env;
use std::time::Duration;

use crate::cli::Cli;
use crate::queue::WorkerConfig;
use crate::scheduler::ScheduleConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub scan_interval_seconds: u64,
    pub audit_interval_seconds: u64,
    pub exception_retention_days: i64,
    pub exception_sweep_interval_seconds: u64,
    pub worker_concurrency: usize,
    pub api_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::with_database_url(env::var("DATABASE_URL").ok())
    }

    /// Environment plus command-line overrides. `--database-url` stands in
    /// for a missing `DATABASE_URL`.
    pub fn load(cli: &Cli) -> Result<Self, String> {
        let database_url = cli
            .database_url
            .clone()
            .or_else(|| env::var("DATABASE_URL").ok());
        Self::with_database_url(database_url)?.apply_cli(cli)
    }

    fn with_database_url(database_url: Option<String>) -> Result<Self, String> {
        let database_url = database_url.ok_or("DATABASE_URL is required")?;

        Self {
            database_url,
            scan_interval_seconds: parse_or("SCAN_INTERVAL_SECONDS", 900)?,
            audit_interval_seconds: parse_or("AUDIT_INTERVAL_SECONDS", 86_400)?,
            exception_retention_days: parse_or("EXCEPTION_RETENTION_DAYS", 7)?,
            exception_sweep_interval_seconds: parse_or("EXCEPTION_SWEEP_INTERVAL_SECONDS", 3_600)?,
            worker_concurrency: parse_or("WORKER_CONCURRENCY", 4)?,
            api_port: parse_or("API_PORT", 8080)?,
        }
        .validated()
    }

    fn apply_cli(mut self, cli: &Cli) -> Result<Self, String> {
        if let Some(url) = &cli.database_url {
            self.database_url = url.clone();
        }
        if let Some(seconds) = cli.scan_interval {
            self.scan_interval_seconds = seconds;
        }
        if let Some(concurrency) = cli.concurrency {
            self.worker_concurrency = concurrency;
        }
        if let Some(port) = cli.port {
            self.api_port = port;
        }
        self.validated()
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            scan_interval: Duration::from_secs(self.scan_interval_seconds),
            audit_interval: Duration::from_secs(self.audit_interval_seconds),
            exception_sweep_interval: Duration::from_secs(self.exception_sweep_interval_seconds),
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency,
            ..WorkerConfig::default()
        }
    }

    pub fn exception_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.exception_retention_days)
    }

    fn validated(self) -> Result<Self, String> {
        if self.scan_interval_seconds == 0
            || self.audit_interval_seconds == 0
            || self.exception_sweep_interval_seconds == 0
        {
            return Err("Scheduling intervals must be greater than zero".to_string());
        }
        if self.worker_concurrency == 0 {
            return Err("WORKER_CONCURRENCY must be at least 1".to_string());
        }
        if self.exception_retention_days < 0 {
            return Err("EXCEPTION_RETENTION_DAYS must not be negative".to_string());
        }
        Ok(self)
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            database_url: "sqlite::memory:".into(),
            scan_interval_seconds: 900,
            audit_interval_seconds: 86_400,
            exception_retention_days: 7,
            exception_sweep_interval_seconds: 3_600,
            worker_concurrency: 4,
            api_port: 8080,
        }
    }

    #[test]
    fn missing_database_url_is_an_error() {
        assert!(Config::with_database_url(None).is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = Config {
            scan_interval_seconds: 0,
            ..base()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn schedule_converts_seconds() {
        let schedule = base().schedule();
        assert_eq!(schedule.scan_interval, Duration::from_secs(900));
        assert_eq!(schedule.audit_interval, Duration::from_secs(86_400));
    }

    #[test]
    fn cli_overrides_env_values() {
        let cli = Cli {
            database_url: Some("sqlite://other.db".into()),
            scan_interval: Some(60),
            concurrency: None,
            port: Some(9000),
            demo: false,
            command: None,
        };
        let config = base().apply_cli(&cli).unwrap();
        assert_eq!(config.database_url, "sqlite://other.db");
        assert_eq!(config.scan_interval_seconds, 60);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.api_port, 9000);
    }
}
