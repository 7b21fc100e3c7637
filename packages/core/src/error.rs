use std::error::Error;
use std::fmt;

/// Unified process-level error.
///
/// Task failures are already recorded in the exception store by the time
/// they get here; this type only decides how the process reports and exits.
#[derive(Debug)]
pub enum AppError {
    Config(String),
    Database(String),
    Server(String),
    Task(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Config error: {}", msg),
            AppError::Database(msg) => write!(f, "Database error: {}", msg),
            AppError::Server(msg) => write!(f, "Server error: {}", msg),
            AppError::Task(msg) => write!(f, "Task error: {}", msg),
        }
    }
}

impl Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<crate::pipeline::TaskError> for AppError {
    fn from(err: crate::pipeline::TaskError) -> Self {
        AppError::Task(err.detail())
    }
}

impl From<crate::scheduler::SchedulerError> for AppError {
    fn from(err: crate::scheduler::SchedulerError) -> Self {
        AppError::Task(err.to_string())
    }
}

impl From<prometheus::Error> for AppError {
    fn from(err: prometheus::Error) -> Self {
        AppError::Server(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Server(err.to_string())
    }
}
