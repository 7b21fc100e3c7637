// Library root: exposes internal modules for integration tests in `tests/`.
// Production entry point remains `src/main.rs`.

pub mod adapters;
pub mod api;
pub mod db;
pub mod error;
pub mod exceptions;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod scheduler;

// Binary-facing modules, public so `main.rs` and tests share one build.
pub mod cli;
pub mod config;
pub mod logging;
