use clap::{Parser, Subcommand};

/// Config monitor CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "config-monitor",
    version,
    about = "Periodic cloud configuration scanning, change history and auditing"
)]
pub struct Cli {
    /// Database URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Default scan interval in seconds
    #[arg(long, global = true)]
    pub scan_interval: Option<u64>,

    /// Tasks allowed to run at the same time
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// HTTP API port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Register the in-memory demo adapters instead of real ones
    #[arg(long, global = true)]
    pub demo: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler, worker and HTTP API (default)
    Serve,

    /// Scan now and exit
    Scan {
        /// Account names; all schedulable accounts when omitted
        #[arg(long = "account")]
        accounts: Vec<String>,

        /// Technologies; all registered watchers when omitted
        #[arg(long = "technology")]
        technologies: Vec<String>,
    },

    /// Run the catch-up audit now and exit
    Audit {
        /// Account names; all schedulable accounts when omitted
        #[arg(long = "account")]
        accounts: Vec<String>,
    },

    /// Delete expired exception records and exit
    ExpireExceptions,

    /// Register an account to monitor
    AddAccount {
        /// Display name, used to address the account everywhere else
        #[arg(long)]
        name: String,

        /// Provider account identifier, e.g. a 12-digit AWS account id
        #[arg(long)]
        identifier: String,

        #[arg(long, default_value = "AWS")]
        account_type: String,

        /// Record the account but never schedule it
        #[arg(long)]
        third_party: bool,

        #[arg(long)]
        inactive: bool,

        #[arg(long)]
        notes: Option<String>,
    },
}
