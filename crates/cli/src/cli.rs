//! Command-line interface definition

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use keel_migrate::{MigrationId, RevertTarget};

use crate::config::{parse_lock_timeout, LogFormat, Settings};

#[derive(Parser, Debug)]
#[command(name = "migrate")]
#[command(about = "Apply, revert, and inspect database schema migrations")]
#[command(version)]
pub struct Cli {
    /// Database URL (overrides DATABASE_URL and DB_* variables)
    #[arg(long, global = true, value_name = "URL")]
    pub database_url: Option<String>,

    /// Ledger table name (overrides MIGRATIONS_TABLE)
    #[arg(long, global = true, value_name = "TABLE")]
    pub ledger_table: Option<String>,

    /// Seconds to wait for the migration lock before giving up
    #[arg(long, global = true, value_name = "SECS", value_parser = parse_lock_timeout)]
    pub lock_timeout: Option<Duration>,

    /// Log output format: text or json (overrides LOG_FORMAT)
    #[arg(long, global = true, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply pending migrations
    Up {
        /// Stop after applying this migration
        #[arg(long, value_name = "ID")]
        to: Option<MigrationId>,
    },

    /// Revert applied migrations (one step by default)
    Down(DownArgs),

    /// Show migration status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Insert sample data once all migrations are applied
    Seed,

    /// Create a new SQL migration template
    New {
        /// Migration name
        name: String,

        /// Directory to write the template into
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
#[group(multiple = false)]
pub struct DownArgs {
    /// Number of most recently applied migrations to revert
    #[arg(long, value_name = "N")]
    pub steps: Option<usize>,

    /// Revert every migration applied after this one
    #[arg(long, value_name = "ID")]
    pub to: Option<MigrationId>,

    /// Revert every applied migration
    #[arg(long)]
    pub all: bool,
}

impl DownArgs {
    pub fn target(&self) -> RevertTarget {
        match (self.steps, self.to, self.all) {
            (_, _, true) => RevertTarget::All,
            (_, Some(id), _) => RevertTarget::To(id),
            (Some(n), _, _) => RevertTarget::Steps(n),
            (None, None, false) => RevertTarget::default(),
        }
    }
}

impl Cli {
    /// Apply command-line flags on top of environment settings
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(url) = &self.database_url {
            settings.database_url = url.clone();
        }
        if let Some(table) = &self.ledger_table {
            settings.ledger_table = table.clone();
        }
        if let Some(timeout) = self.lock_timeout {
            settings.lock_timeout = Some(timeout);
        }
        if let Some(format) = self.log_format {
            settings.log_format = format;
        }
    }
}
