//! CLI argument parsing for tap-clickup.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tap-clickup",
    about = "Incrementally extract ClickUp teams, spaces, lists, tasks and time entries",
    version,
    after_help = "Records and state go to stdout; logs go to stderr unless --log-file is given"
)]
pub struct Cli {
    /// Path to the cursor database (default: ./.clickup-tap/state.db)
    #[arg(short = 's', long, global = true)]
    pub state_db: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Extract streams, writing records and state messages to stdout
    Sync {
        /// Config file (JSON or YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Only extract these streams (repeatable or comma-separated)
        #[arg(long = "stream", value_delimiter = ',')]
        streams: Vec<String>,
    },

    /// List the available streams
    Streams,

    /// Print saved cursors as JSON
    State,

    /// Forget a stream's saved cursor
    Reset {
        /// Stream name
        stream: String,
    },
}
