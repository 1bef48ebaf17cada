use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "campus",
    about = "Follow courses, forum threads, and live updates from your terminal",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "CAMPUS_SERVER",
        default_value = "https://api.campus.sh",
        help = "Base URL for the campus platform API"
    )]
    pub server: String,

    #[arg(
        long,
        global = true,
        env = "CAMPUS_ACCESS_TOKEN",
        hide_env_values = true,
        help = "Bearer token for authenticated calls"
    )]
    pub access_token: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "CAMPUS_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "CAMPUS_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Follow a forum thread and print replies as they arrive
    Watch {
        /// Thread id to follow
        thread_id: String,
    },
    /// Post a reply to a forum thread
    Reply {
        /// Thread id to reply to
        thread_id: String,
        /// Reply text; omit to resume a saved draft
        message: Option<String>,
    },
    /// Edit your course notes (optimistic concurrency)
    Notes {
        /// Course id whose notes to edit
        course_id: String,
        /// New notes body
        body: String,
        /// Overwrite a conflicting concurrent edit without asking
        #[arg(long)]
        force: bool,
    },
}
