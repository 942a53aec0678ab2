//! Command-line interface.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "jobline-worker")]
#[command(author, version, about = "Job worker and operator tools for jobline")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Consume jobs until interrupted (the default)
    Run,

    /// Create a job and publish it to the queue
    Enqueue {
        /// Owner of the job
        #[arg(short, long)]
        owner: String,

        /// Job input as JSON, e.g. '{"prompt": "Summarize ..."}'
        #[arg(short, long)]
        input: String,

        /// Scheduling priority (higher runs first)
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
    },

    /// Show one job
    Get {
        /// Job id
        id: i64,
    },

    /// List an owner's jobs, newest first
    List {
        /// Owner of the jobs
        #[arg(short, long)]
        owner: String,
    },

    /// Show the highest-priority QUEUED job
    Next,

    /// Apply a status change to a job
    SetStatus {
        /// Job id
        id: i64,

        /// Target status (QUEUED, PROCESSING, COMPLETED, FAILED)
        #[arg(short, long)]
        status: String,

        /// Result payload as JSON (required for COMPLETED)
        #[arg(short, long)]
        result: Option<String>,

        /// Error message (required for FAILED)
        #[arg(short, long)]
        error: Option<String>,
    },

    /// Republish QUEUED jobs that were never delivered
    Reconcile {
        /// Minimum age in seconds (default: JOB_STALE_AFTER_SECS)
        #[arg(long)]
        stale_after_secs: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_run() {
        let cli = Cli::try_parse_from(["jobline-worker"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "jobline-worker",
            "enqueue",
            "--owner",
            "42",
            "--input",
            r#"{"prompt":"hi"}"#,
            "--priority",
            "7",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Some(Command::Enqueue {
                owner: "42".into(),
                input: r#"{"prompt":"hi"}"#.into(),
                priority: 7,
            })
        );
    }

    #[test]
    fn test_parse_set_status() {
        let cli = Cli::try_parse_from([
            "jobline-worker",
            "set-status",
            "5",
            "--status",
            "FAILED",
            "--error",
            "operator cancelled",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Some(Command::SetStatus {
                id: 5,
                status: "FAILED".into(),
                result: None,
                error: Some("operator cancelled".into()),
            })
        );
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
