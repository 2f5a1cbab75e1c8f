mod commands;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "autograder-cli")]
#[command(about = "Autograder CLI - Grade submissions locally and drive course regrades", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a local submission directory with the configured sandbox
    Grade {
        /// Assignment definition (JSON)
        #[arg(short, long)]
        assignment: PathBuf,

        /// Directory holding the submission files
        #[arg(short, long)]
        submission: PathBuf,

        /// User the submission belongs to
        #[arg(short, long, default_value = "local@localhost")]
        user: String,

        /// Submission message
        #[arg(short, long, default_value = "")]
        message: String,

        /// Write the grading report as JSON to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Queue a regrade of an assignment for the worker
    Regrade {
        /// Assignment definition (JSON)
        #[arg(short, long)]
        assignment: PathBuf,

        /// Emails or roles to regrade, `*` for everyone (defaults to students)
        #[arg(short, long = "select")]
        select: Vec<String>,

        /// Block until every selected user is regraded
        #[arg(short, long, default_value = "false")]
        wait: bool,

        /// Operator recorded as proxy user on the new submissions
        #[arg(short, long)]
        requested_by: Option<String>,

        /// Treat submissions recorded at or after this RFC 3339 time as already regraded
        #[arg(long)]
        after: Option<DateTime<Utc>>,

        /// How long to poll for the result, 0 to return right after queueing
        #[arg(long, default_value = "0")]
        poll_secs: u64,
    },

    /// Print a stored regrade result
    Result {
        /// Regrade request id
        #[arg(short, long)]
        id: Uuid,
    },

    /// Add or update a user in a course roster
    Enroll {
        #[arg(short, long)]
        course: String,

        #[arg(short, long)]
        user: String,

        /// owner, admin, grader, student or other
        #[arg(short, long, default_value = "student")]
        role: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_some() {
        autograder_common::telemetry::init_tracing();
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Grade {
            assignment,
            submission,
            user,
            message,
            out,
        } => {
            commands::grade_local(&assignment, &submission, &user, &message, out.as_deref()).await?;
        }
        Commands::Regrade {
            assignment,
            select,
            wait,
            requested_by,
            after,
            poll_secs,
        } => {
            commands::queue_regrade(&assignment, select, wait, requested_by, after, poll_secs).await?;
        }
        Commands::Result { id } => {
            commands::show_result(&id).await?;
        }
        Commands::Enroll { course, user, role } => {
            commands::enroll(&course, &user, &role).await?;
        }
    }

    Ok(())
}
