mod commands;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use testbay_common::backends::Backends;
use testbay_common::config::Config;

#[derive(Parser)]
#[command(name = "testbay-cli")]
#[command(about = "testbay CLI - Manage test cases, submit runs and inspect queues", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a test case
    CreateCase {
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        task_id: String,

        /// Execution image the worker runs the tests in
        #[arg(short, long)]
        docker_image: String,

        /// Counted runs allowed per user (0-100)
        #[arg(short, long, default_value = "5")]
        max_runs: u32,

        #[arg(long, default_value = "group")]
        claim_name: String,

        #[arg(long)]
        claim_value: String,

        /// Admin creating the case
        #[arg(long)]
        created_by: String,
    },

    /// Replace every editable field of a test case
    UpdateCase {
        #[arg(long)]
        id: String,

        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        task_id: String,

        #[arg(short, long)]
        docker_image: String,

        #[arg(short, long)]
        max_runs: u32,

        #[arg(long, default_value = "group")]
        claim_name: String,

        #[arg(long)]
        claim_value: String,
    },

    /// List the most recent test cases
    ListCases {
        #[arg(short, long)]
        task_id: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Upload a source file and request a test run for it
    Submit {
        /// Source file to test
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long)]
        user: String,

        #[arg(long)]
        test_case_id: String,

        #[arg(long)]
        task_id: String,

        #[arg(long)]
        submission_id: String,

        #[arg(long)]
        task_name: String,

        #[arg(long)]
        test_case_name: String,

        /// Do not consume the user's quota
        #[arg(long, default_value = "false")]
        uncounted: bool,
    },

    /// Show one run, with results once finished
    Status {
        #[arg(short, long)]
        user: String,

        #[arg(long)]
        id: String,
    },

    /// List the most recent runs
    List {
        #[arg(short, long)]
        user: Option<String>,

        #[arg(short, long)]
        submission_id: Option<String>,

        #[arg(short, long)]
        task_id: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Counted runs of a user for a test case
    Count {
        #[arg(short, long)]
        user: String,

        #[arg(long)]
        test_case_id: String,
    },

    /// Include or exclude a run from quota accounting
    SetCounted {
        #[arg(long)]
        id: String,

        #[arg(long, action = ArgAction::Set)]
        counted: bool,
    },

    /// Take one work message off the request queue and print the work order
    Receive {
        /// Queue name (defaults to TEST_REQUESTS_QUEUE)
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Show the number of ready messages in a queue
    Depth {
        #[arg(short, long)]
        queue: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let backends = Backends::connect(&config).await?;

    match cli.command {
        Commands::CreateCase {
            name,
            task_id,
            docker_image,
            max_runs,
            claim_name,
            claim_value,
            created_by,
        } => {
            commands::create_case(
                &backends,
                commands::CaseFields {
                    name,
                    task_id,
                    docker_image,
                    max_runs,
                    claim_name,
                    claim_value,
                },
                &created_by,
            )
            .await?;
        }
        Commands::UpdateCase {
            id,
            name,
            task_id,
            docker_image,
            max_runs,
            claim_name,
            claim_value,
        } => {
            commands::update_case(
                &backends,
                &id,
                commands::CaseFields {
                    name,
                    task_id,
                    docker_image,
                    max_runs,
                    claim_name,
                    claim_value,
                },
            )
            .await?;
        }
        Commands::ListCases { task_id, limit } => {
            commands::list_cases(&backends, task_id.as_deref(), limit).await?;
        }
        Commands::Submit {
            file,
            user,
            test_case_id,
            task_id,
            submission_id,
            task_name,
            test_case_name,
            uncounted,
        } => {
            let source = std::fs::read(&file)?;
            commands::submit(
                &backends,
                commands::Submission {
                    user,
                    test_case_id,
                    task_id,
                    submission_id,
                    task_name,
                    test_case_name,
                    counted: !uncounted,
                },
                &source,
            )
            .await?;
        }
        Commands::Status { user, id } => {
            commands::status(&backends, &user, &id).await?;
        }
        Commands::List {
            user,
            submission_id,
            task_id,
            limit,
        } => {
            commands::list_runs(&backends, user, submission_id, task_id, limit).await?;
        }
        Commands::Count { user, test_case_id } => {
            commands::count(&backends, &user, &test_case_id).await?;
        }
        Commands::SetCounted { id, counted } => {
            commands::set_counted(&backends, &id, counted).await?;
        }
        Commands::Receive { queue } => {
            commands::receive(&backends, queue.as_deref()).await?;
        }
        Commands::Depth { queue } => {
            commands::depth(&backends, queue.as_deref()).await?;
        }
    }

    Ok(())
}
