//! Coderelay CLI — manage triggers, workflows, and executions.
//!
//! Reuses the same core domain logic (coderelay-core) and server bootstrap
//! (coderelay-server) that back the HTTP API.

mod commands;

use clap::{Parser, Subcommand};

/// Coderelay — trigger-driven orchestration for coding-agent CLIs
#[derive(Parser)]
#[command(name = "coderelay", version, about)]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "CODERELAY_DB_PATH", default_value = "coderelay.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Coderelay HTTP backend server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, default_value_t = 3420)]
        port: u16,
    },

    /// Manage backend accounts
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Manage triggers
    Trigger {
        #[command(subcommand)]
        action: TriggerAction,
    },

    /// Manage workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Inspect and control executions
    Execution {
        #[command(subcommand)]
        action: ExecutionAction,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    /// List configured accounts
    List,
    /// Add an account
    Add {
        /// Display name
        #[arg(long)]
        name: String,
        /// Backend kind: claude-code | codex | opencode
        #[arg(long)]
        backend: String,
        /// Environment variable holding the API key
        #[arg(long)]
        api_key_env: Option<String>,
        /// Model override
        #[arg(long)]
        model: Option<String>,
    },
    /// Remove an account
    Remove { id: String },
}

#[derive(Subcommand)]
enum TriggerAction {
    /// List triggers
    List,
    /// Fire a trigger with a JSON payload and stream the result
    Fire {
        id: String,
        /// JSON payload passed to the prompt template
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List workflows
    List,
    /// Import a workflow definition from a YAML file
    Import { path: String },
    /// Run a workflow to completion
    Run {
        id: String,
        /// JSON payload for the root nodes
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List recent executions
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one execution
    Status { id: String },
    /// Request cooperative cancellation
    Cancel { id: String },
    /// Print the durable log archive
    Logs { id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // `serve` installs its own subscriber inside start_server.
    if !matches!(cli.command, Commands::Serve { .. }) {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "coderelay_core=warn".into()),
            )
            .init();
    }

    let result = match cli.command {
        Commands::Serve { host, port } => commands::serve(host, port, cli.db).await,
        Commands::Account { action } => match action {
            AccountAction::List => commands::account_list(&cli.db).await,
            AccountAction::Add {
                name,
                backend,
                api_key_env,
                model,
            } => commands::account_add(&cli.db, name, backend, api_key_env, model).await,
            AccountAction::Remove { id } => commands::account_remove(&cli.db, &id).await,
        },
        Commands::Trigger { action } => match action {
            TriggerAction::List => commands::trigger_list(&cli.db).await,
            TriggerAction::Fire { id, payload } => {
                commands::trigger_fire(&cli.db, &id, &payload).await
            }
        },
        Commands::Workflow { action } => match action {
            WorkflowAction::List => commands::workflow_list(&cli.db).await,
            WorkflowAction::Import { path } => commands::workflow_import(&cli.db, &path).await,
            WorkflowAction::Run { id, payload } => {
                commands::workflow_run(&cli.db, &id, &payload).await
            }
        },
        Commands::Execution { action } => match action {
            ExecutionAction::List { limit } => commands::execution_list(&cli.db, limit).await,
            ExecutionAction::Status { id } => commands::execution_status(&cli.db, &id).await,
            ExecutionAction::Cancel { id } => commands::execution_cancel(&cli.db, &id).await,
            ExecutionAction::Logs { id } => commands::execution_logs(&cli.db, &id).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
