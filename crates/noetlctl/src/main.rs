//! NoETL control plane CLI.
//!
//! Thin client over the control plane REST API: register playbooks, start
//! executions, and inspect executions, events, and the job queue.
//!
//! Exit codes: 0 on success, 2 on invalid arguments (clap), 1 otherwise.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use base64::prelude::*;
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::json;

#[derive(Parser)]
#[command(name = "noetl")]
#[command(version, about = "NoETL Command Line Tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// NoETL server URL
    #[arg(long, env = "NOETL_SERVER_URL", default_value = "http://localhost:8082")]
    server_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a playbook YAML file in the catalog
    Register {
        /// Path to the playbook YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Resource type fallback when the document has no kind
        #[arg(long, default_value = "Playbook")]
        resource_type: String,
    },

    /// Start a playbook execution
    Execute {
        /// Catalog path of the playbook
        #[arg(value_name = "PATH")]
        path: String,

        /// Playbook version (default: latest)
        #[arg(short = 'V', long)]
        version: Option<String>,

        /// Input payload as JSON (merged over the playbook workload)
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
    },

    /// Show a projected execution view
    Status {
        /// Execution ID
        #[arg(value_name = "EXECUTION_ID")]
        execution_id: i64,
    },

    /// Print the event log of an execution
    Events {
        /// Execution ID
        #[arg(value_name = "EXECUTION_ID")]
        execution_id: i64,

        /// Filter by event type
        #[arg(long)]
        event_type: Option<String>,
    },

    /// Count queue entries by status
    QueueSize {
        /// Queue status to count
        #[arg(long, default_value = "queued")]
        status: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::new();
    let base = cli.server_url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Register {
            file,
            resource_type,
        } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let response = client
                .post(format!("{}/api/catalog/register", base))
                .json(&json!({
                    "content": BASE64_STANDARD.encode(&content),
                    "resource_type": resource_type,
                }))
                .send()
                .await
                .context("Request failed")?;

            print_response(response).await
        }

        Commands::Execute {
            path,
            version,
            payload,
        } => {
            let payload: serde_json::Value = match payload {
                Some(raw) => serde_json::from_str(&raw).context("Invalid payload JSON")?,
                None => json!({}),
            };

            let mut body = json!({"path": path, "payload": payload});
            if let Some(version) = version {
                body["version"] = json!(version);
            }

            let response = client
                .post(format!("{}/api/execute", base))
                .json(&body)
                .send()
                .await
                .context("Request failed")?;

            print_response(response).await
        }

        Commands::Status { execution_id } => {
            let response = client
                .get(format!("{}/api/executions/{}", base, execution_id))
                .send()
                .await
                .context("Request failed")?;

            print_response(response).await
        }

        Commands::Events {
            execution_id,
            event_type,
        } => {
            let mut request = client.get(format!(
                "{}/api/events/by-execution/{}",
                base, execution_id
            ));
            if let Some(event_type) = event_type {
                request = request.query(&[("event_type", event_type)]);
            }

            let response = request.send().await.context("Request failed")?;
            print_response(response).await
        }

        Commands::QueueSize { status } => {
            let response = client
                .get(format!("{}/api/queue/size", base))
                .query(&[("status", status)])
                .send()
                .await
                .context("Request failed")?;

            print_response(response).await
        }
    }
}

/// Pretty-print a JSON response, failing on error statuses.
async fn print_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .unwrap_or_else(|_| json!({"error": "non-JSON response"}));

    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        anyhow::bail!("Server returned {}", status);
    }

    Ok(())
}
