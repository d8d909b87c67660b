//! kubectl-fence: A kubectl plugin for inspecting node remediations
//!
//! - `kubectl fence list` - List RemediationRequest resources
//! - `kubectl fence status <node>` - Show the remediation progress of one node

use std::process;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use kube::{api::Api, Client, ResourceExt};

use self_fence::crd::{RemediationRequest, CONDITION_PROCESSING};
use self_fence::error::{Error, Result};

#[derive(Parser)]
#[command(name = "kubectl-fence")]
#[command(about = "A kubectl plugin for inspecting node remediations", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "table")]
    output: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Commands {
    /// List RemediationRequest resources
    List {
        /// Show all namespaces
        #[arg(short = 'A', long)]
        all_namespaces: bool,
    },
    /// Show the remediation progress of one node
    Status {
        /// Name of the node (and of its RemediationRequest)
        node_name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::try_default().await.map_err(Error::KubeError)?;
    let namespace = cli.namespace.as_deref().unwrap_or("default");

    match cli.command {
        Commands::List { all_namespaces } => {
            let api: Api<RemediationRequest> = if all_namespaces {
                Api::all(client)
            } else {
                Api::namespaced(client, namespace)
            };
            let requests = api.list(&Default::default()).await?.items;
            match cli.output {
                OutputFormat::Json => println!("{}", format_json(&requests)?),
                OutputFormat::Yaml => println!("{}", format_yaml(&requests)?),
                OutputFormat::Table => {
                    print!("{}", format_table(&requests, all_namespaces, Utc::now()))
                }
            }
        }
        Commands::Status { node_name } => {
            let api: Api<RemediationRequest> = Api::namespaced(client, namespace);
            let rr = api.get_opt(&node_name).await?.ok_or_else(|| {
                Error::ConfigError(format!(
                    "No RemediationRequest for node {} in namespace {}",
                    node_name, namespace
                ))
            })?;
            match cli.output {
                OutputFormat::Json => println!("{}", format_json(&rr)?),
                OutputFormat::Yaml => println!("{}", format_yaml(&rr)?),
                OutputFormat::Table => print!("{}", format_status(&rr, Utc::now())),
            }
        }
    }

    Ok(())
}

fn format_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::ConfigError(format!("JSON serialization error: {}", e)))
}

fn format_yaml<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| Error::ConfigError(format!("YAML serialization error: {}", e)))
}

fn phase_of(rr: &RemediationRequest) -> String {
    rr.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Pending".to_string())
}

/// Remaining wait, "-" when unknown, "elapsed" once passed
fn remaining_of(rr: &RemediationRequest, now: DateTime<Utc>) -> String {
    match rr.remaining_safe_time(now) {
        None => "-".to_string(),
        Some(d) if d.is_zero() => "elapsed".to_string(),
        Some(d) => format!("{}s", d.as_secs()),
    }
}

fn format_table(requests: &[RemediationRequest], show_namespace: bool, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    if show_namespace {
        out.push_str(&format!(
            "{:<30} {:<15} {:<18} {:<20} {:<10}\n",
            "NODE", "NAMESPACE", "STRATEGY", "PHASE", "REMAINING"
        ));
    } else {
        out.push_str(&format!(
            "{:<30} {:<18} {:<20} {:<10}\n",
            "NODE", "STRATEGY", "PHASE", "REMAINING"
        ));
    }
    for rr in requests {
        let strategy = rr.spec.remediation_strategy.to_string();
        if show_namespace {
            out.push_str(&format!(
                "{:<30} {:<15} {:<18} {:<20} {:<10}\n",
                rr.name_any(),
                rr.namespace().unwrap_or_else(|| "default".to_string()),
                strategy,
                phase_of(rr),
                remaining_of(rr, now)
            ));
        } else {
            out.push_str(&format!(
                "{:<30} {:<18} {:<20} {:<10}\n",
                rr.name_any(),
                strategy,
                phase_of(rr),
                remaining_of(rr, now)
            ));
        }
    }
    out
}

fn format_status(rr: &RemediationRequest, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    out.push_str(&format!("Node:             {}\n", rr.name_any()));
    out.push_str(&format!(
        "Namespace:        {}\n",
        rr.namespace().unwrap_or_else(|| "default".to_string())
    ));
    out.push_str(&format!("Strategy:         {}\n", rr.spec.remediation_strategy));
    out.push_str(&format!("Phase:            {}\n", phase_of(rr)));
    out.push_str(&format!(
        "Assumed rebooted: {}\n",
        rr.time_assumed_rebooted()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    ));
    out.push_str(&format!("Remaining:        {}\n", remaining_of(rr, now)));

    if let Some(status) = &rr.status {
        if !status.last_error.is_empty() {
            out.push_str(&format!("Last error:       {}\n", status.last_error));
        }
        if !status.conditions.is_empty() {
            out.push_str("Conditions:\n");
            for c in &status.conditions {
                let marker = if c.type_ == CONDITION_PROCESSING { "*" } else { " " };
                out.push_str(&format!(
                    " {} {:<12} {:<6} {:<22} {}\n",
                    marker, c.type_, c.status, c.reason, c.message
                ));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use self_fence::crd::{
        Condition, RemediationRequestSpec, RemediationRequestStatus, RemediationStrategy,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn create_request(node: &str, namespace: &str, wait_secs: Option<i64>) -> RemediationRequest {
        let mut rr = RemediationRequest::new(
            node,
            RemediationRequestSpec {
                remediation_strategy: RemediationStrategy::ResourceDeletion,
            },
        );
        rr.metadata.namespace = Some(namespace.to_string());
        if let Some(secs) = wait_secs {
            rr.status = Some(RemediationRequestStatus {
                time_assumed_rebooted: Some(now() + chrono::Duration::seconds(secs)),
                phase: Some("WaitingForSafeTime".to_string()),
                last_error: "Node worker-1 not found".to_string(),
                conditions: vec![Condition::processing(true, "WaitingForSafeTime", "waiting")],
            });
        }
        rr
    }

    #[test]
    fn test_format_json_and_yaml() {
        let requests = vec![create_request("worker-1", "self-fence", Some(30))];
        let json = format_json(&requests).unwrap();
        assert!(json.contains("worker-1"));
        assert!(json.contains("timeAssumedRebooted"));

        let yaml = format_yaml(&requests).unwrap();
        assert!(yaml.contains("remediationStrategy: ResourceDeletion"));
    }

    #[test]
    fn test_format_table_columns() {
        let requests = vec![
            create_request("worker-1", "ns1", Some(30)),
            create_request("worker-2", "ns2", Some(-5)),
            create_request("worker-3", "ns2", None),
        ];
        let table = format_table(&requests, true, now());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("NODE"));
        assert!(lines[0].contains("NAMESPACE"));
        assert!(lines[1].contains("30s"));
        assert!(lines[2].contains("elapsed"));
        assert!(lines[3].contains("Pending"));

        let table = format_table(&requests, false, now());
        assert!(!table.contains("NAMESPACE"));
    }

    #[test]
    fn test_format_status_shows_error_and_conditions() {
        let rr = create_request("worker-1", "self-fence", Some(30));
        let status = format_status(&rr, now());
        assert!(status.contains("Phase:            WaitingForSafeTime"));
        assert!(status.contains("Remaining:        30s"));
        assert!(status.contains("Last error:       Node worker-1 not found"));
        assert!(status.contains("Processing"));
    }
}
