use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use relay_activity::{Encoding, JobOutcome, same_activity};
use relay_kernel::{JobView, KernelBuilder};
use relay_protocol::{EventKind, JobId, JobRequest};
use relay_runtime::{CoordinatorConfig, demo_team};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "relayd")]
#[command(about = "relay demo daemon")]
struct Cli {
    #[arg(long, default_value = ".relay")]
    root: PathBuf,
    #[arg(long, default_value = "What was ACME revenue in FY2024?")]
    query: String,
    #[arg(long, default_value_t = 30)]
    idle_timeout_secs: u64,
    #[arg(long, default_value_t = 8)]
    max_handoffs: u32,
    /// Store the reduced agents/tools form instead of the event history.
    #[arg(long)]
    legacy: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .init();

    let cli = Cli::parse();

    let (agents, router) = demo_team();
    let mut builder = KernelBuilder::new(&cli.root)
        .idle_timeout(Duration::from_secs(cli.idle_timeout_secs))
        .coordinator_config(CoordinatorConfig::default().with_max_handoffs(cli.max_handoffs))
        .encoding(if cli.legacy {
            Encoding::Legacy
        } else {
            Encoding::EventLog
        })
        .router(Arc::new(router));
    for agent in agents {
        builder = builder.agent(agent);
    }
    let kernel = builder.build();
    info!(agents = ?kernel.agent_names(), root = %cli.root.display(), "kernel ready");

    let request = JobRequest::new(JobId::new_uuid(), cli.query);
    let (record, subscription) = kernel.submit_watched(request).await?;
    info!(job_id = %record.job_id, query = %record.query, "job submitted");

    let live = kernel
        .watch(subscription, |event, view| match event.kind() {
            EventKind::Status | EventKind::AgentSwitch => {
                info!(status = view.status().unwrap_or_default(), "status");
            }
            EventKind::ToolCall | EventKind::ToolResult => {
                let rendered = event.to_wire();
                info!(event = %rendered, "tool activity");
            }
            _ => {}
        })
        .await?;
    print_view("live", &live);

    kernel.wait_settled(&record.job_id).await;
    let replayed = kernel
        .replay_job(&record.job_id)
        .await?
        .context("session record missing after the job settled")?;
    print_view("replayed", &replayed);

    if same_activity(&live.sections, &replayed.sections) {
        info!("replayed activity matches the live view");
    } else {
        warn!("replayed activity differs from the live view");
    }

    Ok(())
}

fn print_view(label: &str, view: &JobView) {
    for section in &view.sections {
        info!(view = label, agent = %section.agent, reason = %section.reason, tools = section.tools.len(), "agent section");
        for call in &section.tools {
            let result = call
                .result
                .as_ref()
                .map(|result| result.to_string())
                .unwrap_or_else(|| "pending".to_owned());
            info!(
                view = label,
                tool = %call.tool,
                server = %call.server,
                duration_ms = call.duration_ms,
                result = %result,
                "tool call"
            );
        }
    }
    match &view.outcome {
        JobOutcome::Completed { text, .. } => info!(view = label, answer = %text, "job completed"),
        JobOutcome::Failed { message } => warn!(view = label, error = %message, "job failed"),
        JobOutcome::Running => warn!(view = label, "job still running"),
    }
}
