//! Run and queue inspection commands — `relay submit|status|cancel|sweep|queue`.

use anyhow::{Context, Result};
use relay::config::RelayConfig;
use relay::coordinator::{Coordinator, RunSnapshot};
use relay::store::JobStatus;

use super::{build_coordinator, open_store};

fn coordinator(config: &RelayConfig) -> Result<std::sync::Arc<Coordinator>> {
    let store = open_store(config)?;
    Ok(build_coordinator(config, store))
}

/// Input that isn't valid JSON is submitted as a JSON string.
fn parse_input(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

pub async fn cmd_submit(config: &RelayConfig, input: &str) -> Result<()> {
    let coordinator = coordinator(config)?;
    let run = coordinator.create_run(parse_input(input)).await?;
    println!("Submitted run {} (trace {})", run.id, run.trace_id);
    Ok(())
}

pub async fn cmd_status(config: &RelayConfig, run_id: i64, json: bool) -> Result<()> {
    let coordinator = coordinator(config)?;
    let snapshot = coordinator.snapshot(run_id).await?;
    if json {
        let out =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize run snapshot")?;
        println!("{}", out);
        return Ok(());
    }
    print_snapshot(&snapshot);
    Ok(())
}

fn print_snapshot(snapshot: &RunSnapshot) {
    let run = &snapshot.run;
    println!();
    println!(
        "{} {}",
        console::style(format!("Run {}", run.id)).bold(),
        console::style(run.status).cyan()
    );
    println!("  trace:    {}", run.trace_id);
    println!("  created:  {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(done) = run.completed_at {
        println!("  finished: {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  history:  {} entries", run.history.len());
    if let Some(result) = &run.result {
        println!("  result:   {}", result);
    }
    if let Some(error) = &run.error {
        println!("  {} {}", console::style("error:").red().bold(), error);
    }

    let Some(barrier) = &snapshot.barrier else {
        println!();
        return;
    };
    println!();
    println!(
        "  Barrier {} {} ({}/{})",
        barrier.id, barrier.status, barrier.completed_count, barrier.expected_count
    );
    if let Some(deadline) = barrier.deadline_at {
        println!("  deadline: {}", deadline.format("%Y-%m-%d %H:%M:%S"));
    }
    for job in &snapshot.jobs {
        let label = console::style(format!("{:<10}", job.status));
        let status = match job.status {
            JobStatus::Completed => label.green(),
            JobStatus::Failed | JobStatus::Timeout => label.red(),
            _ => label.dim(),
        };
        let detail = job
            .error
            .as_deref()
            .or(job.result.as_deref())
            .unwrap_or_default();
        println!("    {:<24} {} {}", job.tool_call_id, status, truncate(detail, 60));
    }
    println!();
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

pub async fn cmd_cancel(config: &RelayConfig, run_id: i64) -> Result<()> {
    let coordinator = coordinator(config)?;
    if coordinator.cancel_run(run_id).await?.applied() {
        println!("Cancelled run {}", run_id);
    } else {
        let run = coordinator.get_run(run_id).await?;
        println!("Run {} is already {}; nothing to cancel", run_id, run.status);
    }
    Ok(())
}

pub async fn cmd_sweep(config: &RelayConfig) -> Result<()> {
    let coordinator = coordinator(config)?;
    let outcomes = coordinator.sweep_timeouts().await?;
    if outcomes.is_empty() {
        println!("No expired barriers.");
        return Ok(());
    }
    for outcome in outcomes {
        let progress = match &outcome.progress {
            Some(progress) => format!("{:?}", progress),
            None => "resume failed (see logs)".to_string(),
        };
        let what = if outcome.reclaimed {
            "stalled resume reclaimed".to_string()
        } else {
            format!("{} job(s) timed out", outcome.timed_out)
        };
        println!(
            "Barrier {} (run {}): {}, {}",
            outcome.barrier_id, outcome.run_id, what, progress
        );
    }
    Ok(())
}

pub async fn cmd_queue(config: &RelayConfig) -> Result<()> {
    let store = open_store(config)?;
    let counts = store.call(|store| store.queue().count_by_status()).await?;
    println!("{}", console::style("Queue").bold());
    for (status, count) in counts {
        println!("  {:<8} {}", status.as_str(), count);
    }
    Ok(())
}
