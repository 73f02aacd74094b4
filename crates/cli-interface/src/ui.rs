//! Console output

use console::style;

use common::deployment::DeploymentState;
use model_manager::Discovery;
use orchestrator_core::DeploymentReport;

pub fn success(message: impl AsRef<str>) {
    println!("{} {}", style("✓").green(), message.as_ref());
}

pub fn failure(message: impl AsRef<str>) {
    eprintln!("{} {}", style("✗").red(), message.as_ref());
}

pub fn heading(message: impl AsRef<str>) {
    println!("\n{}", style(message.as_ref()).yellow().bold());
}

pub fn print_discovery(discovery: &Discovery) {
    if discovery.ready.is_empty() && discovery.resumable.is_empty() {
        println!("No local models found. Use `nim-deploy deploy` to download one.");
        return;
    }

    if !discovery.ready.is_empty() {
        heading("Ready to deploy");
        for set in &discovery.ready {
            println!(
                "  {}  {}",
                style(set.identity.display_id()).green(),
                style(set.path.display()).dim()
            );
        }
    }

    if !discovery.resumable.is_empty() {
        heading("Incomplete");
        for set in &discovery.resumable {
            println!(
                "  {}  {} ({})",
                style(set.identity.display_id()).yellow(),
                style(set.path.display()).dim(),
                set.reason
            );
        }
    }
}

pub fn print_tags(repo: &str, tags: &[String]) {
    if tags.is_empty() {
        println!("No released tags for {}", repo);
        return;
    }
    heading(format!("Tags of {}", repo));
    for tag in tags {
        println!("  {}", tag);
    }
}

/// Summarises a finished run
pub fn print_report(report: &DeploymentReport) {
    let record = &report.record;
    match report.state() {
        DeploymentState::Ready => {
            success(format!(
                "{} is serving {} at http://localhost:{}",
                record.container_name,
                record.served_model_name(),
                record.port
            ));
        }
        DeploymentState::Stopped => {
            failure(format!("Deployment of {} cancelled", record.served_model_name()));
        }
        state => {
            failure(format!("Deployment of {} ended in {}", record.served_model_name(), state));
            if let Some(err) = &report.error {
                eprintln!("{}", err);
            }
        }
    }
}
