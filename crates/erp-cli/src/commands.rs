use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;

use erp_ledger::{AuditReport, Ledger, LedgerConfig};
use erp_server::{ErpServer, ServerConfig};
use erp_store::InMemoryStore;

use crate::cli::{AuditArgs, Cli, Command, OutputFormat, ServeArgs};

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve(args) => cmd_serve(args),
        Command::Audit(args) => cmd_audit(args, cli.format),
        Command::Config => cmd_config(),
    }
}

fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = ServerConfig::load_with_env(&args.config)?;
    config.override_bind_addr(args.bind.as_deref())?;
    let server = ErpServer::new(config)?;
    println!(
        "{} ERP server on {}",
        "✓".green().bold(),
        server.config().bind_addr.to_string().bold()
    );
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(server.serve())?;
    Ok(())
}

fn cmd_audit(args: AuditArgs, format: OutputFormat) -> anyhow::Result<()> {
    let ledger_config = match &args.config {
        Some(path) => ServerConfig::load(path)?.ledger,
        None => LedgerConfig::default(),
    };
    let report = audit_snapshot(&args.snapshot, ledger_config)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    if !report.is_clean() {
        anyhow::bail!("{} invariant violation(s)", report.violations.len());
    }
    Ok(())
}

fn audit_snapshot(path: &Path, config: LedgerConfig) -> anyhow::Result<AuditReport> {
    let store = InMemoryStore::load_snapshot(path)
        .with_context(|| format!("loading snapshot {}", path.display()))?;
    let clock = config.clock()?;
    let ledger = Ledger::new(store, config, Arc::new(clock));
    Ok(ledger.audit()?)
}

fn print_report(report: &AuditReport) {
    println!(
        "Checked {} products, {} accounts, {} partner lines, {} settlements",
        report.products_checked.to_string().bold(),
        report.accounts_checked.to_string().bold(),
        report.lines_checked.to_string().bold(),
        report.settlements_checked.to_string().bold(),
    );
    if report.is_clean() {
        println!("{} No violations.", "✓".green().bold());
        return;
    }
    for violation in &report.violations {
        println!(
            "  {} {} {}: {}",
            "✗".red(),
            violation.table.to_string().yellow(),
            violation.id,
            violation.description
        );
    }
}

fn cmd_config() -> anyhow::Result<()> {
    print!("{}", ServerConfig::default().to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_clean_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(
            &path,
            r#"{"tables":{"accounts":[{"id":1,"name":"Cash","account_type":"cash","payment_method_code":"cash","balance":"100","opening_balance":"100","is_active":true}]}}"#,
        )
        .unwrap();
        let report = audit_snapshot(&path, LedgerConfig::default()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.accounts_checked, 1);
    }

    #[test]
    fn audit_flags_drifted_stock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(
            &path,
            r#"{"tables":{"products":[{"id":1,"sku":"P","name":"P","stock":5,"avg_cost":"1"}]}}"#,
        )
        .unwrap();
        let report = audit_snapshot(&path, LedgerConfig::default()).unwrap();
        assert_eq!(report.violations.len(), 1);
    }

    #[test]
    fn audit_missing_snapshot_fails() {
        let err = audit_snapshot(Path::new("/nonexistent.json"), LedgerConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("loading snapshot"));
    }
}
