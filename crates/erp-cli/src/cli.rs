use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "erp",
    about = "Storefront ERP ledger: serve the HTTP API or audit a store snapshot",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Check a JSON store snapshot against the ledger invariants
    Audit(AuditArgs),
    /// Print the default configuration as TOML
    Config,
}

#[derive(Args)]
pub struct ServeArgs {
    /// TOML config file; missing means defaults
    #[arg(short, long, default_value = "erp.toml")]
    pub config: PathBuf,

    /// Override the bind address
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Args)]
pub struct AuditArgs {
    /// Snapshot file written by the in-memory store
    pub snapshot: PathBuf,

    /// TOML config file for ledger tolerances
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_audit() {
        let cli = Cli::try_parse_from(["erp", "audit", "snap.json", "--format", "json"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        let Command::Audit(args) = cli.command else {
            panic!("expected audit");
        };
        assert_eq!(args.snapshot, PathBuf::from("snap.json"));
        assert!(args.config.is_none());
    }

    #[test]
    fn parse_serve_defaults() {
        let cli = Cli::try_parse_from(["erp", "-v", "serve"]).unwrap();
        assert!(cli.verbose);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.config, PathBuf::from("erp.toml"));
        assert!(args.bind.is_none());
    }

    #[test]
    fn audit_needs_a_snapshot() {
        assert!(Cli::try_parse_from(["erp", "audit"]).is_err());
    }
}
