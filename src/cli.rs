//! CLI argument parsing for the leadflow-worker binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "leadflow-worker", about = "Lead import, resync and export worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Import a CSV (or zipped CSV) file in the foreground
    Import {
        /// Path to the file
        file: PathBuf,
        /// Destination table
        #[arg(long)]
        table: String,
        /// Mapping set name; the latest version is pinned
        #[arg(long)]
        mapping: String,
        /// Upsert on this destination column instead of inserting
        #[arg(long)]
        key: Option<String>,
        /// Skip records whose timestamp in this column is not newer
        #[arg(long, requires = "key")]
        compare_timestamp: Option<String>,
        #[arg(long)]
        batch_size: Option<u32>,
        /// Field delimiter; detected from the header when omitted
        #[arg(long)]
        delimiter: Option<char>,
        /// Count records without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Resume a paused job in the foreground
    Resume {
        job_id: Uuid,
    },
    /// Print one job as JSON
    Status {
        job_id: Uuid,
    },
    /// List recent jobs, newest first
    History {
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Pause processing jobs whose worker stopped heartbeating
    Recover,
    /// Store a JSON array of mapping rules as the next version of a set
    MappingAdd {
        #[arg(long)]
        name: String,
        /// Path to the rules file
        rules: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_migrate_command_parses() {
        let cli = Cli::parse_from(["leadflow-worker", "migrate"]);
        assert!(matches!(cli.command, Some(Command::Migrate)));
    }

    #[test]
    fn test_cli_no_command_defaults_to_none() {
        let cli = Cli::parse_from(["leadflow-worker"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_serve_command_parses() {
        let cli = Cli::parse_from(["leadflow-worker", "serve"]);
        assert!(matches!(cli.command, Some(Command::Serve)));
    }

    #[test]
    fn test_cli_import_command_parses() {
        let cli = Cli::parse_from([
            "leadflow-worker",
            "import",
            "leads.csv",
            "--table",
            "leads",
            "--mapping",
            "bitrix-leads",
            "--key",
            "crm_id",
            "--batch-size",
            "250",
            "--delimiter",
            ";",
            "--dry-run",
        ]);
        match cli.command {
            Some(Command::Import {
                file,
                table,
                mapping,
                key,
                batch_size,
                delimiter,
                dry_run,
                compare_timestamp,
            }) => {
                assert_eq!(file, PathBuf::from("leads.csv"));
                assert_eq!(table, "leads");
                assert_eq!(mapping, "bitrix-leads");
                assert_eq!(key.as_deref(), Some("crm_id"));
                assert_eq!(batch_size, Some(250));
                assert_eq!(delimiter, Some(';'));
                assert!(dry_run);
                assert!(compare_timestamp.is_none());
            }
            _ => panic!("expected import command"),
        }
    }

    #[test]
    fn test_cli_compare_timestamp_requires_key() {
        let result = Cli::try_parse_from([
            "leadflow-worker",
            "import",
            "leads.csv",
            "--table",
            "leads",
            "--mapping",
            "bitrix-leads",
            "--compare-timestamp",
            "updated_at",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_mapping_add_parses() {
        let cli = Cli::parse_from([
            "leadflow-worker",
            "mapping-add",
            "--name",
            "bitrix-leads",
            "rules.json",
        ]);
        match cli.command {
            Some(Command::MappingAdd { name, rules }) => {
                assert_eq!(name, "bitrix-leads");
                assert_eq!(rules, PathBuf::from("rules.json"));
            }
            _ => panic!("expected mapping-add command"),
        }
    }

    #[test]
    fn test_cli_status_requires_uuid() {
        assert!(Cli::try_parse_from(["leadflow-worker", "status", "not-a-uuid"]).is_err());
        let cli = Cli::parse_from([
            "leadflow-worker",
            "status",
            "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
        ]);
        assert!(matches!(cli.command, Some(Command::Status { .. })));
    }
}
