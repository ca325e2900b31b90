use std::num::NonZeroUsize;

use clap::{Parser, Subcommand, ValueEnum};
use shared::domain::{AnalysisMode, ConnectionKind, ReportFormat};

#[derive(Parser, Debug)]
#[command(
    name = "audit",
    no_binary_name = true,
    disable_help_flag = true,
    disable_help_subcommand = true
)]
pub struct CommandLine {
    #[command(subcommand)]
    pub command: ConsoleCommand,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Open a connection to a SQL Server instance.
    Connect {
        server: String,
        #[arg(long, value_enum, default_value_t = KindArg::SqlAuth)]
        kind: KindArg,
        #[arg(long, short = 'u', default_value = "")]
        user: String,
        #[arg(long, short = 'p', default_value = "")]
        password: String,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Refresh the database catalogue.
    Databases,
    /// Switch to a database and load its stored procedures.
    Use { database: String },
    /// Reload stored procedures, optionally filtered.
    Load {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        schema: Option<String>,
    },
    Units {
        page: Option<usize>,
        /// Rows per page from now on.
        #[arg(long)]
        size: Option<NonZeroUsize>,
    },
    /// Flip the selection of one or more stored procedures.
    Toggle {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    All,
    #[command(name = "none")]
    Clear,
    Analyze {
        #[arg(long, value_enum, default_value_t = ModeArg::Full)]
        mode: ModeArg,
        #[arg(long)]
        no_ai: bool,
        #[arg(long)]
        no_save: bool,
    },
    Findings {
        page: Option<usize>,
        #[arg(long)]
        size: Option<NonZeroUsize>,
    },
    Show { finding: String },
    /// Fetch evidence for findings, concurrently when several are given.
    Evidence {
        #[arg(required = true)]
        findings: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    Report {
        #[arg(value_enum)]
        format: FormatArg,
    },
    Status,
    Summary,
    Help,
    #[command(alias = "exit")]
    Quit,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    SqlAuth,
    WindowsAuth,
    AzureAd,
}

impl From<KindArg> for ConnectionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::SqlAuth => ConnectionKind::SqlAuth,
            KindArg::WindowsAuth => ConnectionKind::WindowsAuth,
            KindArg::AzureAd => ConnectionKind::AzureAd,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Full,
    Quick,
}

impl From<ModeArg> for AnalysisMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => AnalysisMode::Full,
            ModeArg::Quick => AnalysisMode::Quick,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Json,
    Pdf,
    Excel,
}

impl From<FormatArg> for ReportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Json => ReportFormat::Json,
            FormatArg::Pdf => ReportFormat::Pdf,
            FormatArg::Excel => ReportFormat::Excel,
        }
    }
}

/// Parses one console line. `Ok(None)` for a blank line.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, clap::Error> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(None);
    }
    CommandLine::try_parse_from(words).map(|parsed| Some(parsed.command))
}

pub const HELP: &str = "\
commands:
  connect <server> [--kind sql-auth|windows-auth|azure-ad] [-u USER] [-p PASSWORD] [--port N]
  databases                      refresh the database catalogue
  use <database>                 switch database and load its stored procedures
  load [--search S] [--schema S] reload stored procedures with a filter
  units [page] [--size N]        show a page of stored procedures
  toggle <id>...                 flip selection of stored procedures
  all | none                     select every stored procedure / clear selection
  analyze [--mode full|quick] [--no-ai] [--no-save]
  findings [page] [--size N]     show a page of findings
  show <finding>                 show one finding with its evidence
  evidence <finding>... [--force]
  report <json|pdf|excel>
  status | summary | help | quit";
