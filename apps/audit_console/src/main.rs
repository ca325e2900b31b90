mod commands;
mod config;
mod render;

use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::Result;
use audit_core::{
    paging::PageMove,
    types::{AnalysisOptions, Credentials, UnitFilter},
    AuditService, AuditWorkflow, HttpAuditService, WorkflowError, WorkflowEvent,
};
use clap::Parser;
use commands::ConsoleCommand;
use shared::domain::{FindingId, WorkUnitId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Interactive console for auditing SQL Server stored procedures")]
struct Args {
    /// Base url of the analysis service.
    #[arg(long)]
    api_url: Option<String>,
    /// Settings file; defaults to ./audit_console.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = config::load_settings(args.config.as_deref())?;
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    if let Some(log_level) = args.log_level {
        settings.log_level = log_level;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let service: Arc<dyn AuditService> = Arc::new(HttpAuditService::new(&settings.api_url)?);
    let workflow = AuditWorkflow::with_config(service.clone(), settings.workflow_config()?);
    tokio::spawn(log_events(workflow.subscribe_events()));
    info!(api_url = %settings.api_url, "audit console ready");

    println!("stored procedure audit console - type 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("audit> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = match commands::parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                let _ = err.print();
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        if let Err(err) = execute(&workflow, service.as_ref(), command).await {
            println!("error: {}", err.reason());
        }
    }

    Ok(())
}

async fn execute(
    workflow: &AuditWorkflow,
    service: &dyn AuditService,
    command: ConsoleCommand,
) -> Result<(), WorkflowError> {
    match command {
        ConsoleCommand::Connect {
            server,
            kind,
            user,
            password,
            port,
        } => {
            let info = workflow
                .connect(Credentials {
                    kind: kind.into(),
                    server,
                    username: user,
                    password,
                    port,
                })
                .await?;
            println!("connected: {}", render::database_info(&info));
            let snapshot = workflow.snapshot().await;
            match &snapshot.errors.databases {
                Some(reason) => println!("database catalogue unavailable: {reason}"),
                None => println!("{}", render::databases(&snapshot.databases, Some(&info.name))),
            }
        }
        ConsoleCommand::Databases => {
            let names = workflow.list_databases().await?;
            let current = workflow.snapshot().await.selected_database;
            println!("{}", render::databases(&names, current.as_deref()));
        }
        ConsoleCommand::Use { database } => {
            let selection = workflow.select_database(&database).await?;
            println!("using {}", render::database_info(&selection.info));
            let listing = selection.units?;
            println!("loaded {} stored procedures", listing.len());
            print_units(workflow, PageMove::First).await;
        }
        ConsoleCommand::Load { search, schema } => {
            let listing = workflow.load_units(UnitFilter { search, schema }).await?;
            println!("loaded {} stored procedures", listing.len());
            print_units(workflow, PageMove::First).await;
        }
        ConsoleCommand::Units { page, size } => {
            let resized = match size {
                Some(size) => Some(workflow.set_units_page_size(size).await.page),
                None => None,
            };
            let movement = page.or(resized).map_or(PageMove::First, PageMove::To);
            print_units(workflow, movement).await;
        }
        ConsoleCommand::Toggle { ids } => {
            for id in ids {
                let selected = workflow.toggle_selection(WorkUnitId(id)).await?;
                println!("{id} {}", if selected { "selected" } else { "deselected" });
            }
        }
        ConsoleCommand::All => {
            let count = workflow.select_all().await?;
            println!("{count} stored procedures selected");
        }
        ConsoleCommand::Clear => {
            workflow.clear_selection().await?;
            println!("selection cleared");
        }
        ConsoleCommand::Analyze { mode, no_ai, no_save } => {
            let result = workflow
                .run_analysis(AnalysisOptions {
                    mode: mode.into(),
                    use_ai: !no_ai,
                    save_to_db: !no_save,
                })
                .await?;
            println!("{}", render::analysis(&result));
            println!("{}", render::findings_page(&workflow.current_findings_page().await));
        }
        ConsoleCommand::Findings { page, size } => {
            let resized = match size {
                Some(size) => Some(workflow.set_findings_page_size(size).await.page),
                None => None,
            };
            let page = page.or(resized);
            let window = workflow
                .findings_page(page.map_or(PageMove::First, PageMove::To))
                .await;
            println!("{}", render::findings_page(&window));
        }
        ConsoleCommand::Show { finding } => {
            let analysis = workflow
                .snapshot()
                .await
                .analysis
                .ok_or(audit_core::ValidationError::NoAnalysis)?;
            let id = FindingId::new(finding);
            let finding = analysis
                .finding(&id)
                .ok_or(audit_core::ValidationError::UnknownFinding(id))?;
            println!("{}", render::finding(finding));
        }
        ConsoleCommand::Evidence { findings, force } => {
            let ids: Vec<FindingId> = findings.into_iter().map(FindingId::new).collect();
            let results = futures::future::join_all(ids.iter().map(|id| async move {
                let result = if force {
                    workflow.refetch_evidence(id).await
                } else {
                    workflow.fetch_evidence(id).await
                };
                (id, result)
            }))
            .await;
            for (id, result) in results {
                match result {
                    Ok(finding) => println!("{}\n", render::finding(&finding)),
                    Err(err) => println!("{id}: {}", err.reason()),
                }
            }
        }
        ConsoleCommand::Report { format } => {
            let report = workflow.generate_report(format.into()).await?;
            println!("{}", render::report(&report));
            println!("file: {}", report.file_path);
        }
        ConsoleCommand::Status => {
            println!("{}", render::status(&workflow.snapshot().await));
        }
        ConsoleCommand::Summary => {
            let summary = service.dashboard_summary().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).unwrap_or_else(|_| summary.to_string())
            );
        }
        ConsoleCommand::Help => println!("{}", commands::HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

async fn print_units(workflow: &AuditWorkflow, movement: PageMove) {
    let window = workflow.units_page(movement).await;
    let selected = workflow.snapshot().await.selection;
    println!("{}", render::units_page(&window, &selected));
}

async fn log_events(mut events: broadcast::Receiver<WorkflowEvent>) {
    loop {
        match events.recv().await {
            Ok(WorkflowEvent::StageChanged(stage)) => debug!(?stage, "stage changed"),
            Ok(WorkflowEvent::OperationFailed { operation, reason }) => {
                debug!(%operation, %reason, "operation failed")
            }
            Ok(event) => debug!(?event, "workflow event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
