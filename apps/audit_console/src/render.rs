use std::{collections::HashSet, fmt::Write, sync::Arc};

use audit_core::{
    paging::PageWindow,
    types::{AnalysisResult, ReportArtifact},
    WorkflowSnapshot,
};
use shared::{
    domain::{Severity, WorkUnitId},
    protocol::{DatabaseInfo, EvidenceData, Finding, SeveritySummary, WorkUnit},
};

pub fn database_info(info: &DatabaseInfo) -> String {
    format!(
        "{} on {} ({} stored procedures){}",
        display_or(&info.name, "<unnamed>"),
        display_or(&info.server, "<unknown server>"),
        info.unit_count,
        if info.version.is_empty() {
            String::new()
        } else {
            format!(" - {}", first_line(&info.version))
        }
    )
}

pub fn databases(names: &[String], current: Option<&str>) -> String {
    if names.is_empty() {
        return "no databases listed".into();
    }
    names
        .iter()
        .map(|name| {
            let marker = if Some(name.as_str()) == current { "*" } else { " " };
            format!("{marker} {name}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn units_page(window: &PageWindow<WorkUnit>, selected: &[WorkUnitId]) -> String {
    if window.total_items == 0 {
        return "no stored procedures loaded".into();
    }
    let selected: HashSet<WorkUnitId> = selected.iter().copied().collect();
    let mut out = String::new();
    for unit in &window.items {
        let mark = if selected.contains(&unit.id) { "x" } else { " " };
        let analyzed = if unit.is_analyzed { " (analyzed)" } else { "" };
        let _ = writeln!(
            out,
            "[{mark}] {:>6}  {}  {} lines{analyzed}",
            unit.id.0, unit.full_name, unit.line_count
        );
    }
    let _ = write!(
        out,
        "page {}/{} - {} stored procedures, {} selected",
        window.page,
        window.total_pages,
        window.total_items,
        selected.len()
    );
    out
}

pub fn severity_summary(summary: &SeveritySummary) -> String {
    Severity::ALL
        .iter()
        .map(|severity| format!("{}: {}", severity, summary.get(*severity)))
        .collect::<Vec<_>>()
        .join("  ")
}

pub fn analysis(result: &AnalysisResult) -> String {
    let mut out = format!(
        "analysis {} - {} stored procedures analyzed, {} findings\n",
        result.analysis_id(),
        result.analyzed_count(),
        result.findings().len()
    );
    let _ = writeln!(out, "reported  {}", severity_summary(result.summary()));
    let _ = write!(out, "tallied   {}", severity_summary(&result.severity_tally()));
    out
}

pub fn findings_page(window: &PageWindow<Arc<Finding>>) -> String {
    if window.total_items == 0 {
        return "no findings".into();
    }
    let mut out = String::new();
    for finding in &window.items {
        let evidence = if finding.evidence_data.is_some() { " [evidence]" } else { "" };
        let _ = writeln!(
            out,
            "{:<8} {:<10} {} - {}{evidence}",
            finding.id.as_str(),
            finding.severity.as_str().to_uppercase(),
            finding.sp_name.as_deref().unwrap_or("-"),
            finding.title
        );
    }
    let _ = write!(
        out,
        "page {}/{} - {} findings",
        window.page, window.total_pages, window.total_items
    );
    out
}

pub fn finding(finding: &Finding) -> String {
    let mut out = format!(
        "{} [{}] {}\ncategory: {}\n",
        finding.id,
        finding.severity.as_str().to_uppercase(),
        finding.title,
        finding.category
    );
    if let Some(name) = &finding.sp_name {
        let _ = writeln!(out, "procedure: {name}");
    }
    if let Some(line) = finding.line() {
        let _ = writeln!(out, "line: {line}");
    }
    for (label, text) in [
        ("description", &finding.description),
        ("impact", &finding.impact),
        ("recommendation", &finding.recommendation),
    ] {
        if let Some(text) = text {
            let _ = writeln!(out, "{label}: {text}");
        }
    }
    let snippet = finding.code_snippet();
    if !snippet.is_empty() {
        let _ = writeln!(out, "code:\n    {}", snippet.replace('\n', "\n    "));
    }
    match &finding.evidence_data {
        Some(evidence) => out.push_str(&self::evidence(evidence)),
        None => out.push_str("evidence: not fetched"),
    }
    out.trim_end().to_string()
}

pub fn evidence(evidence: &EvidenceData) -> String {
    let mut out = String::from("evidence:\n");
    if let Some(context) = &evidence.vulnerability_context {
        if let Some(kind) = &context.kind {
            let _ = writeln!(out, "  type: {kind}");
        }
        for (label, values) in [
            ("vulnerable parameters", &context.vulnerable_parameters),
            ("affected columns", &context.affected_columns),
            ("password columns", &context.password_columns_found),
            ("exposed columns", &context.exposed_columns),
        ] {
            if !values.is_empty() {
                let _ = writeln!(out, "  {label}: {}", values.join(", "));
            }
        }
        if let Some(count) = context.total_passwords_exposed {
            let _ = writeln!(out, "  passwords exposed: {count}");
        }
    }
    if let Some(scenario) = &evidence.attack_scenario {
        let _ = writeln!(out, "  attack scenario: {scenario}");
    }
    for count in &evidence.record_counts {
        let _ = writeln!(
            out,
            "  {}: {} records, columns {}",
            count.table,
            count.total_records,
            count.columns_affected.join(", ")
        );
        for (column, metrics) in &count.sensitive_counts {
            let _ = writeln!(
                out,
                "    {column}: {} distinct, {} non-null",
                metrics.distinct, metrics.non_null
            );
        }
    }
    for sample in &evidence.masked_samples {
        let _ = writeln!(out, "  sample from {} ({} rows)", sample.table, sample.rows.len());
        for row in &sample.rows {
            let _ = writeln!(out, "    {}", serde_json::Value::Object(row.clone()));
        }
    }
    if !evidence.records_preview.is_empty() {
        let source = evidence.records_source.as_deref().unwrap_or("unknown source");
        let _ = writeln!(
            out,
            "  preview of {} records from {source}",
            evidence.records_preview.len()
        );
    }
    out
}

pub fn report(report: &ReportArtifact) -> String {
    format!(
        "{} report {} generated at {} ({} findings)",
        report.format,
        report.file_name(),
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.analysis().findings().len()
    )
}

pub fn status(snapshot: &WorkflowSnapshot) -> String {
    let mut out = format!("stage: {:?}\n", snapshot.stage);
    for overlay in &snapshot.overlays {
        let _ = writeln!(out, "pending: {overlay:?}");
    }
    match &snapshot.connection {
        Some(handle) => {
            let _ = writeln!(out, "connection: {}", handle.short());
        }
        None => out.push_str("connection: none\n"),
    }
    if let Some(info) = &snapshot.database_info {
        let _ = writeln!(out, "database: {}", database_info(info));
    }
    if let Some(listing) = &snapshot.listing {
        let _ = writeln!(
            out,
            "stored procedures: {} loaded, {} selected{}",
            listing.len(),
            snapshot.selection.len(),
            if snapshot.all_selected { " (all)" } else { "" }
        );
    }
    if let Some(analysis) = &snapshot.analysis {
        let _ = writeln!(
            out,
            "analysis: {} ({} findings, {} with evidence)",
            analysis.analysis_id(),
            analysis.findings().len(),
            analysis.evidence_count()
        );
    }
    if let Some(report) = &snapshot.report {
        let _ = writeln!(out, "report: {}", report.file_path);
    }

    let errors = &snapshot.errors;
    for (label, error) in [
        ("connection", &errors.connection),
        ("databases", &errors.databases),
        ("units", &errors.units),
        ("selection", &errors.selection),
        ("analysis", &errors.analysis),
        ("report", &errors.report),
    ] {
        if let Some(error) = error {
            let _ = writeln!(out, "error ({label}): {error}");
        }
    }
    for (finding, error) in &errors.evidence {
        let _ = writeln!(out, "error (evidence {finding}): {error}");
    }
    out.trim_end().to_string()
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}
