use super::*;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{AnalysisId, ConnectionKind, Severity},
    error::RemoteError,
    protocol::{
        AnalysisResponse, ConnectRequest, ConnectResponse, EvidenceData, ReportDescriptor,
        SeveritySummary, SourceLocation, WorkUnitPage,
    },
};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Connect,
    ListDatabases,
    SelectDatabase(String),
    ListUnits { page: u32, limit: u32 },
    Analyze(Vec<WorkUnitId>),
    Evidence(WorkUnitId),
    Report(ReportFormat),
}

/// Parks the next call that passes through it until released.
#[derive(Default)]
struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    fn hold(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    async fn entered(&self) {
        self.entered.notified().await;
    }

    fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct FakeService {
    calls: Mutex<Vec<Call>>,
    connect_error: Mutex<Option<RemoteError>>,
    select_error: Mutex<Option<RemoteError>>,
    units: Mutex<Vec<WorkUnit>>,
    failing_page: Mutex<Option<u32>>,
    analyses: Mutex<VecDeque<AnalysisResponse>>,
    failing_evidence: Mutex<HashSet<WorkUnitId>>,
    connect_gate: Gate,
    databases_gate: Gate,
    listing_gate: Gate,
    analysis_gate: Gate,
    report_gate: Gate,
    evidence_gates: Mutex<HashMap<WorkUnitId, Arc<Gate>>>,
}

impl FakeService {
    fn with_units(ids: impl IntoIterator<Item = i64>) -> Arc<Self> {
        Arc::new(Self {
            units: Mutex::new(ids.into_iter().map(unit).collect()),
            ..Self::default()
        })
    }

    async fn set_units(&self, ids: impl IntoIterator<Item = i64>) {
        *self.units.lock().await = ids.into_iter().map(unit).collect();
    }

    async fn queue_analysis(&self, response: AnalysisResponse) {
        self.analyses.lock().await.push_back(response);
    }

    async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    async fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().await.iter().filter(|call| matches(call)).count()
    }

    async fn record(&self, call: Call) {
        self.calls.lock().await.push(call);
    }

    async fn hold_evidence(&self, sp_id: i64) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        gate.hold();
        self.evidence_gates
            .lock()
            .await
            .insert(WorkUnitId(sp_id), Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl AuditService for FakeService {
    async fn connect(&self, _request: &ConnectRequest) -> Result<ConnectResponse, RemoteError> {
        self.record(Call::Connect).await;
        self.connect_gate.pass().await;
        if let Some(err) = self.connect_error.lock().await.clone() {
            return Err(err);
        }
        Ok(ConnectResponse {
            connection_id: ConnectionHandle::new("0b5e6f1a-conn"),
            database_info: info("master"),
        })
    }

    async fn list_databases(
        &self,
        _connection: &ConnectionHandle,
    ) -> Result<Vec<String>, RemoteError> {
        self.record(Call::ListDatabases).await;
        self.databases_gate.pass().await;
        Ok(vec!["master".into(), "Sales".into(), "Other".into()])
    }

    async fn select_database(
        &self,
        _connection: &ConnectionHandle,
        database: &str,
    ) -> Result<DatabaseInfo, RemoteError> {
        self.record(Call::SelectDatabase(database.to_string())).await;
        if let Some(err) = self.select_error.lock().await.clone() {
            return Err(err);
        }
        Ok(info(database))
    }

    async fn list_work_units(
        &self,
        request: &ListWorkUnitsRequest,
    ) -> Result<WorkUnitPage, RemoteError> {
        self.record(Call::ListUnits {
            page: request.page,
            limit: request.limit,
        })
        .await;
        self.listing_gate.pass().await;
        if *self.failing_page.lock().await == Some(request.page) {
            return Err(RemoteError::new(500, "listing timed out"));
        }
        let units = self.units.lock().await;
        let start = ((request.page - 1) * request.limit) as usize;
        let end = (start + request.limit as usize).min(units.len());
        Ok(WorkUnitPage {
            items: units.get(start..end).unwrap_or_default().to_vec(),
            total: units.len() as u64,
        })
    }

    async fn run_analysis(
        &self,
        request: &AnalyzeRequest,
    ) -> Result<AnalysisResponse, RemoteError> {
        self.record(Call::Analyze(request.sp_ids.clone())).await;
        self.analysis_gate.pass().await;
        self.analyses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| RemoteError::new(503, "analysis engine unavailable"))
    }

    async fn fetch_evidence(&self, request: &EvidenceRequest) -> Result<EvidenceData, RemoteError> {
        self.record(Call::Evidence(request.sp_id)).await;
        let gate = self.evidence_gates.lock().await.get(&request.sp_id).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if self.failing_evidence.lock().await.contains(&request.sp_id) {
            return Err(RemoteError::new(404, "stored procedure source not found"));
        }
        Ok(EvidenceData {
            attack_scenario: Some(format!("exploit via {}", request.finding_type)),
            ..EvidenceData::default()
        })
    }

    async fn generate_report(
        &self,
        request: &ReportRequest,
    ) -> Result<ReportDescriptor, RemoteError> {
        self.record(Call::Report(request.format)).await;
        self.report_gate.pass().await;
        Ok(ReportDescriptor {
            report_id: None,
            format: None,
            file_path: format!("/srv/reports/{}.{}", request.analysis_id, request.format),
        })
    }

    async fn dashboard_summary(&self) -> Result<Value, RemoteError> {
        Ok(Value::Null)
    }
}

fn unit(id: i64) -> WorkUnit {
    WorkUnit {
        id: WorkUnitId(id),
        full_name: format!("dbo.usp_{id}"),
        schema: "dbo".into(),
        line_count: 20,
        is_analyzed: false,
    }
}

fn info(name: &str) -> DatabaseInfo {
    DatabaseInfo {
        name: name.into(),
        server: "db.corp".into(),
        version: "15.0".into(),
        unit_count: 0,
    }
}

fn finding(id: &str, sp_id: Option<i64>) -> Finding {
    Finding {
        id: FindingId::new(id),
        severity: Severity::High,
        category: "SQL Injection".into(),
        finding_type: Some("sql_injection".into()),
        title: format!("dynamic SQL in finding {id}"),
        description: None,
        impact: None,
        recommendation: None,
        sp_id: sp_id.map(WorkUnitId),
        sp_name: None,
        location: Some(SourceLocation {
            line: Some(3),
            code_snippet: Some("EXEC(@sql)".into()),
        }),
        evidence_data: None,
    }
}

fn analysis(id: &str, findings: Vec<Finding>) -> AnalysisResponse {
    AnalysisResponse {
        analysis_id: AnalysisId::new(id),
        analyzed_count: 1,
        findings_summary: SeveritySummary::default(),
        findings,
    }
}

fn credentials() -> Credentials {
    Credentials {
        kind: ConnectionKind::SqlAuth,
        server: "db.corp".into(),
        username: "auditor".into(),
        password: "hunter2".into(),
        port: None,
    }
}

async fn connected(service: Arc<FakeService>) -> AuditWorkflow {
    let workflow = AuditWorkflow::new(service);
    workflow.connect(credentials()).await.expect("connect");
    workflow
}

async fn loaded(service: Arc<FakeService>) -> AuditWorkflow {
    let workflow = connected(service).await;
    let selection = workflow.select_database("Sales").await.expect("select database");
    selection.units.expect("listing");
    workflow
}

async fn analyzed(service: Arc<FakeService>, findings: Vec<Finding>) -> AuditWorkflow {
    service.queue_analysis(analysis("run-1", findings)).await;
    let workflow = loaded(service).await;
    workflow.select_all().await.expect("select all");
    workflow
        .run_analysis(AnalysisOptions::default())
        .await
        .expect("analysis");
    workflow
}

fn drain(events: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn connect_commits_handle_and_loads_catalogue() {
    let service = FakeService::with_units(1..=3);
    let workflow = AuditWorkflow::new(service.clone());
    assert_eq!(workflow.stage().await, Stage::Disconnected);

    let info = workflow.connect(credentials()).await.expect("connect");
    assert_eq!(info.name, "master");

    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.stage, Stage::Connected);
    assert_eq!(snapshot.databases, vec!["master", "Sales", "Other"]);
    assert_eq!(
        snapshot.connection.as_ref().map(ConnectionHandle::short),
        Some("0b5e6f1a")
    );
    assert_eq!(service.calls().await, vec![Call::Connect, Call::ListDatabases]);
}

#[tokio::test]
async fn invalid_credentials_fail_without_request() {
    let service = FakeService::with_units([]);
    let workflow = AuditWorkflow::new(service.clone());

    let err = workflow
        .connect(Credentials {
            password: String::new(),
            ..credentials()
        })
        .await
        .expect_err("missing password");

    assert!(err.is_validation());
    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.stage, Stage::Disconnected);
    assert!(snapshot.errors.connection.is_some());
    assert!(service.calls().await.is_empty());
}

#[tokio::test]
async fn connect_failure_publishes_service_message() {
    let service = FakeService::with_units([]);
    *service.connect_error.lock().await =
        Some(RemoteError::new(401, "Login failed for user 'auditor'"));
    let workflow = AuditWorkflow::new(service.clone());
    let mut events = workflow.subscribe_events();

    let err = workflow.connect(credentials()).await.expect_err("login");
    assert_eq!(err.remote().and_then(|remote| remote.status), Some(401));

    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.stage, Stage::Disconnected);
    assert_eq!(
        snapshot.errors.connection.as_deref(),
        Some("Login failed for user 'auditor'")
    );
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        WorkflowEvent::OperationFailed { operation: Operation::Connect, reason }
            if reason == "Login failed for user 'auditor'"
    )));
    // No catalogue request after a failed connect.
    assert_eq!(service.calls().await, vec![Call::Connect]);
}

#[tokio::test]
async fn select_database_collects_every_listing_page() {
    let service = FakeService::with_units(1..=1204);
    let workflow = connected(service.clone()).await;

    let selection = workflow.select_database("Sales").await.expect("select");
    let listing = selection.units.expect("listing");
    assert_eq!(selection.info.name, "Sales");
    assert_eq!(listing.len(), 1204);
    assert_eq!(listing.total(), 1204);

    let pages: Vec<Call> = service
        .calls()
        .await
        .into_iter()
        .filter(|call| matches!(call, Call::ListUnits { .. }))
        .collect();
    assert_eq!(
        pages,
        vec![
            Call::ListUnits { page: 1, limit: 500 },
            Call::ListUnits { page: 2, limit: 500 },
            Call::ListUnits { page: 3, limit: 500 },
        ]
    );
    assert_eq!(workflow.stage().await, Stage::UnitsLoaded);
}

#[tokio::test]
async fn load_units_requires_a_database() {
    let service = FakeService::with_units(1..=3);
    let workflow = connected(service.clone()).await;

    let err = workflow
        .load_units(UnitFilter::default())
        .await
        .expect_err("no database");
    assert_eq!(
        err,
        WorkflowError::Validation(ValidationError::NoDatabaseSelected)
    );
    assert_eq!(service.count(|call| matches!(call, Call::ListUnits { .. })).await, 0);
}

#[tokio::test]
async fn reload_prunes_selection_to_new_listing() {
    let service = FakeService::with_units(1..=3);
    let workflow = loaded(service.clone()).await;
    workflow.select_all().await.expect("select all");
    let mut events = workflow.subscribe_events();

    service.set_units(2..=4).await;
    workflow.reload_units().await.expect("reload");

    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.selection, vec![WorkUnitId(2), WorkUnitId(3)]);
    assert!(!snapshot.all_selected);
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        WorkflowEvent::ListingReplaced { units: 3, pruned: 1 }
    )));
}

#[tokio::test]
async fn failed_listing_keeps_previous_listing_and_selection() {
    let service = FakeService::with_units(1..=600);
    let workflow = loaded(service.clone()).await;
    workflow.toggle_selection(WorkUnitId(5)).await.expect("toggle");
    let before = workflow.snapshot().await;

    *service.failing_page.lock().await = Some(2);
    let err = workflow
        .load_units(UnitFilter::search("usp_"))
        .await
        .expect_err("page 2 fails");
    assert_eq!(err.reason(), "listing timed out");

    let after = workflow.snapshot().await;
    let (Some(old), Some(new)) = (before.listing, after.listing) else {
        panic!("listing should survive a failed reload");
    };
    assert!(Arc::ptr_eq(&old, &new));
    assert_eq!(after.selection, vec![WorkUnitId(5)]);
    assert_eq!(after.filter, UnitFilter::default());
    assert_eq!(after.errors.units.as_deref(), Some("listing timed out"));
}

#[tokio::test]
async fn filter_is_remembered_for_reloads() {
    let service = FakeService::with_units(1..=3);
    let workflow = loaded(service.clone()).await;

    workflow
        .load_units(UnitFilter {
            search: Some(" orders ".into()),
            schema: Some("sales".into()),
        })
        .await
        .expect("filtered load");
    let listing = workflow.reload_units().await.expect("reload");

    assert_eq!(listing.filter().search.as_deref(), Some("orders"));
    assert_eq!(listing.filter().schema.as_deref(), Some("sales"));
}

#[tokio::test]
async fn select_all_toggle_and_clear() {
    let service = FakeService::with_units(1..=4);
    let workflow = loaded(service).await;

    assert_eq!(workflow.select_all().await.expect("select all"), 4);
    assert_eq!(workflow.select_all().await.expect("select all again"), 4);
    assert!(workflow.snapshot().await.all_selected);
    assert_eq!(workflow.stage().await, Stage::UnitsSelected);

    assert_eq!(workflow.toggle_select_all().await.expect("toggle all"), 0);
    assert_eq!(workflow.stage().await, Stage::UnitsLoaded);

    assert!(workflow.toggle_selection(WorkUnitId(2)).await.expect("toggle"));
    assert_eq!(workflow.toggle_select_all().await.expect("toggle all"), 4);

    workflow.clear_selection().await.expect("clear");
    assert!(workflow.snapshot().await.selection.is_empty());

    let err = workflow
        .toggle_selection(WorkUnitId(99))
        .await
        .expect_err("unknown id");
    assert_eq!(
        err,
        WorkflowError::Validation(ValidationError::UnknownWorkUnit(WorkUnitId(99)))
    );
}

#[tokio::test]
async fn analysis_requires_connection_and_selection() {
    let service = FakeService::with_units(1..=3);
    let idle = AuditWorkflow::new(service.clone());
    let err = idle
        .run_analysis(AnalysisOptions::default())
        .await
        .expect_err("not connected");
    assert_eq!(err, WorkflowError::Validation(ValidationError::NotConnected));

    let workflow = loaded(service.clone()).await;
    let err = workflow
        .run_analysis(AnalysisOptions::default())
        .await
        .expect_err("empty selection");
    assert_eq!(err, WorkflowError::Validation(ValidationError::EmptySelection));
    assert_eq!(
        workflow.snapshot().await.errors.analysis.as_deref(),
        Some("select at least one stored procedure to analyze")
    );
    assert_eq!(service.count(|call| matches!(call, Call::Analyze(_))).await, 0);
}

#[tokio::test]
async fn analysis_sends_selection_in_listing_order() {
    let service = FakeService::with_units([30, 10, 20]);
    service.queue_analysis(analysis("run-1", Vec::new())).await;
    let workflow = loaded(service.clone()).await;
    workflow.toggle_selection(WorkUnitId(20)).await.expect("toggle");
    workflow.toggle_selection(WorkUnitId(30)).await.expect("toggle");

    workflow
        .run_analysis(AnalysisOptions::default())
        .await
        .expect("analysis");

    assert!(service
        .calls()
        .await
        .contains(&Call::Analyze(vec![WorkUnitId(30), WorkUnitId(20)])));
    assert_eq!(workflow.stage().await, Stage::AnalysisReady);
}

#[tokio::test]
async fn failed_analysis_keeps_previous_result() {
    let service = FakeService::with_units(1..=2);
    let workflow = analyzed(service.clone(), vec![finding("a", Some(1))]).await;

    let err = workflow
        .run_analysis(AnalysisOptions::default())
        .await
        .expect_err("engine unavailable");
    assert_eq!(err.reason(), "analysis engine unavailable");

    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.stage, Stage::AnalysisReady);
    let analysis = snapshot.analysis.expect("previous analysis");
    assert_eq!(analysis.analysis_id().as_str(), "run-1");
}

#[tokio::test]
async fn second_analysis_discards_fetched_evidence() {
    let service = FakeService::with_units(1..=2);
    let workflow = analyzed(service.clone(), vec![finding("a", Some(1))]).await;

    let first = workflow
        .fetch_evidence(&FindingId::new("a"))
        .await
        .expect("evidence");
    assert!(first.evidence_data.is_some());

    service
        .queue_analysis(analysis("run-2", vec![finding("a", Some(1))]))
        .await;
    let second = workflow
        .run_analysis(AnalysisOptions::default())
        .await
        .expect("second analysis");

    assert_eq!(second.analysis_id().as_str(), "run-2");
    assert_eq!(second.evidence_count(), 0);
    assert!(second
        .finding(&FindingId::new("a"))
        .is_some_and(|finding| finding.evidence_data.is_none()));
}

#[tokio::test]
async fn failed_database_switch_leaves_state_untouched() {
    let service = FakeService::with_units(1..=3);
    let workflow = loaded(service.clone()).await;
    workflow.select_all().await.expect("select all");
    let before = workflow.snapshot().await;

    *service.select_error.lock().await =
        Some(RemoteError::new(403, "The server principal is not able to access 'Other'"));
    let err = workflow.select_database("Other").await.expect_err("forbidden");
    assert_eq!(err.remote().and_then(|remote| remote.status), Some(403));

    let after = workflow.snapshot().await;
    assert_eq!(after.selected_database.as_deref(), Some("Sales"));
    assert_eq!(
        after.database_info.as_ref().map(|info| info.name.as_str()),
        Some("Sales")
    );
    let (Some(old), Some(new)) = (before.listing, after.listing) else {
        panic!("listing should survive a failed switch");
    };
    assert!(Arc::ptr_eq(&old, &new));
    assert_eq!(after.selection.len(), 3);
    assert!(after.errors.databases.is_some());
}

#[tokio::test]
async fn database_switch_clears_downstream_work() {
    let service = FakeService::with_units(1..=3);
    let workflow = analyzed(service.clone(), vec![finding("a", Some(1))]).await;
    workflow
        .generate_report(ReportFormat::Json)
        .await
        .expect("report");

    let switched = workflow.select_database("Other").await.expect("switch");
    assert!(switched.units.is_ok());

    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.stage, Stage::UnitsLoaded);
    assert!(snapshot.analysis.is_none());
    assert!(snapshot.report.is_none());
    assert!(snapshot.selection.is_empty());
    assert_eq!(snapshot.selected_database.as_deref(), Some("Other"));
}

#[tokio::test]
async fn concurrent_evidence_fetches_are_isolated() {
    let service = FakeService::with_units(1..=3);
    service.failing_evidence.lock().await.insert(WorkUnitId(2));
    let workflow = Arc::new(
        analyzed(
            service.clone(),
            vec![
                finding("a", Some(1)),
                finding("b", Some(2)),
                finding("c", Some(3)),
            ],
        )
        .await,
    );
    let untouched = workflow
        .snapshot()
        .await
        .analysis
        .and_then(|analysis| analysis.finding(&FindingId::new("c")).cloned())
        .expect("finding c");
    let gate_a = service.hold_evidence(1).await;

    let pending_a = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.fetch_evidence(&FindingId::new("a")).await }
    });
    gate_a.entered().await;

    // b completes while a is still outstanding.
    let b = workflow.fetch_evidence(&FindingId::new("b")).await;
    assert_eq!(
        b.expect_err("b fails").reason(),
        "stored procedure source not found"
    );
    let midway = workflow.snapshot().await;
    assert_eq!(
        midway.overlays,
        vec![Overlay::EvidencePending(FindingId::new("a"))]
    );
    assert_eq!(midway.stage, Stage::AnalysisReady);

    gate_a.release();
    let a = pending_a.await.expect("join").expect("a succeeds");
    assert!(a.evidence_data.is_some());

    let snapshot = workflow.snapshot().await;
    let analysis = snapshot.analysis.expect("analysis");
    assert!(analysis.finding(&FindingId::new("a")).is_some_and(|f| f.evidence_data.is_some()));
    assert!(analysis.finding(&FindingId::new("b")).is_some_and(|f| f.evidence_data.is_none()));
    assert!(analysis
        .finding(&FindingId::new("c"))
        .is_some_and(|c| Arc::ptr_eq(c, &untouched)));
    assert_eq!(snapshot.errors.evidence.len(), 1);
    assert!(snapshot.errors.evidence.contains_key(&FindingId::new("b")));
    assert!(snapshot.overlays.is_empty());
    assert_eq!(snapshot.stage, Stage::AnalysisReady);
}

#[tokio::test]
async fn evidence_for_replaced_analysis_is_discarded() {
    let service = FakeService::with_units(1..=1);
    let workflow = Arc::new(analyzed(service.clone(), vec![finding("a", Some(1))]).await);
    let gate = service.hold_evidence(1).await;

    let pending = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.fetch_evidence(&FindingId::new("a")).await }
    });
    gate.entered().await;

    service
        .queue_analysis(analysis("run-2", vec![finding("a", Some(1))]))
        .await;
    workflow
        .run_analysis(AnalysisOptions::default())
        .await
        .expect("second analysis");
    gate.release();

    let err = pending.await.expect("join").expect_err("stale evidence");
    assert_eq!(err, WorkflowError::Superseded(Operation::FetchEvidence));

    let snapshot = workflow.snapshot().await;
    let analysis = snapshot.analysis.expect("analysis");
    assert_eq!(analysis.analysis_id().as_str(), "run-2");
    assert_eq!(analysis.evidence_count(), 0);
    assert!(snapshot.errors.evidence.is_empty());
    assert!(snapshot.overlays.is_empty());
}

#[tokio::test]
async fn evidence_is_cached_until_refetched() {
    let service = FakeService::with_units(1..=1);
    let workflow = analyzed(service.clone(), vec![finding("a", Some(1))]).await;
    let id = FindingId::new("a");

    workflow.fetch_evidence(&id).await.expect("first fetch");
    workflow.fetch_evidence(&id).await.expect("cached");
    assert_eq!(service.count(|call| matches!(call, Call::Evidence(_))).await, 1);

    workflow.refetch_evidence(&id).await.expect("forced");
    assert_eq!(service.count(|call| matches!(call, Call::Evidence(_))).await, 2);
}

#[tokio::test]
async fn evidence_validation_fails_before_any_request() {
    let service = FakeService::with_units(1..=1);
    let mut untyped = finding("untyped", Some(1));
    untyped.finding_type = Some("  ".into());
    let workflow = analyzed(
        service.clone(),
        vec![finding("orphan", None), untyped],
    )
    .await;

    let err = workflow
        .fetch_evidence(&FindingId::new("orphan"))
        .await
        .expect_err("no stored procedure");
    assert_eq!(
        err,
        WorkflowError::Validation(ValidationError::MissingWorkUnitReference(FindingId::new(
            "orphan"
        )))
    );

    let err = workflow
        .fetch_evidence(&FindingId::new("untyped"))
        .await
        .expect_err("no type");
    assert!(err.is_validation());

    let err = workflow
        .fetch_evidence(&FindingId::new("missing"))
        .await
        .expect_err("unknown finding");
    assert!(err.is_validation());

    assert_eq!(service.count(|call| matches!(call, Call::Evidence(_))).await, 0);
    let errors = workflow.snapshot().await.errors.evidence;
    assert_eq!(errors.len(), 3);
}

#[tokio::test]
async fn report_keeps_frozen_copy_of_analysis() {
    let service = FakeService::with_units(1..=1);
    let workflow = analyzed(service.clone(), vec![finding("a", Some(1))]).await;

    let report = workflow
        .generate_report(ReportFormat::Pdf)
        .await
        .expect("report");
    assert_eq!(report.format, ReportFormat::Pdf);
    assert_eq!(report.file_name(), "run-1.pdf");
    assert_eq!(workflow.stage().await, Stage::ReportReady);

    workflow
        .fetch_evidence(&FindingId::new("a"))
        .await
        .expect("evidence");

    assert_eq!(report.analysis().evidence_count(), 0);
    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.analysis.expect("analysis").evidence_count(), 1);
    assert!(snapshot.report.is_some());
}

#[tokio::test]
async fn report_for_replaced_analysis_is_not_stored() {
    let service = FakeService::with_units(1..=1);
    let workflow = Arc::new(analyzed(service.clone(), vec![finding("a", Some(1))]).await);
    service.report_gate.hold();

    let pending = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.generate_report(ReportFormat::Excel).await }
    });
    service.report_gate.entered().await;
    assert!(workflow
        .snapshot()
        .await
        .overlays
        .contains(&Overlay::ReportGenerating));

    service
        .queue_analysis(analysis("run-2", vec![finding("b", Some(1))]))
        .await;
    workflow
        .run_analysis(AnalysisOptions::default())
        .await
        .expect("second analysis");
    service.report_gate.release();

    let report = pending.await.expect("join").expect("report");
    assert_eq!(report.analysis().analysis_id().as_str(), "run-1");

    let snapshot = workflow.snapshot().await;
    assert!(snapshot.report.is_none());
    assert_eq!(snapshot.stage, Stage::AnalysisReady);
}

#[tokio::test]
async fn analysis_finishing_after_database_switch_is_discarded() {
    let service = FakeService::with_units(1..=3);
    service.queue_analysis(analysis("run-old-db", vec![finding("a", Some(1))])).await;
    let workflow = Arc::new(loaded(service.clone()).await);
    workflow.select_all().await.expect("select all");
    service.analysis_gate.hold();

    let pending = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.run_analysis(AnalysisOptions::default()).await }
    });
    service.analysis_gate.entered().await;
    assert_eq!(workflow.stage().await, Stage::Analyzing);

    workflow
        .select_database("Other")
        .await
        .expect("switch")
        .units
        .expect("listing");
    assert_eq!(workflow.stage().await, Stage::UnitsLoaded);

    service.analysis_gate.release();
    let err = pending.await.expect("join").expect_err("stale analysis");
    assert_eq!(err, WorkflowError::Superseded(Operation::RunAnalysis));

    let snapshot = workflow.snapshot().await;
    assert!(snapshot.analysis.is_none());
    assert!(snapshot.errors.analysis.is_none());
    assert_eq!(snapshot.selected_database.as_deref(), Some("Other"));
    assert_eq!(snapshot.stage, Stage::UnitsLoaded);
}

#[tokio::test]
async fn listing_finishing_after_database_switch_is_discarded() {
    let service = FakeService::with_units(1..=3);
    let workflow = Arc::new(loaded(service.clone()).await);
    service.listing_gate.hold();

    let pending = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.load_units(UnitFilter::search("usp_")).await }
    });
    service.listing_gate.entered().await;

    let switched = workflow
        .select_database("Other")
        .await
        .expect("switch")
        .units
        .expect("listing");

    service.listing_gate.release();
    let err = pending.await.expect("join").expect_err("stale listing");
    assert_eq!(err, WorkflowError::Superseded(Operation::LoadUnits));

    let snapshot = workflow.snapshot().await;
    let listing = snapshot.listing.expect("listing");
    assert!(Arc::ptr_eq(&listing, &switched));
    assert_eq!(snapshot.filter, UnitFilter::default());
    assert!(snapshot.errors.units.is_none());
}

#[tokio::test]
async fn connect_response_after_reconnect_is_discarded() {
    let service = FakeService::with_units([]);
    let workflow = Arc::new(AuditWorkflow::new(service.clone()));
    service.connect_gate.hold();

    let pending = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.connect(credentials()).await }
    });
    service.connect_gate.entered().await;
    assert_eq!(workflow.stage().await, Stage::Connecting);

    workflow.connect(credentials()).await.expect("second connect");
    service.connect_gate.release();
    let err = pending.await.expect("join").expect_err("stale connect");
    assert_eq!(err, WorkflowError::Superseded(Operation::Connect));

    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.stage, Stage::Connected);
    assert!(snapshot.errors.connection.is_none());
    // Only the live connection goes on to load the catalogue.
    assert_eq!(
        service.count(|call| matches!(call, Call::ListDatabases)).await,
        1
    );
}

#[tokio::test]
async fn catalogue_after_reconnect_is_discarded() {
    let service = FakeService::with_units([]);
    let workflow = Arc::new(connected(service.clone()).await);
    service.databases_gate.hold();

    let pending = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.list_databases().await }
    });
    service.databases_gate.entered().await;

    workflow.connect(credentials()).await.expect("reconnect");
    service.databases_gate.release();
    let err = pending.await.expect("join").expect_err("stale catalogue");
    assert_eq!(err, WorkflowError::Superseded(Operation::ListDatabases));

    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.databases, vec!["master", "Sales", "Other"]);
    assert!(snapshot.errors.databases.is_none());
}

#[tokio::test]
async fn report_requires_analysis() {
    let service = FakeService::with_units(1..=1);
    let workflow = loaded(service.clone()).await;

    let err = workflow
        .generate_report(ReportFormat::Json)
        .await
        .expect_err("no analysis");
    assert_eq!(err, WorkflowError::Validation(ValidationError::NoAnalysis));
    assert_eq!(service.count(|call| matches!(call, Call::Report(_))).await, 0);
}

#[tokio::test]
async fn units_cursor_resets_when_listing_is_replaced() {
    let service = FakeService::with_units(1..=12);
    let workflow = loaded(service.clone()).await;

    let last = workflow.units_page(PageMove::Last).await;
    assert_eq!(last.page, 3);
    assert_eq!(last.items.len(), 2);

    workflow.reload_units().await.expect("reload");
    let current = workflow.current_units_page().await;
    assert_eq!(current.page, 1);
    assert_eq!(current.items[0].id, WorkUnitId(1));
}

#[tokio::test]
async fn findings_cursor_clamps_and_resets_on_new_analysis() {
    let service = FakeService::with_units(1..=1);
    let findings = (0..12).map(|n| finding(&format!("f{n}"), Some(1))).collect();
    let workflow = analyzed(service.clone(), findings).await;

    let page = workflow.findings_page(PageMove::To(9)).await;
    assert_eq!(page.page, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total_items, 12);

    service
        .queue_analysis(analysis("run-2", vec![finding("g", Some(1))]))
        .await;
    workflow
        .run_analysis(AnalysisOptions::default())
        .await
        .expect("second analysis");
    let page = workflow.current_findings_page().await;
    assert_eq!(page.page, 1);
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn page_size_change_keeps_cursor_in_range() {
    let service = FakeService::with_units(1..=12);
    let workflow = loaded(service.clone()).await;
    workflow.units_page(PageMove::Last).await;

    let window = workflow
        .set_units_page_size(NonZeroUsize::new(10).expect("size"))
        .await;
    assert_eq!(window.page, 2);
    assert_eq!(window.total_pages, 2);
    assert_eq!(window.items.len(), 2);
    assert_eq!(workflow.current_units_page().await.page_size, 10);

    let findings = workflow
        .set_findings_page_size(NonZeroUsize::new(3).expect("size"))
        .await;
    assert_eq!(findings.page, 1);
    assert_eq!(findings.total_pages, 1);
    assert!(findings.items.is_empty());
}

#[tokio::test]
async fn reconnect_discards_everything_downstream() {
    let service = FakeService::with_units(1..=2);
    let workflow = analyzed(service.clone(), vec![finding("a", Some(1))]).await;

    workflow.connect(credentials()).await.expect("reconnect");

    let snapshot = workflow.snapshot().await;
    assert_eq!(snapshot.stage, Stage::Connected);
    assert!(snapshot.listing.is_none());
    assert!(snapshot.analysis.is_none());
    assert!(snapshot.selected_database.is_none());
    assert_eq!(
        snapshot.database_info.map(|info| info.name),
        Some("master".to_string())
    );
}

#[test]
fn artifact_downstream_follows_dependency_order() {
    assert!(Artifact::Connection
        .downstream()
        .contains(&Artifact::Report));
    assert_eq!(
        Artifact::Listing.downstream(),
        &[Artifact::Selection, Artifact::Analysis, Artifact::Report]
    );
    assert_eq!(Artifact::Analysis.downstream(), &[Artifact::Report]);
    assert!(!Artifact::Database
        .downstream()
        .contains(&Artifact::DatabaseCatalog));
}

#[test]
fn artifact_downstream_is_transitively_closed() {
    use Artifact::*;
    for artifact in [Connection, DatabaseCatalog, Database, Listing, Selection, Analysis, Report] {
        let downstream = artifact.downstream();
        assert!(!downstream.contains(&artifact), "{artifact:?} lists itself");
        for dependent in downstream {
            for transitive in dependent.downstream() {
                assert!(
                    downstream.contains(transitive),
                    "{artifact:?} misses {transitive:?} via {dependent:?}"
                );
            }
        }
    }
}
