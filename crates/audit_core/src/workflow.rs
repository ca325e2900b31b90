//! Client-held state machine sequencing the audit workflow.
//!
//! All state lives in one [`WorkflowState`] behind a mutex. Network calls are
//! made with the lock released; results are committed afterwards only if the
//! upstream artifacts they depend on are still the ones the call started
//! from. Readers take [`WorkflowSnapshot`]s, which share the immutable
//! listing and analysis through `Arc`s.

use std::{
    collections::{BTreeSet, HashMap},
    num::{NonZeroU32, NonZeroUsize},
    sync::Arc,
};

use shared::{
    domain::{ConnectionHandle, FindingId, ReportFormat, WorkUnitId},
    protocol::{
        AnalyzeRequest, DatabaseInfo, EvidenceRequest, Finding, ListWorkUnitsRequest,
        ReportRequest, WorkUnit,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::{Operation, ValidationError, WorkflowError},
    pagination::{collect_pages, Page},
    paging::{PageCursor, PageMove, PageWindow},
    patch::patch_evidence,
    selection::SelectionSet,
    types::{AnalysisOptions, AnalysisResult, Credentials, Listing, ReportArtifact, UnitFilter},
    AuditService,
};

const DEFAULT_LISTING_PAGE_SIZE: u32 = 500;
const DEFAULT_VIEW_PAGE_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Page size requested from the listing endpoint.
    pub listing_page_size: NonZeroU32,
    pub units_page_size: NonZeroUsize,
    pub findings_page_size: NonZeroUsize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let view = NonZeroUsize::new(DEFAULT_VIEW_PAGE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            listing_page_size: NonZeroU32::new(DEFAULT_LISTING_PAGE_SIZE)
                .unwrap_or(NonZeroU32::MIN),
            units_page_size: view,
            findings_page_size: view,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Disconnected,
    Connecting,
    Connected,
    DatabaseSelected,
    UnitsLoaded,
    UnitsSelected,
    Analyzing,
    AnalysisReady,
    ReportReady,
}

/// Sub-states that run on top of `AnalysisReady` without leaving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlay {
    EvidencePending(FindingId),
    ReportGenerating,
}

/// Pieces of workflow state, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Connection,
    DatabaseCatalog,
    Database,
    Listing,
    Selection,
    Analysis,
    Report,
}

impl Artifact {
    /// Everything that must be cleared when `self` is invalidated, excluding `self`.
    /// Transitively closed.
    ///
    /// A listing reload does not invalidate `Listing`: it prunes the selection
    /// and leaves the analysis in place.
    pub fn downstream(self) -> &'static [Artifact] {
        use Artifact::*;
        match self {
            Connection => &[DatabaseCatalog, Database, Listing, Selection, Analysis, Report],
            DatabaseCatalog => &[],
            Database => &[Listing, Selection, Analysis, Report],
            Listing => &[Selection, Analysis, Report],
            Selection => &[Analysis, Report],
            Analysis => &[Report],
            Report => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    StageChanged(Stage),
    DatabasesListed(Vec<String>),
    ListingReplaced { units: usize, pruned: usize },
    AnalysisReady { findings: usize },
    EvidenceAttached(FindingId),
    ReportReady(Arc<ReportArtifact>),
    OperationFailed { operation: Operation, reason: String },
}

/// Last failure reason per operation; cleared when the operation is retried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationErrors {
    pub connection: Option<String>,
    pub databases: Option<String>,
    pub units: Option<String>,
    pub selection: Option<String>,
    pub analysis: Option<String>,
    pub report: Option<String>,
    pub evidence: HashMap<FindingId, String>,
}

impl OperationErrors {
    fn record(&mut self, operation: Operation, finding: Option<&FindingId>, reason: String) {
        match operation {
            Operation::Connect => self.connection = Some(reason),
            Operation::ListDatabases | Operation::SelectDatabase => self.databases = Some(reason),
            Operation::LoadUnits => self.units = Some(reason),
            Operation::Selection => self.selection = Some(reason),
            Operation::RunAnalysis => self.analysis = Some(reason),
            Operation::GenerateReport => self.report = Some(reason),
            Operation::FetchEvidence => {
                if let Some(finding) = finding {
                    self.evidence.insert(finding.clone(), reason);
                }
            }
        }
    }

    fn clear(&mut self, operation: Operation, finding: Option<&FindingId>) {
        match operation {
            Operation::Connect => self.connection = None,
            Operation::ListDatabases | Operation::SelectDatabase => self.databases = None,
            Operation::LoadUnits => self.units = None,
            Operation::Selection => self.selection = None,
            Operation::RunAnalysis => self.analysis = None,
            Operation::GenerateReport => self.report = None,
            Operation::FetchEvidence => {
                if let Some(finding) = finding {
                    self.evidence.remove(finding);
                }
            }
        }
    }
}

/// Result of a successful database switch. The follow-up listing may still fail.
#[derive(Debug, Clone)]
pub struct DatabaseSelection {
    pub info: DatabaseInfo,
    pub units: Result<Arc<Listing>, WorkflowError>,
}

#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub stage: Stage,
    pub overlays: Vec<Overlay>,
    pub connection: Option<ConnectionHandle>,
    pub database_info: Option<DatabaseInfo>,
    pub selected_database: Option<String>,
    pub databases: Vec<String>,
    pub listing: Option<Arc<Listing>>,
    pub filter: UnitFilter,
    pub selection: Vec<WorkUnitId>,
    pub all_selected: bool,
    pub analysis: Option<Arc<AnalysisResult>>,
    pub report: Option<Arc<ReportArtifact>>,
    pub errors: OperationErrors,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Epochs {
    connection: u64,
    database: u64,
    analysis: u64,
}

#[derive(Debug, Default)]
struct InFlight {
    connect: bool,
    select_database: bool,
    load_units: bool,
    analysis: bool,
    report: bool,
    evidence: BTreeSet<FindingId>,
}

#[derive(Debug)]
struct WorkflowState {
    epochs: Epochs,
    connection: Option<ConnectionHandle>,
    databases: Vec<String>,
    database_info: Option<DatabaseInfo>,
    selected_database: Option<String>,
    listing: Option<Arc<Listing>>,
    filter: UnitFilter,
    selection: SelectionSet,
    analysis: Option<Arc<AnalysisResult>>,
    report: Option<Arc<ReportArtifact>>,
    units_cursor: PageCursor,
    findings_cursor: PageCursor,
    in_flight: InFlight,
    errors: OperationErrors,
}

impl WorkflowState {
    fn new(config: &WorkflowConfig) -> Self {
        Self {
            epochs: Epochs::default(),
            connection: None,
            databases: Vec::new(),
            database_info: None,
            selected_database: None,
            listing: None,
            filter: UnitFilter::default(),
            selection: SelectionSet::default(),
            analysis: None,
            report: None,
            units_cursor: PageCursor::new(config.units_page_size),
            findings_cursor: PageCursor::new(config.findings_page_size),
            in_flight: InFlight::default(),
            errors: OperationErrors::default(),
        }
    }

    fn stage(&self) -> Stage {
        if self.in_flight.connect {
            return Stage::Connecting;
        }
        if self.connection.is_none() {
            return Stage::Disconnected;
        }
        if self.in_flight.analysis {
            return Stage::Analyzing;
        }
        if self.analysis.is_some() {
            return if self.report.is_some() {
                Stage::ReportReady
            } else {
                Stage::AnalysisReady
            };
        }
        match (&self.selected_database, &self.listing) {
            (None, _) => Stage::Connected,
            (Some(_), None) => Stage::DatabaseSelected,
            (Some(_), Some(_)) if self.selection.is_empty() => Stage::UnitsLoaded,
            (Some(_), Some(_)) => Stage::UnitsSelected,
        }
    }

    fn overlays(&self) -> Vec<Overlay> {
        let mut overlays: Vec<Overlay> = self
            .in_flight
            .evidence
            .iter()
            .cloned()
            .map(Overlay::EvidencePending)
            .collect();
        if self.in_flight.report {
            overlays.push(Overlay::ReportGenerating);
        }
        overlays
    }

    /// Clears `artifact` and everything downstream of it.
    fn invalidate(&mut self, artifact: Artifact) {
        self.clear_one(artifact);
        for dependent in artifact.downstream() {
            self.clear_one(*dependent);
        }
    }

    fn clear_one(&mut self, artifact: Artifact) {
        match artifact {
            Artifact::Connection => {
                self.connection = None;
                self.epochs.connection += 1;
                self.in_flight = InFlight::default();
            }
            Artifact::DatabaseCatalog => {
                self.databases.clear();
            }
            Artifact::Database => {
                self.selected_database = None;
                self.database_info = None;
                self.epochs.database += 1;
                self.in_flight.load_units = false;
                self.in_flight.analysis = false;
            }
            Artifact::Listing => {
                self.listing = None;
                self.units_cursor.reset();
            }
            Artifact::Selection => self.selection.clear(),
            Artifact::Analysis => {
                self.analysis = None;
                self.epochs.analysis += 1;
                self.findings_cursor.reset();
                self.in_flight.evidence.clear();
                self.errors.evidence.clear();
            }
            Artifact::Report => self.report = None,
        }
    }

    fn require_connection(&self) -> Result<ConnectionHandle, ValidationError> {
        self.connection.clone().ok_or(ValidationError::NotConnected)
    }

    fn require_listing(&self) -> Result<Arc<Listing>, ValidationError> {
        self.listing.clone().ok_or(ValidationError::NoListing)
    }

    fn require_analysis(&self) -> Result<Arc<AnalysisResult>, ValidationError> {
        self.analysis.clone().ok_or(ValidationError::NoAnalysis)
    }

    fn current_run(&self) -> Option<u64> {
        self.analysis.as_ref().map(|analysis| analysis.run())
    }

    fn snapshot(&self) -> WorkflowSnapshot {
        let (selection, all_selected) = match &self.listing {
            Some(listing) => (
                self.selection.ordered(listing),
                self.selection.all_selected(listing),
            ),
            None => (Vec::new(), false),
        };
        WorkflowSnapshot {
            stage: self.stage(),
            overlays: self.overlays(),
            connection: self.connection.clone(),
            database_info: self.database_info.clone(),
            selected_database: self.selected_database.clone(),
            databases: self.databases.clone(),
            listing: self.listing.clone(),
            filter: self.filter.clone(),
            selection,
            all_selected,
            analysis: self.analysis.clone(),
            report: self.report.clone(),
            errors: self.errors.clone(),
        }
    }
}

pub struct AuditWorkflow {
    service: Arc<dyn AuditService>,
    config: WorkflowConfig,
    inner: Mutex<WorkflowState>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl AuditWorkflow {
    pub fn new(service: Arc<dyn AuditService>) -> Self {
        Self::with_config(service, WorkflowConfig::default())
    }

    pub fn with_config(service: Arc<dyn AuditService>, config: WorkflowConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            service,
            config,
            inner: Mutex::new(WorkflowState::new(&config)),
            events,
        }
    }

    /// Sizes the workflow was built with; page sizes may have changed since.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> WorkflowSnapshot {
        self.inner.lock().await.snapshot()
    }

    pub async fn stage(&self) -> Stage {
        self.inner.lock().await.stage()
    }

    fn emit(&self, event: WorkflowEvent) {
        let _ = self.events.send(event);
    }

    fn emit_stage_change(&self, before: Stage, state: &WorkflowState) {
        let after = state.stage();
        if before != after {
            debug!(?before, ?after, "workflow stage changed");
            self.emit(WorkflowEvent::StageChanged(after));
        }
    }

    /// Publishes `err` for `operation` and hands it back for returning.
    fn fail(
        &self,
        state: &mut WorkflowState,
        operation: Operation,
        finding: Option<&FindingId>,
        err: impl Into<WorkflowError>,
    ) -> WorkflowError {
        let err = err.into();
        if !matches!(err, WorkflowError::Superseded(_)) {
            let reason = err.reason();
            state.errors.record(operation, finding, reason.clone());
            self.emit(WorkflowEvent::OperationFailed { operation, reason });
        }
        warn!(%operation, error = %err, "workflow operation failed");
        err
    }

    /// Opens a new connection, discarding the previous one and everything built on it.
    pub async fn connect(&self, credentials: Credentials) -> Result<DatabaseInfo, WorkflowError> {
        let request = match credentials.into_request() {
            Ok(request) => request,
            Err(err) => {
                let mut state = self.inner.lock().await;
                return Err(self.fail(&mut state, Operation::Connect, None, err));
            }
        };

        let epoch = {
            let mut state = self.inner.lock().await;
            let before = state.stage();
            state.invalidate(Artifact::Connection);
            state.in_flight.connect = true;
            state.errors.clear(Operation::Connect, None);
            self.emit_stage_change(before, &state);
            state.epochs.connection
        };

        info!(server = %request.server, kind = ?request.connection_type, "connecting to analysis service");
        let result = self.service.connect(&request).await;

        let info = {
            let mut state = self.inner.lock().await;
            if state.epochs.connection != epoch {
                return Err(WorkflowError::Superseded(Operation::Connect));
            }
            let before = state.stage();
            state.in_flight.connect = false;
            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    let err = self.fail(&mut state, Operation::Connect, None, err);
                    self.emit_stage_change(before, &state);
                    return Err(err);
                }
            };
            info!(
                connection = %response.connection_id.short(),
                database = %response.database_info.name,
                "connection established"
            );
            state.connection = Some(response.connection_id);
            state.database_info = Some(response.database_info.clone());
            self.emit_stage_change(before, &state);
            response.database_info
        };

        if let Err(err) = self.list_databases().await {
            warn!(error = %err, "connected but the database catalogue could not be loaded");
        }
        Ok(info)
    }

    pub async fn list_databases(&self) -> Result<Vec<String>, WorkflowError> {
        let (connection, epoch) = {
            let mut state = self.inner.lock().await;
            let connection = match state.require_connection() {
                Ok(connection) => connection,
                Err(err) => return Err(self.fail(&mut state, Operation::ListDatabases, None, err)),
            };
            state.errors.clear(Operation::ListDatabases, None);
            (connection, state.epochs.connection)
        };

        let result = self.service.list_databases(&connection).await;

        let mut state = self.inner.lock().await;
        if state.epochs.connection != epoch {
            return Err(WorkflowError::Superseded(Operation::ListDatabases));
        }
        match result {
            Ok(databases) => {
                debug!(count = databases.len(), "database catalogue loaded");
                state.databases = databases.clone();
                self.emit(WorkflowEvent::DatabasesListed(databases.clone()));
                Ok(databases)
            }
            Err(err) => Err(self.fail(&mut state, Operation::ListDatabases, None, err)),
        }
    }

    /// Switches the connection to `database`, then loads its stored procedures
    /// with the current filter.
    pub async fn select_database(&self, database: &str) -> Result<DatabaseSelection, WorkflowError> {
        let (connection, epoch) = {
            let mut state = self.inner.lock().await;
            let connection = match state.require_connection() {
                Ok(connection) => connection,
                Err(err) => {
                    return Err(self.fail(&mut state, Operation::SelectDatabase, None, err))
                }
            };
            if state.in_flight.select_database {
                warn!("database switch issued while another is still outstanding");
            }
            state.in_flight.select_database = true;
            state.errors.clear(Operation::SelectDatabase, None);
            (connection, state.epochs.connection)
        };

        info!(database, "selecting database");
        let result = self.service.select_database(&connection, database).await;

        let info = {
            let mut state = self.inner.lock().await;
            if state.epochs.connection != epoch {
                return Err(WorkflowError::Superseded(Operation::SelectDatabase));
            }
            state.in_flight.select_database = false;
            let info = match result {
                Ok(info) => info,
                Err(err) => return Err(self.fail(&mut state, Operation::SelectDatabase, None, err)),
            };
            let before = state.stage();
            state.invalidate(Artifact::Database);
            state.selected_database = Some(database.to_string());
            state.database_info = Some(info.clone());
            self.emit_stage_change(before, &state);
            info
        };

        let units = self.reload_units().await;
        Ok(DatabaseSelection { info, units })
    }

    /// Loads the listing again with the last filter used.
    pub async fn reload_units(&self) -> Result<Arc<Listing>, WorkflowError> {
        let filter = self.inner.lock().await.filter.clone();
        self.load_units(filter).await
    }

    /// Collects every page of the stored procedure listing and swaps it in
    /// only once all pages arrived. The selection is pruned to the new listing.
    pub async fn load_units(&self, filter: UnitFilter) -> Result<Arc<Listing>, WorkflowError> {
        let filter = filter.normalized();
        let (connection, epochs) = {
            let mut state = self.inner.lock().await;
            let connection = match state.require_connection() {
                Ok(connection) => connection,
                Err(err) => return Err(self.fail(&mut state, Operation::LoadUnits, None, err)),
            };
            if state.selected_database.is_none() {
                return Err(self.fail(
                    &mut state,
                    Operation::LoadUnits,
                    None,
                    ValidationError::NoDatabaseSelected,
                ));
            }
            state.in_flight.load_units = true;
            state.errors.clear(Operation::LoadUnits, None);
            (connection, state.epochs)
        };

        let service = self.service.as_ref();
        let collected = collect_pages(self.config.listing_page_size, |query| {
            let request = ListWorkUnitsRequest {
                connection_id: connection.clone(),
                page: query.page,
                limit: query.limit,
                schema: filter.schema.clone(),
                search: filter.search.clone(),
            };
            async move { service.list_work_units(&request).await.map(Page::from) }
        })
        .await;

        let mut state = self.inner.lock().await;
        if state.epochs.connection != epochs.connection || state.epochs.database != epochs.database
        {
            return Err(WorkflowError::Superseded(Operation::LoadUnits));
        }
        state.in_flight.load_units = false;
        let collected = match collected {
            Ok(collected) => collected,
            Err(err) => return Err(self.fail(&mut state, Operation::LoadUnits, None, err)),
        };

        let before = state.stage();
        let listing = Arc::new(Listing::new(collected.items, collected.total, filter.clone()));
        let pruned = state.selection.prune(&listing);
        state.listing = Some(Arc::clone(&listing));
        state.filter = filter;
        state.units_cursor.reset();
        info!(
            units = listing.len(),
            pages = collected.requests,
            pruned,
            "stored procedure listing replaced"
        );
        self.emit(WorkflowEvent::ListingReplaced {
            units: listing.len(),
            pruned,
        });
        self.emit_stage_change(before, &state);
        Ok(listing)
    }

    /// Flips one stored procedure; returns whether it is selected afterwards.
    pub async fn toggle_selection(&self, id: WorkUnitId) -> Result<bool, WorkflowError> {
        self.mutate_selection(|selection, listing| Ok(selection.toggle(id, listing)?))
            .await
    }

    /// Selects exactly the stored procedures of the current listing.
    pub async fn select_all(&self) -> Result<usize, WorkflowError> {
        self.mutate_selection(|selection, listing| {
            selection.select_all(listing);
            Ok(selection.len())
        })
        .await
    }

    pub async fn clear_selection(&self) -> Result<(), WorkflowError> {
        self.mutate_selection(|selection, _| {
            selection.clear();
            Ok(())
        })
        .await
    }

    /// Clears the selection when everything is selected, otherwise selects all.
    pub async fn toggle_select_all(&self) -> Result<usize, WorkflowError> {
        self.mutate_selection(|selection, listing| {
            if selection.all_selected(listing) {
                selection.clear();
            } else {
                selection.select_all(listing);
            }
            Ok(selection.len())
        })
        .await
    }

    async fn mutate_selection<R>(
        &self,
        mutate: impl FnOnce(&mut SelectionSet, &Listing) -> Result<R, WorkflowError>,
    ) -> Result<R, WorkflowError> {
        let mut state = self.inner.lock().await;
        let listing = match state.require_listing() {
            Ok(listing) => listing,
            Err(err) => return Err(self.fail(&mut state, Operation::Selection, None, err)),
        };
        let before = state.stage();
        match mutate(&mut state.selection, &listing) {
            Ok(value) => {
                state.errors.clear(Operation::Selection, None);
                self.emit_stage_change(before, &state);
                Ok(value)
            }
            Err(err) => Err(self.fail(&mut state, Operation::Selection, None, err)),
        }
    }

    /// Analyzes the selected stored procedures. A successful run replaces the
    /// previous result, including any evidence fetched for it.
    pub async fn run_analysis(
        &self,
        options: AnalysisOptions,
    ) -> Result<Arc<AnalysisResult>, WorkflowError> {
        let (request, epochs) = {
            let mut state = self.inner.lock().await;
            let connection = match state.require_connection() {
                Ok(connection) => connection,
                Err(err) => return Err(self.fail(&mut state, Operation::RunAnalysis, None, err)),
            };
            let sp_ids = state
                .listing
                .as_ref()
                .map(|listing| state.selection.ordered(listing))
                .unwrap_or_default();
            if sp_ids.is_empty() {
                return Err(self.fail(
                    &mut state,
                    Operation::RunAnalysis,
                    None,
                    ValidationError::EmptySelection,
                ));
            }
            let before = state.stage();
            state.in_flight.analysis = true;
            state.errors.clear(Operation::RunAnalysis, None);
            self.emit_stage_change(before, &state);
            let request = AnalyzeRequest {
                connection_id: connection,
                sp_ids,
                analysis_type: options.mode,
                use_ai: options.use_ai,
                save_to_db: options.save_to_db,
            };
            (request, state.epochs)
        };

        info!(units = request.sp_ids.len(), mode = ?request.analysis_type, "running analysis");
        let result = self.service.run_analysis(&request).await;

        let mut state = self.inner.lock().await;
        if state.epochs.connection != epochs.connection || state.epochs.database != epochs.database
        {
            debug!("analysis finished after its database was replaced; discarding");
            return Err(WorkflowError::Superseded(Operation::RunAnalysis));
        }
        let before = state.stage();
        state.in_flight.analysis = false;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let err = self.fail(&mut state, Operation::RunAnalysis, None, err);
                self.emit_stage_change(before, &state);
                return Err(err);
            }
        };

        state.invalidate(Artifact::Analysis);
        let analysis = Arc::new(AnalysisResult::from_response(
            response,
            state.epochs.analysis,
        ));
        state.analysis = Some(Arc::clone(&analysis));
        info!(
            analysis_id = %analysis.analysis_id(),
            findings = analysis.findings().len(),
            "analysis ready"
        );
        self.emit(WorkflowEvent::AnalysisReady {
            findings: analysis.findings().len(),
        });
        self.emit_stage_change(before, &state);
        Ok(analysis)
    }

    /// Returns the finding with its evidence, fetching it when not yet present.
    pub async fn fetch_evidence(&self, finding_id: &FindingId) -> Result<Arc<Finding>, WorkflowError> {
        self.evidence(finding_id, false).await
    }

    /// Fetches evidence again even when the finding already carries some.
    pub async fn refetch_evidence(
        &self,
        finding_id: &FindingId,
    ) -> Result<Arc<Finding>, WorkflowError> {
        self.evidence(finding_id, true).await
    }

    async fn evidence(
        &self,
        finding_id: &FindingId,
        force: bool,
    ) -> Result<Arc<Finding>, WorkflowError> {
        let (request, connection_epoch, run) = {
            let mut state = self.inner.lock().await;
            match Self::prepare_evidence(&state, finding_id, force) {
                Ok(EvidencePlan::Cached(finding)) => return Ok(finding),
                Ok(EvidencePlan::Fetch(request, run)) => {
                    state.in_flight.evidence.insert(finding_id.clone());
                    state.errors.clear(Operation::FetchEvidence, Some(finding_id));
                    (request, state.epochs.connection, run)
                }
                Err(err) => {
                    return Err(self.fail(
                        &mut state,
                        Operation::FetchEvidence,
                        Some(finding_id),
                        err,
                    ))
                }
            }
        };

        debug!(%finding_id, sp_id = %request.sp_id, "fetching evidence");
        let result = self.service.fetch_evidence(&request).await;

        let mut state = self.inner.lock().await;
        state.in_flight.evidence.remove(finding_id);
        if state.epochs.connection != connection_epoch || state.current_run() != Some(run) {
            debug!(%finding_id, "evidence arrived for a replaced analysis; discarding");
            return Err(WorkflowError::Superseded(Operation::FetchEvidence));
        }
        let evidence = match result {
            Ok(evidence) => evidence,
            Err(err) => {
                return Err(self.fail(&mut state, Operation::FetchEvidence, Some(finding_id), err))
            }
        };

        let current = state.require_analysis()?;
        let patched = patch_evidence(&current, finding_id, evidence);
        let finding = patched
            .finding(finding_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownFinding(finding_id.clone()))?;
        state.analysis = Some(patched);
        info!(%finding_id, "evidence attached");
        self.emit(WorkflowEvent::EvidenceAttached(finding_id.clone()));
        Ok(finding)
    }

    fn prepare_evidence(
        state: &WorkflowState,
        finding_id: &FindingId,
        force: bool,
    ) -> Result<EvidencePlan, ValidationError> {
        let connection = state.require_connection()?;
        let analysis = state.require_analysis()?;
        let finding = analysis
            .finding(finding_id)
            .ok_or_else(|| ValidationError::UnknownFinding(finding_id.clone()))?;

        if !force && finding.evidence_data.is_some() {
            return Ok(EvidencePlan::Cached(Arc::clone(finding)));
        }

        let sp_id = finding
            .sp_id
            .ok_or_else(|| ValidationError::MissingWorkUnitReference(finding_id.clone()))?;
        let finding_type = finding
            .finding_type
            .as_deref()
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .ok_or_else(|| ValidationError::MissingFindingType(finding_id.clone()))?;

        Ok(EvidencePlan::Fetch(
            EvidenceRequest {
                connection_id: connection,
                sp_id,
                finding_type: finding_type.to_string(),
                code_snippet: finding.code_snippet().to_string(),
            },
            analysis.run(),
        ))
    }

    /// Generates a report over a frozen copy of the current analysis.
    pub async fn generate_report(
        &self,
        format: ReportFormat,
    ) -> Result<Arc<ReportArtifact>, WorkflowError> {
        let (request, frozen) = {
            let mut state = self.inner.lock().await;
            let analysis = match state.require_analysis() {
                Ok(analysis) => analysis,
                Err(err) => {
                    return Err(self.fail(&mut state, Operation::GenerateReport, None, err))
                }
            };
            state.in_flight.report = true;
            state.errors.clear(Operation::GenerateReport, None);
            let request = ReportRequest {
                analysis_id: analysis.analysis_id().clone(),
                format,
                include_code: true,
                include_recommendations: true,
                analysis_data: analysis.to_payload(),
            };
            (request, analysis)
        };

        info!(analysis_id = %request.analysis_id, %format, "generating report");
        let result = self.service.generate_report(&request).await;

        let mut state = self.inner.lock().await;
        let before = state.stage();
        state.in_flight.report = false;
        let descriptor = match result {
            Ok(descriptor) => descriptor,
            Err(err) => return Err(self.fail(&mut state, Operation::GenerateReport, None, err)),
        };

        let artifact = Arc::new(ReportArtifact::new(descriptor, format, Arc::clone(&frozen)));
        if state.current_run() == Some(frozen.run()) {
            state.report = Some(Arc::clone(&artifact));
        } else {
            debug!("report generated for an analysis that has since been replaced");
        }
        info!(file = %artifact.file_path, "report ready");
        self.emit(WorkflowEvent::ReportReady(Arc::clone(&artifact)));
        self.emit_stage_change(before, &state);
        Ok(artifact)
    }

    pub async fn units_page(&self, movement: PageMove) -> PageWindow<WorkUnit> {
        let mut state = self.inner.lock().await;
        let listing = state.listing.clone();
        let units = listing.as_ref().map(|listing| listing.units()).unwrap_or(&[]);
        state.units_cursor.apply(movement, units.len());
        state.units_cursor.window(units)
    }

    pub async fn findings_page(&self, movement: PageMove) -> PageWindow<Arc<Finding>> {
        let mut state = self.inner.lock().await;
        let analysis = state.analysis.clone();
        let findings = analysis
            .as_ref()
            .map(|analysis| analysis.findings())
            .unwrap_or(&[]);
        state.findings_cursor.apply(movement, findings.len());
        state.findings_cursor.window(findings)
    }

    /// Changes the units page size, keeping the current page within range.
    pub async fn set_units_page_size(&self, page_size: NonZeroUsize) -> PageWindow<WorkUnit> {
        let mut state = self.inner.lock().await;
        let listing = state.listing.clone();
        let units = listing.as_ref().map(|listing| listing.units()).unwrap_or(&[]);
        state.units_cursor.set_page_size(page_size, units.len());
        state.units_cursor.window(units)
    }

    pub async fn set_findings_page_size(
        &self,
        page_size: NonZeroUsize,
    ) -> PageWindow<Arc<Finding>> {
        let mut state = self.inner.lock().await;
        let analysis = state.analysis.clone();
        let findings = analysis
            .as_ref()
            .map(|analysis| analysis.findings())
            .unwrap_or(&[]);
        state.findings_cursor.set_page_size(page_size, findings.len());
        state.findings_cursor.window(findings)
    }

    pub async fn current_units_page(&self) -> PageWindow<WorkUnit> {
        let state = self.inner.lock().await;
        let units = state
            .listing
            .as_ref()
            .map(|listing| listing.units())
            .unwrap_or(&[]);
        state.units_cursor.window(units)
    }

    pub async fn current_findings_page(&self) -> PageWindow<Arc<Finding>> {
        let state = self.inner.lock().await;
        let findings = state
            .analysis
            .as_ref()
            .map(|analysis| analysis.findings())
            .unwrap_or(&[]);
        state.findings_cursor.window(findings)
    }
}

enum EvidencePlan {
    Cached(Arc<Finding>),
    Fetch(EvidenceRequest, u64),
}

#[cfg(test)]
#[path = "tests/workflow_tests.rs"]
mod tests;
