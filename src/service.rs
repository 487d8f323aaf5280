//! REST surface of the Sentinel service.
//!
//! Everything here is read-only with respect to documents: handlers report on the last run and
//! the defect ledger, trigger runs, toggle the scheduler and adjust configuration.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use fhir::ClinicalDocument;
use sentinel_core::{
    ChaosConfig, CoreConfig, Defect, DefectLedger, DefectStatus, Pipeline, RunId, RunReport,
    RunSummary, Severity, SharedVolume, execute_run,
};

/// Mutable service state. A run holds the lock for its whole duration, so runs never overlap.
pub struct ServiceState {
    config: CoreConfig,
    pipeline: Pipeline,
    volume: SharedVolume,
    ledger: DefectLedger,
    last_report: Option<RunReport>,
}

impl ServiceState {
    /// Build state from a resolved configuration, loading the ledger from the shared volume.
    pub fn load(config: CoreConfig) -> anyhow::Result<Self> {
        let volume = SharedVolume::from_config(&config);
        let ledger = volume.load_ledger()?;
        Ok(Self {
            pipeline: Pipeline::from_config(&config)?,
            volume,
            ledger,
            config,
            last_report: None,
        })
    }
}

/// Application state shared across REST handlers and the scheduler task.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Mutex<ServiceState>>,
    scheduler_running: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(state: ServiceState, scheduler_running: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            scheduler_running: Arc::new(AtomicBool::new(scheduler_running)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ServiceState>, ApiError> {
        self.inner.lock().map_err(|_| {
            tracing::error!("service state lock poisoned");
            internal("service state unavailable")
        })
    }

    pub fn scheduler_running(&self) -> bool {
        self.scheduler_running.load(Ordering::SeqCst)
    }

    /// Execute one run on a blocking thread.
    pub async fn trigger_run(&self) -> anyhow::Result<RunSummary> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| anyhow::anyhow!("service state lock poisoned"))?;
            let state = &mut *guard;
            let report =
                execute_run(&state.pipeline, &state.volume, &mut state.ledger, Utc::now())?;
            let summary = report.summary.clone();
            state.last_report = Some(report);
            Ok(summary)
        })
        .await?
    }
}

/// Tick every `interval`, running a batch whenever the scheduler is switched on.
pub async fn run_scheduler(state: AppState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !state.scheduler_running() {
            continue;
        }
        if let Err(e) = state.trigger_run().await {
            tracing::error!("Scheduled run failed: {:#}", e);
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RunSummaryRes {
    pub run: u64,
    pub audited_at: DateTime<Utc>,
    pub processed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed_ingest: usize,
    pub active_defects: usize,
    pub new_this_run: usize,
    pub resolved_this_run: usize,
    pub regressed_this_run: usize,
    pub acceptance_percent: u8,
}

impl From<&RunSummary> for RunSummaryRes {
    fn from(s: &RunSummary) -> Self {
        Self {
            run: s.run.get(),
            audited_at: s.audited_at,
            processed: s.processed,
            accepted: s.accepted,
            rejected: s.rejected,
            failed_ingest: s.failed_ingest,
            active_defects: s.active_defects,
            new_this_run: s.new_this_run,
            resolved_this_run: s.resolved_this_run,
            regressed_this_run: s.regressed_this_run,
            acceptance_percent: s.acceptance_percent(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SummaryRes {
    pub scheduler_running: bool,
    /// Last run recorded in the ledger, including runs from earlier processes.
    pub ledger_run: u64,
    pub total_defects: usize,
    pub active_defects: usize,
    /// Summary of the last run this process executed.
    pub last_run: Option<RunSummaryRes>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DefectRes {
    pub matching_key: String,
    pub rule_id: String,
    #[schema(value_type = String)]
    pub severity: Severity,
    #[schema(value_type = String)]
    pub status: DefectStatus,
    #[schema(value_type = u64)]
    pub first_seen_run: RunId,
    #[schema(value_type = u64)]
    pub last_seen_run: RunId,
    pub detail: String,
}

impl From<&Defect> for DefectRes {
    fn from(d: &Defect) -> Self {
        Self {
            matching_key: d.matching_key.to_string(),
            rule_id: d.rule_id.clone(),
            severity: d.severity,
            status: d.status,
            first_seen_run: d.first_seen_run,
            last_seen_run: d.last_seen_run,
            detail: d.detail.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListDefectsRes {
    pub defects: Vec<DefectRes>,
}

#[derive(Debug, Deserialize)]
pub struct DefectFilter {
    /// `active` or `resolved`.
    pub status: Option<DefectStatus>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DocumentRes {
    #[schema(value_type = Object)]
    pub document: ClinicalDocument,
    pub defects: Vec<DefectRes>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConfigRes {
    pub data_dir: String,
    pub batch_size: usize,
    pub chaos_enabled: bool,
    pub chaos_defects_per_document: usize,
    pub chaos_infection_rate: f64,
    pub chaos_seed: u64,
    pub disabled_rules: Vec<String>,
    /// Every rule id that may appear in `disabled_rules`.
    pub known_rules: Vec<String>,
}

impl ConfigRes {
    fn from_state(state: &ServiceState) -> Self {
        let cfg = &state.config;
        Self {
            data_dir: cfg.data_dir().display().to_string(),
            batch_size: cfg.batch_size(),
            chaos_enabled: cfg.chaos().enabled,
            chaos_defects_per_document: cfg.chaos().defects_per_document,
            chaos_infection_rate: cfg.chaos().infection_rate,
            chaos_seed: cfg.chaos().seed,
            disabled_rules: cfg.disabled_rules().iter().cloned().collect(),
            known_rules: state
                .pipeline
                .sentinel()
                .catalog()
                .ids()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Partial configuration update; absent fields keep their current value.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateConfigReq {
    pub batch_size: Option<usize>,
    pub chaos_enabled: Option<bool>,
    pub chaos_defects_per_document: Option<usize>,
    pub chaos_infection_rate: Option<f64>,
    pub chaos_seed: Option<u64>,
    pub disabled_rules: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SchedulerRes {
    pub running: bool,
}

type ApiError = (StatusCode, String);

fn internal(message: &str) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
}

// ============================================================================
// Router
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        summary,
        list_defects,
        get_document,
        trigger_run,
        start_scheduler,
        stop_scheduler,
        get_config,
        update_config,
    ),
    components(schemas(
        HealthRes,
        RunSummaryRes,
        SummaryRes,
        DefectRes,
        ListDefectsRes,
        DocumentRes,
        ConfigRes,
        UpdateConfigReq,
        SchedulerRes,
    ))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/summary", get(summary))
        .route("/defects", get(list_defects))
        .route("/documents/*key", get(get_document))
        .route("/runs", post(trigger_run))
        .route("/scheduler/start", post(start_scheduler))
        .route("/scheduler/stop", post(stop_scheduler))
        .route("/config", get(get_config).put(update_config))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
async fn health() -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "Sentinel is alive".into(),
    })
}

#[utoipa::path(
    get,
    path = "/summary",
    responses(
        (status = 200, description = "Ledger totals and the last run summary", body = SummaryRes),
        (status = 500, description = "Internal server error")
    )
)]
/// Headline numbers for the dashboard.
async fn summary(State(state): State<AppState>) -> Result<Json<SummaryRes>, ApiError> {
    let running = state.scheduler_running();
    let inner = state.lock()?;
    Ok(Json(SummaryRes {
        scheduler_running: running,
        ledger_run: inner.ledger.last_run().get(),
        total_defects: inner.ledger.len(),
        active_defects: inner.ledger.active().count(),
        last_run: inner
            .last_report
            .as_ref()
            .map(|r| RunSummaryRes::from(&r.summary)),
    }))
}

#[utoipa::path(
    get,
    path = "/defects",
    params(
        ("status" = Option<String>, Query, description = "Filter by `active` or `resolved`")
    ),
    responses(
        (status = 200, description = "Defect ledger entries", body = ListDefectsRes),
        (status = 500, description = "Internal server error")
    )
)]
async fn list_defects(
    State(state): State<AppState>,
    Query(filter): Query<DefectFilter>,
) -> Result<Json<ListDefectsRes>, ApiError> {
    let inner = state.lock()?;
    let defects = inner
        .ledger
        .iter()
        .filter(|d| filter.status.is_none_or(|s| d.status == s))
        .map(DefectRes::from)
        .collect();
    Ok(Json(ListDefectsRes { defects }))
}

#[utoipa::path(
    get,
    path = "/documents/{key}",
    params(
        ("key" = String, Path, description = "Matching key, e.g. `482913/Patient/9434767067`")
    ),
    responses(
        (status = 200, description = "Annotated document from the last run", body = DocumentRes),
        (status = 404, description = "No document with this key in the last run"),
        (status = 500, description = "Internal server error")
    )
)]
/// One annotated document from the last run, with its ledger entries.
async fn get_document(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DocumentRes>, ApiError> {
    let key = key.trim_start_matches('/');
    let inner = state.lock()?;
    let document = inner
        .last_report
        .as_ref()
        .and_then(|r| r.documents().find(|d| d.matching_key.as_str() == key))
        .cloned()
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no document {key}")))?;
    let defects = inner
        .ledger
        .defects_for(&document.matching_key)
        .map(DefectRes::from)
        .collect();
    Ok(Json(DocumentRes { document, defects }))
}

#[utoipa::path(
    post,
    path = "/runs",
    responses(
        (status = 200, description = "Run completed", body = RunSummaryRes),
        (status = 500, description = "Run failed")
    )
)]
/// Run one batch now, outside the schedule.
async fn trigger_run(State(state): State<AppState>) -> Result<Json<RunSummaryRes>, ApiError> {
    match state.trigger_run().await {
        Ok(summary) => Ok(Json(RunSummaryRes::from(&summary))),
        Err(e) => {
            tracing::error!("Manual run failed: {:#}", e);
            Err(internal("run failed"))
        }
    }
}

#[utoipa::path(
    post,
    path = "/scheduler/start",
    responses(
        (status = 200, description = "Scheduler running", body = SchedulerRes)
    )
)]
async fn start_scheduler(State(state): State<AppState>) -> Json<SchedulerRes> {
    state.scheduler_running.store(true, Ordering::SeqCst);
    tracing::info!("Scheduler started");
    Json(SchedulerRes { running: true })
}

#[utoipa::path(
    post,
    path = "/scheduler/stop",
    responses(
        (status = 200, description = "Scheduler stopped", body = SchedulerRes)
    )
)]
async fn stop_scheduler(State(state): State<AppState>) -> Json<SchedulerRes> {
    state.scheduler_running.store(false, Ordering::SeqCst);
    tracing::info!("Scheduler stopped");
    Json(SchedulerRes { running: false })
}

#[utoipa::path(
    get,
    path = "/config",
    responses(
        (status = 200, description = "Current configuration", body = ConfigRes),
        (status = 500, description = "Internal server error")
    )
)]
async fn get_config(State(state): State<AppState>) -> Result<Json<ConfigRes>, ApiError> {
    let inner = state.lock()?;
    Ok(Json(ConfigRes::from_state(&inner)))
}

#[utoipa::path(
    put,
    path = "/config",
    request_body = UpdateConfigReq,
    responses(
        (status = 200, description = "Configuration updated", body = ConfigRes),
        (status = 400, description = "Invalid configuration"),
        (status = 500, description = "Internal server error")
    )
)]
/// Apply a partial configuration update. The next run uses the new settings.
async fn update_config(
    State(state): State<AppState>,
    Json(req): Json<UpdateConfigReq>,
) -> Result<Json<ConfigRes>, ApiError> {
    let mut inner = state.lock()?;
    let current = &inner.config;

    let chaos = ChaosConfig {
        enabled: req.chaos_enabled.unwrap_or(current.chaos().enabled),
        defects_per_document: req
            .chaos_defects_per_document
            .unwrap_or(current.chaos().defects_per_document),
        infection_rate: req
            .chaos_infection_rate
            .unwrap_or(current.chaos().infection_rate),
        seed: req.chaos_seed.unwrap_or(current.chaos().seed),
    };
    let disabled_rules = match req.disabled_rules {
        Some(ids) => ids.into_iter().collect::<BTreeSet<_>>(),
        None => current.disabled_rules().clone(),
    };

    let bad_request = |e: sentinel_core::SentinelError| (StatusCode::BAD_REQUEST, e.to_string());
    let config = CoreConfig::new(
        current.data_dir().to_path_buf(),
        req.batch_size.unwrap_or(current.batch_size()),
        chaos,
        disabled_rules,
    )
    .map_err(bad_request)?;
    let pipeline = Pipeline::from_config(&config).map_err(bad_request)?;

    tracing::info!(
        batch_size = config.batch_size(),
        chaos = config.chaos().enabled,
        disabled_rules = config.disabled_rules().len(),
        "Configuration updated"
    );
    inner.config = config;
    inner.pipeline = pipeline;
    Ok(Json(ConfigRes::from_state(&inner)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const HR_OUT_OF_RANGE: &str = r"MSH|^~\&|LEGACY_PAS|LEEDS_GEN|SENTINEL|NHS_TRUST|202401050930||ORU^R01|482913|P|2.3
PID|1||9434767067^^^NHS||SMITH^John^^^MR||19800101|M
OBR|1|||VITALS^Vital signs|||202401050930
OBX|1|NM|8867-4^HEART RATE^LN||999|/min|||||F";

    fn app_state(dir: &TempDir) -> AppState {
        let config = CoreConfig::new(
            dir.path().to_path_buf(),
            10,
            ChaosConfig::default(),
            BTreeSet::new(),
        )
        .unwrap();
        let volume = SharedVolume::from_config(&config);
        volume.ensure_layout().unwrap();
        std::fs::write(volume.inbound_dir().join("msg_001.hl7"), HR_OUT_OF_RANGE).unwrap();
        AppState::new(ServiceState::load(config).unwrap(), false)
    }

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_alive() {
        let dir = TempDir::new().unwrap();
        let (status, json) = send(build_router(app_state(&dir)), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn manual_run_populates_summary_defects_and_documents() {
        let dir = TempDir::new().unwrap();
        let state = app_state(&dir);

        let (status, json) = send(build_router(state.clone()), "GET", "/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["last_run"].is_null());

        let (status, json) = send(build_router(state.clone()), "POST", "/runs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["run"], 1);
        assert_eq!(json["processed"], 1);
        assert_eq!(json["rejected"], 1);
        assert_eq!(json["new_this_run"], 1);

        let uri = "/defects?status=active";
        let (_, json) = send(build_router(state.clone()), "GET", uri, None).await;
        let defects = json["defects"].as_array().unwrap();
        assert_eq!(defects.len(), 1);
        assert_eq!(defects[0]["rule_id"], "observation.heart-rate.range");
        assert_eq!(defects[0]["severity"], "clinical");

        let uri = "/defects?status=resolved";
        let (_, json) = send(build_router(state.clone()), "GET", uri, None).await;
        assert!(json["defects"].as_array().unwrap().is_empty());

        let (status, json) = send(
            build_router(state.clone()),
            "GET",
            "/documents/482913/Observation/8867-4",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["document"]["matchingKey"], "482913/Observation/8867-4");
        assert_eq!(json["defects"].as_array().unwrap().len(), 1);

        let uri = "/documents/482913/Patient/0000000000";
        let (status, _) = send(build_router(state.clone()), "GET", uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, json) = send(build_router(state), "GET", "/summary", None).await;
        assert_eq!(json["ledger_run"], 1);
        assert_eq!(json["active_defects"], 1);
        assert_eq!(json["last_run"]["acceptance_percent"], 0);
        assert!(dir.path().join("defect_ledger.yaml").exists());
    }

    #[tokio::test]
    async fn config_updates_are_validated() {
        let dir = TempDir::new().unwrap();
        let state = app_state(&dir);

        let (status, _) = send(
            build_router(state.clone()),
            "PUT",
            "/config",
            Some(serde_json::json!({ "chaos_infection_rate": 1.5 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            build_router(state.clone()),
            "PUT",
            "/config",
            Some(serde_json::json!({ "disabled_rules": ["no.such.rule"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(
            build_router(state.clone()),
            "PUT",
            "/config",
            Some(serde_json::json!({
                "batch_size": 2,
                "disabled_rules": ["observation.heart-rate.range"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["batch_size"], 2);
        assert_eq!(json["chaos_enabled"], false);

        // The disabled range rule no longer opens a defect.
        let (_, json) = send(build_router(state.clone()), "POST", "/runs", None).await;
        assert_eq!(json["accepted"], 1);
        assert_eq!(json["new_this_run"], 0);

        let (_, json) = send(build_router(state), "GET", "/config", None).await;
        assert_eq!(json["disabled_rules"][0], "observation.heart-rate.range");
        assert_eq!(json["known_rules"].as_array().unwrap().len(), 17);
    }

    #[tokio::test]
    async fn scheduler_can_be_started_and_stopped() {
        let dir = TempDir::new().unwrap();
        let state = app_state(&dir);
        assert!(!state.scheduler_running());

        let (_, json) = send(build_router(state.clone()), "POST", "/scheduler/start", None).await;
        assert_eq!(json["running"], true);
        assert!(state.scheduler_running());

        let (_, json) = send(build_router(state.clone()), "POST", "/scheduler/stop", None).await;
        assert_eq!(json["running"], false);
        assert!(!state.scheduler_running());
    }

    #[tokio::test]
    async fn openapi_document_lists_every_route() {
        let dir = TempDir::new().unwrap();
        let (status, json) =
            send(build_router(app_state(&dir)), "GET", "/api-docs/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        let paths = json["paths"].as_object().unwrap();
        for path in ["/health", "/summary", "/defects", "/documents/{key}", "/runs", "/config"] {
            assert!(paths.contains_key(path), "{path}");
        }
    }
}
