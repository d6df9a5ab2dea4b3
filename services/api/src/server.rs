use crate::cli::ServeArgs;
use crate::infra::{
    builtin_policy_documents, AppState, SampleIntake, ScorecardRiskModel, TemplateLanguageModel,
};
use crate::routes::with_underwriting_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use credit_ai::config::{AppConfig, UnderwritingConfig};
use credit_ai::error::AppError;
use credit_ai::telemetry;
use credit_ai::workflows::underwriting::policy::parse_policy_csv;
use credit_ai::workflows::underwriting::{
    BroadcastEventSink, Collaborators, EventSink, InMemoryRunStore, JsonFileRunStore,
    LanguageModel, PolicyEngine, RiskModel, RunStore, UnderwritingOrchestrator,
    UnderwritingService, UnderwritingServiceError, WorkflowEvent,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let events = BroadcastEventSink::new(256);
    spawn_event_logger(&events);
    let service = Arc::new(build_service(
        &config.underwriting,
        SampleIntake::seeded(),
        Models::default(),
        Arc::new(events),
    )?);

    let recovered = service
        .orchestrator()
        .recover()
        .await
        .map_err(UnderwritingServiceError::from)?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "resumed interrupted underwriting runs");
    }

    let app = with_underwriting_routes(service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "credit underwriting service ready");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Scoring collaborators handed to the orchestrator.
pub(crate) struct Models {
    pub(crate) risk: Arc<dyn RiskModel>,
    pub(crate) language: Arc<dyn LanguageModel>,
}

impl Default for Models {
    fn default() -> Self {
        Self {
            risk: Arc::new(ScorecardRiskModel::default()),
            language: Arc::new(TemplateLanguageModel::default()),
        }
    }
}

/// Wire the orchestrator to the configured store, the policy corpus, and the sample collaborators.
pub(crate) fn build_service(
    config: &UnderwritingConfig,
    intake: SampleIntake,
    models: Models,
    events: Arc<dyn EventSink>,
) -> Result<UnderwritingService, AppError> {
    let store: Arc<dyn RunStore> = match &config.state_path {
        Some(path) => {
            info!(path = %path.display(), "using durable run store");
            Arc::new(JsonFileRunStore::open(path.clone())?)
        }
        None => Arc::new(InMemoryRunStore::new()),
    };

    let policy = Arc::new(PolicyEngine::in_memory(config.chunking));
    let documents = match &config.policy_csv {
        Some(path) => parse_policy_csv(std::fs::File::open(path)?)?,
        None => builtin_policy_documents(),
    };
    for document in &documents {
        let receipt = policy.index(document)?;
        info!(
            document_id = %receipt.document_id,
            version = receipt.document_version,
            chunks = receipt.chunk_count,
            "indexed policy document"
        );
    }

    let intake = Arc::new(intake);
    let collaborators = Collaborators {
        store,
        applications: intake.clone(),
        documents: intake.clone(),
        bureau: intake.clone(),
        blacklist: intake,
        risk_model: models.risk,
        language_model: models.language,
        policy,
        events,
    };
    let orchestrator = UnderwritingOrchestrator::new(collaborators, config.orchestrator_settings());
    Ok(UnderwritingService::new(orchestrator))
}

fn spawn_event_logger(events: &BroadcastEventSink) {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(WorkflowEvent::StepCompleted {
                    run_id,
                    step,
                    status,
                    progress,
                }) => info!(
                    run_id = %run_id,
                    step = step.label(),
                    ?status,
                    progress,
                    "workflow step settled"
                ),
                Ok(WorkflowEvent::DecisionFinalized {
                    application_id,
                    status,
                }) => info!(
                    application_id = %application_id,
                    status = status.label(),
                    "decision finalized"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
