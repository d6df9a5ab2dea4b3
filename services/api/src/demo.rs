use crate::infra::{SampleIntake, ScorecardRiskModel, TemplateLanguageModel};
use crate::server::{build_service, Models};
use chrono::{Local, Months};
use clap::Args;
use credit_ai::config::AppConfig;
use credit_ai::error::AppError;
use credit_ai::workflows::underwriting::run::STAGES;
use credit_ai::workflows::underwriting::{
    ApplicationId, BroadcastEventSink, RunStatus, UnderwritingServiceError, WorkflowEvent,
    WorkflowRun,
};
use std::sync::Arc;

#[derive(Args, Debug, Clone)]
pub(crate) struct DemoArgs {
    /// Sample application to underwrite (app-1001, app-1002, app-1003)
    #[arg(long, default_value = "app-1001")]
    pub(crate) application: String,
    /// Pin the normalized risk score (0-1) instead of using the sample scorecard
    #[arg(long)]
    pub(crate) risk_score: Option<f64>,
    /// Pin the language model's qualitative score (0-1)
    #[arg(long)]
    pub(crate) reasoning_score: Option<f64>,
    /// Confidence reported alongside the qualitative score (0-1)
    #[arg(long)]
    pub(crate) confidence: Option<f64>,
    /// Override the applicant's age in years
    #[arg(long)]
    pub(crate) age: Option<u32>,
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;
    config.underwriting.state_path = None;

    let application_id = ApplicationId(args.application.clone());
    let intake = SampleIntake::seeded();
    if let Some(age) = args.age {
        let today = Local::now().date_naive();
        intake
            .adjust_applicant(&application_id, |applicant| {
                if let Some(born) = today.checked_sub_months(Months::new(age * 12)) {
                    applicant.date_of_birth = born;
                }
            })
            .map_err(UnderwritingServiceError::from)?;
    }

    let samples: Vec<String> = intake
        .application_ids()
        .map_err(UnderwritingServiceError::from)?
        .into_iter()
        .map(|id| id.0)
        .collect();

    let models = pinned_models(&args);
    let events = BroadcastEventSink::new(64);
    let mut receiver = events.subscribe();
    let service = build_service(&config.underwriting, intake, models, Arc::new(events))?;

    println!("Credit underwriting demo");
    println!("- application {} (samples: {})", application_id, samples.join(", "));
    let thresholds = service.orchestrator().default_thresholds();
    println!(
        "- thresholds: approve >= {} | reject < {}",
        thresholds.approve, thresholds.reject
    );

    let run_id = service.start(&application_id, None, None).await?;
    let run = service
        .orchestrator()
        .wait(&run_id)
        .await
        .map_err(UnderwritingServiceError::from)?;

    println!("\nEvents");
    while let Ok(event) = receiver.try_recv() {
        match event {
            WorkflowEvent::StepCompleted {
                step,
                status,
                progress,
                ..
            } => println!(
                "  - {:<20} {:<10} {:>5.1}%",
                step.label(),
                format!("{status:?}").to_lowercase(),
                progress * 100.0
            ),
            WorkflowEvent::DecisionFinalized { status, .. } => {
                println!("  - decision finalized: {}", status.label())
            }
        }
    }

    print_steps(&run);
    print_outcome(&run);

    println!("\nAudit trail");
    for entry in service.audit_trail(&run_id)? {
        let step = entry.step.map(|step| step.label()).unwrap_or("-");
        println!(
            "  #{:<3} {:<18} {:<20} {}",
            entry.sequence,
            format!("{:?}", entry.action),
            step,
            entry.detail
        );
    }

    Ok(())
}

fn pinned_models(args: &DemoArgs) -> Models {
    let mut models = Models::default();
    if let Some(risk_score) = args.risk_score {
        models.risk = Arc::new(ScorecardRiskModel::pinned(1.0 - risk_score.clamp(0.0, 1.0)));
    }
    if args.reasoning_score.is_some() || args.confidence.is_some() {
        models.language = Arc::new(TemplateLanguageModel::pinned(
            args.reasoning_score.unwrap_or(0.8),
            args.confidence.unwrap_or(0.9),
        ));
    }
    models
}

fn print_steps(run: &WorkflowRun) {
    println!("\nStages");
    for (index, stage) in STAGES.iter().enumerate() {
        for step in stage.iter() {
            let state = run.step(*step);
            let error = state
                .last_error
                .as_deref()
                .map(|message| format!(" ({message})"))
                .unwrap_or_default();
            println!(
                "  {}. {:<20} {:?} x{}{}",
                index + 1,
                step.label(),
                state.status,
                state.attempts,
                error
            );
        }
    }
}

fn print_outcome(run: &WorkflowRun) {
    println!("\nOutcome: run {}", run.status.label());
    if let Some(message) = &run.error_message {
        println!("  error: {message}");
    }

    let Some(decision) = run.fused_decision() else {
        return;
    };
    println!(
        "  composite {} ({}) -> {}",
        decision.composite_score,
        decision.rating.label(),
        decision.status.label()
    );
    println!(
        "  risk {:.3} | reasoning {:.3}{}",
        decision.risk_score,
        decision.reasoning_score,
        if decision.reasoning_advisory {
            " (advisory)"
        } else {
            ""
        }
    );
    println!("  {}", decision.reason);
    for violation in &decision.violations {
        println!("    - {:?} {}", violation.severity, violation.summary());
    }

    if run.status == RunStatus::AwaitingReview {
        println!(
            "  awaiting human review: POST /api/v1/underwriting/workflow/{}/review",
            run.run_id
        );
    }
    match run.memo() {
        Some(memo) => println!("\nCredit memo {}\n{}", memo.memo_id, memo.content),
        None => println!("  no credit memo drafted"),
    }
}
