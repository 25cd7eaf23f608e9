use anyhow::{Context, Result};
use clap::Parser;
use form_flow::{
    ApiConfig, ApplicationApi, FlowConfig, FlowController, FlowError, FlowStorage,
    HttpApplicationApi, InMemoryApplicationApi, InMemoryFlowStorage, JsonFileFlowStorage,
    PostgresFlowStorage, StepOutcome, SubmitOptions,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// Walks an application draft through the first steps of the form.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Application API base URL. Uses an in-memory backend when omitted.
    #[arg(long, env = "APPLICATION_API_BASE")]
    api_base: Option<String>,

    /// YAML file describing the form steps.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep form state in this JSON file.
    #[arg(long, conflicts_with = "database_url")]
    state_file: Option<PathBuf>,

    /// Keep form state in PostgreSQL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Page URL the flow was opened from; its resume parameter wins over stored state.
    #[arg(long)]
    page_url: Option<Url>,

    /// Discard any stored progress before starting.
    #[arg(long)]
    reset: bool,
}

/// Initialize tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "form_flow_demo=info,form_flow=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }
}

fn build_api(args: &Args) -> Result<Arc<dyn ApplicationApi>> {
    match &args.api_base {
        Some(base_url) => {
            info!(%base_url, "using HTTP application API");
            let config = ApiConfig::from_env_with_base(base_url.clone())?;
            Ok(Arc::new(HttpApplicationApi::new(&config)?))
        }
        None => {
            info!("using in-memory application API (set APPLICATION_API_BASE for a real backend)");
            Ok(Arc::new(InMemoryApplicationApi::new()))
        }
    }
}

async fn build_storage(args: &Args) -> Result<Arc<dyn FlowStorage>> {
    if let Some(database_url) = &args.database_url {
        info!("Using PostgreSQL flow storage");
        match PostgresFlowStorage::connect(database_url).await {
            Ok(storage) => return Ok(Arc::new(storage)),
            Err(e) => warn!("Failed to connect to PostgreSQL: {}. Falling back to in-memory storage.", e),
        }
    } else if let Some(path) = &args.state_file {
        info!(path = %path.display(), "using JSON file flow storage");
        return Ok(Arc::new(JsonFileFlowStorage::open(path).await?));
    }
    Ok(Arc::new(InMemoryFlowStorage::new()))
}

async fn load_config(args: &Args) -> Result<FlowConfig> {
    match &args.config {
        Some(path) => FlowConfig::from_yaml_file(path)
            .await
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(FlowConfig::from_env()?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = load_config(&args).await?;
    let api = build_api(&args)?;
    let storage = build_storage(&args).await?;

    let controller = match &args.page_url {
        Some(url) => FlowController::load_from_url(config, api, storage, url).await?,
        None => FlowController::load(config, api, storage).await?,
    };
    if args.reset {
        controller.reset_flow().await?;
    }

    println!("Starting application form flow\n");
    println!("Current step: {}", controller.current_step());
    println!("Completed steps: {:?}\n", controller.completed_steps());

    // Document extraction results usually arrive before the user reaches the step.
    let adopted = controller
        .apply_prefill(
            2,
            json!({
                "passport_number": "N1234567",
                "given_name": "ANN",
                "family_name": "LEE",
            }),
        )
        .await?;
    println!("Passport OCR data adopted for step 2: {adopted}");

    let steps = [
        (1, json!({ "given_name": "Ann", "email": "ann@example.com" })),
        (2, json!({ "given_name": "Ann", "passport_number": null })),
        (3, json!({ "course": "Master of Business Administration", "intake": "2027-02" })),
    ];

    for (step, payload) in steps {
        println!("-------");
        println!("Submitting step {step}");
        match controller
            .submit_step(step, payload, SubmitOptions::default())
            .await
        {
            Ok(StepOutcome::Completed { current_step, .. }) => {
                println!("Step {step} saved, now on step {current_step}");
            }
            Ok(StepOutcome::Superseded { .. }) => {
                println!("Step {step} was superseded by a newer submission");
            }
            Err(e) => {
                println!("Step {step} failed: {e}");
                break;
            }
        }
    }

    println!("-------");
    match controller.go_to_step(controller.plan().last_step()).await {
        Ok(step) => println!("Jumped to step {step}"),
        Err(FlowError::NavigationBlocked { target, missing }) => {
            println!("Cannot jump to step {target} yet, still missing {missing:?}");
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(merged) = controller.merged_answer(2) {
        println!("Step 2 answer with OCR defaults: {merged}");
    }

    let progress = controller.progress();
    println!(
        "\nProgress: {}/{} steps completed ({} remaining)",
        progress.completed, progress.total, progress.remaining
    );
    if let Some(draft_id) = controller.draft_id() {
        println!("Draft id: {draft_id}");
    }
    if let Some(url) = &args.page_url {
        println!("Resume link: {}", controller.canonical_url(url));
    }

    println!("\nForm flow demo finished");
    Ok(())
}
