//! flowsmith - CLI entry point
//!
//! Runs one request through the pipeline and prints the workflow JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use flowsmith::config::Config;
use flowsmith::cost::CostLedger;
use flowsmith::events::LogEventSink;
use flowsmith::knowledge::{CatalogRetriever, PatternTypeExtractor};
use flowsmith::validation::BasicStructuralValidator;
use flowsmith::{OrchestrationOptions, OrchestrationRequest, Orchestrator, PipelineError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flowsmith")]
#[command(about = "Generate verified n8n workflows from plain-language requests", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a workflow for a request
    Generate {
        /// What the workflow should do
        request: String,

        /// JSON document catalog (overrides FLOWSMITH_CATALOG_PATH)
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Session id for cost tracking
        #[arg(long)]
        session: Option<String>,

        /// Skip the structural auto-fix pass
        #[arg(long)]
        no_auto_fix: bool,

        /// Supervision rounds (overrides FLOWSMITH_MAX_ROUNDS)
        #[arg(long)]
        max_rounds: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only the workflow.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowsmith=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Generate {
            request,
            catalog,
            session,
            no_auto_fix,
            max_rounds,
        } => generate(request, catalog, session, no_auto_fix, max_rounds).await,
    }
}

async fn generate(
    text: String,
    catalog: Option<PathBuf>,
    session: Option<String>,
    no_auto_fix: bool,
    max_rounds: Option<u32>,
) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: generator={} verifier={}",
        config.generator.model, config.supervisor.model
    );

    let retriever = match catalog.or_else(|| config.catalog_path.clone()) {
        Some(path) => CatalogRetriever::from_file(&path)
            .with_context(|| format!("loading catalog {}", path.display()))?,
        None => {
            warn!("No document catalog configured; every request will run in fallback mode");
            CatalogRetriever::default()
        }
    };

    let ledger = Arc::new(CostLedger::new());
    let orchestrator = Orchestrator::from_config(
        &config,
        Arc::new(retriever),
        Arc::new(PatternTypeExtractor::new()?),
        Arc::new(BasicStructuralValidator),
    )
    .with_ledger(ledger.clone())
    .with_event_sink(Arc::new(LogEventSink));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let mut request = OrchestrationRequest::new(text).with_options(OrchestrationOptions {
        auto_fix: !no_auto_fix,
        max_rounds,
        prior_errors: Vec::new(),
        cancel: Some(cancel),
    });
    if let Some(session) = session {
        request = request.with_session(session);
    }

    match orchestrator.run(request).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result.workflow)?);
            for warning in &result.warnings {
                warn!("{}", warning);
            }
            if let Some(report) = ledger.report(&result.metadata.session_id) {
                eprintln!("{}", report);
            }
            Ok(())
        }
        Err(PipelineError::TerminalRejection {
            attempts,
            feedback,
            invented,
            candidate,
        }) => {
            for entity in &invented {
                eprintln!("invented: {} ({})", entity.name, entity.claimed_type);
            }
            eprintln!(
                "last candidate:\n{}",
                serde_json::to_string_pretty(&candidate)?
            );
            anyhow::bail!("workflow rejected after {} attempts: {}", attempts, feedback)
        }
        Err(e) => Err(e.into()),
    }
}
