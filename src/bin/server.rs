//! `veritas-server`: boots the orchestration engine behind the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use veritas_engine::api;
use veritas_engine::approvals::{self, ApprovalStore};
use veritas_engine::audit::{self, AuditStore};
use veritas_engine::composer::ExtractiveComposer;
use veritas_engine::config::Config;
use veritas_engine::decision::CalibrationStore;
use veritas_engine::idempotency::{self, IdempotencyStore};
use veritas_engine::metrics::Metrics;
use veritas_engine::policy::PolicyRegistry;
use veritas_engine::retriever::lexical::LexicalIndex;
use veritas_engine::retriever::vector::{HashEmbedder, InMemoryFlatIndex};
use veritas_engine::retriever::HybridRetriever;
use veritas_engine::tools::circuit_breaker::CircuitBreakerRegistry;
use veritas_engine::tools::math_eval::MathEvalTool;
use veritas_engine::tools::table_query::{RateLimiter, TableQueryTool};
use veritas_engine::tools::ToolDispatcher;
use veritas_engine::uncertainty::SnneEstimator;
use veritas_engine::verifier::RuleVerifier;
use veritas_engine::Engine;

#[derive(Parser)]
#[command(name = "veritas-server")]
#[command(about = "Grounded question-answering orchestration engine server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(host = %config.api.host, port = config.api.port, "starting veritas-engine");

    let lexical = Arc::new(LexicalIndex::new());
    let vector = Arc::new(InMemoryFlatIndex::new());
    let retriever = Arc::new(HybridRetriever::new(lexical, vector));

    if let Some(dir) = config.database.index_db_path.parent() {
        std::fs::create_dir_all(dir).ok();
    }

    let index_conn = rusqlite::Connection::open(&config.database.index_db_path)
        .unwrap_or_else(|_| rusqlite::Connection::open_in_memory().expect("in-memory fallback"));
    let table_tool = TableQueryTool {
        conn: Arc::new(parking_lot::Mutex::new(index_conn)),
        allowed_tables: vec!["memory".to_string(), "corpus".to_string()],
        rate_limiter: Arc::new(RateLimiter::new(10.0, 1.0)),
        max_rows: 500,
        timeout: std::time::Duration::from_secs(5),
    };

    let mut tools = ToolDispatcher::new(Arc::new(CircuitBreakerRegistry::default()));
    tools.register(Arc::new(MathEvalTool));
    tools.register(Arc::new(table_tool));
    #[cfg(feature = "web-tools")]
    {
        use veritas_engine::tools::egress::EgressPolicy;
        use veritas_engine::tools::web::{WebFetchTool, WebSearchTool};
        let egress = EgressPolicy::default();
        tools.register(Arc::new(WebFetchTool::new(egress.clone())));
        if let Ok(endpoint) = "https://example-search.invalid/search".parse() {
            tools.register(Arc::new(WebSearchTool::new(endpoint, egress)));
        }
    }

    let approvals = Arc::new(ApprovalStore::new(std::time::Duration::from_secs(
        config.budgets.approval_ttl_seconds,
    )));
    approvals::spawn_sweeper(approvals.clone(), std::time::Duration::from_secs(60));

    let steps_db_path = config
        .database
        .index_db_path
        .with_file_name(format!(
            "{}.steps.db",
            config.database.index_db_path.file_stem().and_then(|s| s.to_str()).unwrap_or("index")
        ));
    let audit_store = Arc::new(AuditStore::open(&steps_db_path)?);
    audit::spawn_sweeper(
        audit_store.clone(),
        std::time::Duration::from_secs(config.budgets.step_ttl_days * 24 * 3600),
        std::time::Duration::from_secs(3600),
    );

    let idempotency_store = Arc::new(IdempotencyStore::default());
    idempotency::spawn_sweeper(idempotency_store.clone(), std::time::Duration::from_secs(60));

    let engine = Arc::new(Engine {
        retriever,
        composer: Arc::new(ExtractiveComposer),
        uncertainty: Arc::new(SnneEstimator::new(Arc::new(HashEmbedder::default()))),
        verifier: Arc::new(RuleVerifier),
        tools: Arc::new(tools),
        approvals,
        policy: Arc::new(PolicyRegistry::default()),
        calibration: Arc::new(CalibrationStore::new(0.7, 0.1)),
        audit: audit_store,
        idempotency: idempotency_store,
        metrics: Metrics::shared(),
        memory_budget_default: config.budgets.memory_budget_default,
    });

    let router = api::build_router(engine);
    let bind_addr = format!("{}:{}", config.api.host, config.api.port);
    api::serve(router, &bind_addr).await?;

    Ok(())
}
