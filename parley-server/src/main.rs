use std::sync::Arc;

use clap::Parser;
use parley_core::chain::ChainBuilder;
use parley_core::config::PromptBackend;
use parley_core::embeddings::{EmbeddingBackend, EmbeddingClientConfig, OpenAIEmbeddingClient};
use parley_core::index::{PgVectorIndex, VectorIndex};
use parley_core::llm::{ChatClientConfig, CompletionBackend, OpenAIChatClient};
use parley_core::retriever::KnowledgeBase;
use parley_core::store::{
    DocumentStore, FilePromptStore, HistoryStore, PgDocumentStore, PgHistoryStore, PgPromptStore,
    PromptStore,
};
use parley_core::ParleyConfig;
use parley_ingest::{Indexer, RecursiveSplitter, Uploader};
use parley_server::http::HttpState;
use parley_server::subsystems::session::SessionManager;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "parley.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match ParleyConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging: RUST_LOG wins, config level otherwise
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.as_str()));
    fmt().with_env_filter(filter).init();

    // Connect to DB
    let pool = match parley_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match parley_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match parley_core::db::check_pgvector(&pool).await {
            Ok(v) => println!("✅ pgvector version: {}", v),
            Err(e) => {
                println!("❌ pgvector check failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("✅ Parley DB health check passed");
        return Ok(());
    }

    if let Err(e) = parley_core::db::ensure_schema(&pool).await {
        eprintln!("Failed to prepare database schema: {}", e);
        std::process::exit(1);
    }

    // External clients
    let embedder: Arc<dyn EmbeddingBackend> = match OpenAIEmbeddingClient::with_base_url(
        EmbeddingClientConfig::from_settings(&config.embedding, None),
        config.embedding.base_url.clone(),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to create embedding client: {}", e);
            std::process::exit(1);
        }
    };

    let condense_llm: Arc<dyn CompletionBackend> = match OpenAIChatClient::with_base_url(
        ChatClientConfig::from_settings(&config.llm, config.llm.condense_max_tokens, None),
        config.llm.base_url.clone(),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to create chat client: {}", e);
            std::process::exit(1);
        }
    };

    let answer_llm: Arc<dyn CompletionBackend> = match OpenAIChatClient::with_base_url(
        ChatClientConfig::from_settings(&config.llm, config.llm.answer_max_tokens, None),
        config.llm.base_url.clone(),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to create chat client: {}", e);
            std::process::exit(1);
        }
    };

    if config.embedding.dimensions != config.index.dimensions {
        tracing::warn!(
            embedding = config.embedding.dimensions,
            index = config.index.dimensions,
            "Embedding and index dimensions differ; indexing will fail"
        );
    }

    // Stores
    let history: Arc<dyn HistoryStore> = Arc::new(PgHistoryStore::new(pool.clone()));
    let documents: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
    let prompts: Arc<dyn PromptStore> = match config.prompt.backend {
        PromptBackend::Postgres => Arc::new(PgPromptStore::new(pool.clone())),
        PromptBackend::File => {
            let path = config.prompt.expanded_file_path();
            tracing::info!(path = %path, "Using file prompt store");
            Arc::new(FilePromptStore::new(path))
        }
    };
    let index: Arc<dyn VectorIndex> = Arc::new(PgVectorIndex::new(
        pool.clone(),
        config.index.dimensions as usize,
    ));

    // Ingestion
    let splitter = match RecursiveSplitter::new(config.ingest.chunk_size, config.ingest.chunk_overlap)
    {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Invalid ingest config: {}", e);
            std::process::exit(1);
        }
    };
    let uploader = Arc::new(Uploader::new(documents.clone(), config.ingest.max_file_size_bytes));
    let indexer = Arc::new(Indexer::new(
        documents.clone(),
        index.clone(),
        embedder.clone(),
        splitter,
        chrono::Duration::seconds(config.ingest.claim_lease_seconds),
    ));

    // Chat
    let mut builder = ChainBuilder::new(condense_llm, answer_llm)
        .with_max_context_tokens(config.index.max_context_tokens);
    match config.prompt.load_default_instruction() {
        Ok(Some(text)) => builder = builder.with_default_instruction(text),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Default instruction file unreadable, using built-in"),
    }
    let knowledge = KnowledgeBase::new(
        index.clone(),
        embedder.clone(),
        config.index.name.clone(),
        config.index.top_k,
    );
    let sessions = Arc::new(SessionManager::new(
        history.clone(),
        prompts.clone(),
        builder,
        knowledge,
        &config.session,
    ));

    // Shutdown fan-out
    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tokio::spawn(parley_server::subsystems::autoindex::run_auto_index_worker(
        indexer.clone(),
        config.index.name.clone(),
        config.ingest.default_batch_size,
        config.index.auto_index_interval_minutes,
        tx.subscribe(),
    ));

    tokio::spawn(parley_server::subsystems::sweeper::run_session_sweeper(
        sessions.clone(),
        config.session.sweep_interval_minutes,
        tx.subscribe(),
    ));

    if !config.http.enabled {
        tracing::warn!("HTTP API disabled; running background workers only");
        let mut shutdown = tx.subscribe();
        let _ = shutdown.recv().await;
        return Ok(());
    }

    let state = Arc::new(HttpState {
        pool: Some(pool),
        sessions,
        uploader,
        indexer,
        documents,
        history,
        prompts,
        index_name: config.index.name.clone(),
        default_batch_size: config.ingest.default_batch_size,
    });

    parley_server::http::start_http_server(state, &config.http, tx.subscribe()).await?;

    Ok(())
}
