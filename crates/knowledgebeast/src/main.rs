//! KnowledgeBeast - multi-tenant retrieval-augmented search service.
//!
//! This is the main entry point: CLI parsing, logging setup, and server
//! bootstrap. All behavior lives in the library crates.

#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use knowledgebeast_core::Config;

#[derive(Parser)]
#[command(name = "knowledgebeast")]
#[command(
    version,
    about = "KnowledgeBeast server (hybrid retrieval over isolated projects)",
    after_help = "Configuration comes from the environment; see `knowledgebeast config`\nfor the resolved values."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging (overrides LOG_LEVEL with `debug`).
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server (default).
    Serve {
        /// Host to bind to.
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the resolved configuration as JSON and exit.
    Config,

    /// Run the dependency health probes once and exit non-zero when
    /// unhealthy.
    Health,
}

fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { &config.log_level };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    init_tracing(&config, cli.verbose);

    match cli.command {
        None | Some(Commands::Serve { host: None, port: None }) => serve(config),
        Some(Commands::Serve { host, port }) => {
            if let Some(host) = host {
                config.http_host = host;
            }
            if let Some(port) = port {
                config.http_port = port;
            }
            serve(config)
        }
        Some(Commands::Config) => {
            print_config(&config);
            std::process::ExitCode::SUCCESS
        }
        Some(Commands::Health) => health(config),
    }
}

fn serve(config: Config) -> std::process::ExitCode {
    match knowledgebeast_server::run_http(&config) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server exited with error");
            eprintln!("knowledgebeast: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn print_config(config: &Config) {
    // The admin token is a secret; show only whether one is set.
    let rendered = serde_json::json!({
        "data_dir": config.data_dir.display().to_string(),
        "database_url": config.database_url,
        "vector_backend_url": config.vector_backend_url,
        "embedding_model_id": config.embedding_model_id,
        "rerank_model_id": config.rerank_model_id,
        "cache_size_query": config.cache_size_query,
        "cache_size_embedding": config.cache_size_embedding,
        "semantic_cache_threshold": config.semantic_cache_threshold,
        "semantic_cache_ttl_seconds": config.semantic_cache_ttl_seconds,
        "hybrid_alpha": config.hybrid_alpha,
        "chunk_size_tokens": config.chunk_size_tokens,
        "chunk_overlap_tokens": config.chunk_overlap_tokens,
        "breaker_failure_threshold": config.breaker_failure_threshold,
        "breaker_window_seconds": config.breaker_window_seconds,
        "breaker_cooldown_seconds": config.breaker_cooldown_seconds,
        "retry_max_attempts": config.retry_max_attempts,
        "per_project_max_inflight": config.per_project_max_inflight,
        "per_project_rate_limit": config.per_project_rate_limit,
        "http_host": config.http_host,
        "http_port": config.http_port,
        "admin_token_set": config.admin_token.is_some(),
        "log_level": config.log_level,
    });
    println!("{}", serde_json::to_string_pretty(&rendered).unwrap_or_default());
}

fn health(config: Config) -> std::process::ExitCode {
    use asupersync::Cx;
    use asupersync::runtime::RuntimeBuilder;
    use knowledgebeast_core::HealthStatus;
    use knowledgebeast_service::KnowledgeBase;

    let kb = match KnowledgeBase::with_default_backend(config) {
        Ok(kb) => kb,
        Err(e) => {
            eprintln!("knowledgebeast: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let rt = match RuntimeBuilder::current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("knowledgebeast: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let cx = Cx::for_request_with_budget(asupersync::Budget::INFINITE);
    let report = rt.block_on(async { kb.health(&cx).await });

    println!(
        "{}",
        serde_json::to_string_pretty(&report).unwrap_or_default()
    );
    if report.status == HealthStatus::Unhealthy {
        std::process::ExitCode::FAILURE
    } else {
        std::process::ExitCode::SUCCESS
    }
}
