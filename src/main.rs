use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use quorum_core::{ConfigError, OrchestratorConfig, ProviderRegistry, RunResult};
use quorum_embeddings::{EmbeddingService, HashEmbedder, HttpEmbedder};
use quorum_engine::{ChainError, ChainRuntime, SessionSource};
use quorum_llm::{ChatProvider, Connector, HttpChatProvider, MockChatProvider};
use quorum_server::{AppState, ServerConfig};
use quorum_store::{migrate, ConversationRepo, Database, SearchFilter, SessionRepo};
use quorum_telemetry::ConversationLogger;

const EXIT_INVALID_ARGS: u8 = 2;
const EXIT_CONFIG_ERROR: u8 = 3;
const EXIT_PROVIDERS_FAILED: u8 = 4;
const EXIT_STORE_ERROR: u8 = 5;

#[derive(Parser)]
#[command(name = "quorum", about = "Multi-agent LLM orchestration engine")]
struct Args {
    /// Path to the agents configuration file.
    #[arg(long, default_value = "config/agents.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server.
    Serve {
        #[arg(long, default_value_t = 8420)]
        port: u16,
    },
    /// Run a single agent against a prompt.
    Ask {
        agent: String,
        prompt: String,
        /// Override the agent's model (provider/model); disables fallback.
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Run a full chain: builder, critics, refinement, closer.
    Chain {
        prompt: String,
        /// Custom stage list (agent names or "critics").
        stages: Vec<String>,
    },
    /// Show recent conversation log records.
    Logs {
        #[arg(default_value_t = 20)]
        limit: usize,
    },
    /// Show the most recent conversation.
    Last,
    /// Show every record of the most recent chain.
    LastChain,
    /// Conversation memory operations.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Substring search over stored conversations.
    Search {
        query: String,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Most recent stored conversations.
    Recent {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Totals and per-agent/per-model breakdowns.
    Stats,
    /// Delete one conversation by id (idempotent).
    Delete { id: i64 },
    /// Prune sessions idle longer than the given number of days.
    Cleanup {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Export all stored conversations as JSON.
    Export {
        #[arg(long, default_value = "conversations-export.json")]
        out: PathBuf,
    },
}

struct Services {
    runtime: Arc<ChainRuntime>,
    registry: Arc<ProviderRegistry>,
    db: Database,
    logger: Arc<ConversationLogger>,
}

fn load_config(path: &PathBuf) -> Result<OrchestratorConfig, ConfigError> {
    if path.exists() {
        OrchestratorConfig::from_yaml_file(path)
    } else {
        tracing::warn!(path = %path.display(), "config file not found; using built-in defaults");
        Ok(OrchestratorConfig::default())
    }
}

fn build_services(config: OrchestratorConfig) -> Result<Services, ChainError> {
    let mock = quorum_llm::mock_mode_enabled();

    let registry = Arc::new(if mock {
        ProviderRegistry::with_states(&[
            ("openai", Some("mock"), false),
            ("anthropic", Some("mock"), false),
            ("google", Some("mock"), false),
            ("openrouter", Some("mock"), false),
        ])
    } else {
        ProviderRegistry::from_env()
    });

    let provider: Arc<dyn ChatProvider> = if mock {
        tracing::info!("LLM_MOCK enabled; using deterministic canned responses");
        Arc::new(MockChatProvider::new())
    } else {
        Arc::new(HttpChatProvider::new(registry.clone()))
    };

    let embedder: Arc<dyn EmbeddingService> = match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !mock && !key.is_empty() => Arc::new(HttpEmbedder::new(
            "https://api.openai.com/v1/embeddings",
            key,
            "text-embedding-3-small",
            1536,
        )),
        _ => Arc::new(HashEmbedder::default()),
    };

    migrate::backup_before_migration(&config.paths.db_path)?;
    let db = Database::open(&config.paths.db_path)?;
    migrate::migrate(&db)?;

    let logger = Arc::new(ConversationLogger::new(&config.paths.conversation_log_dir));
    let connector = Arc::new(Connector::new(provider, registry.clone(), config.retry.clone()));
    let runtime = Arc::new(ChainRuntime::new(
        Arc::new(config),
        connector,
        db.clone(),
        embedder,
        logger.clone(),
    ));

    Ok(Services {
        runtime,
        registry,
        db,
        logger,
    })
}

fn exit_code_for(err: &ChainError) -> u8 {
    match err {
        ChainError::InvalidSessionId(_) => EXIT_INVALID_ARGS,
        ChainError::Config(_) => EXIT_CONFIG_ERROR,
        ChainError::Store(_) => EXIT_STORE_ERROR,
        ChainError::StageFailed { .. } | ChainError::AllCriticsFailed => EXIT_PROVIDERS_FAILED,
        ChainError::Cancelled => 1,
    }
}

fn print_result(result: &RunResult, stage_num: usize, total: usize) {
    println!("{}", "=".repeat(72));
    println!("STAGE {stage_num}/{total}: {}", result.agent.to_uppercase());
    println!("{}", "=".repeat(72));
    println!("model:    {}", result.model);
    if result.fallback_used {
        println!(
            "fallback: {} -> {} ({})",
            result.original_model.as_deref().unwrap_or("?"),
            result.model,
            result.fallback_reason.as_deref().unwrap_or("unknown"),
        );
    }
    if result.injected_context_tokens > 0 {
        println!(
            "memory:   {} tokens (session {}, knowledge {})",
            result.injected_context_tokens,
            result.session_context_tokens,
            result.knowledge_context_tokens,
        );
    }
    println!(
        "tokens:   {} (prompt {}, completion {})",
        result.total_tokens, result.prompt_tokens, result.completion_tokens
    );
    println!("duration: {:.0}ms", result.duration_ms);
    println!("cost:     ${:.6}", result.estimated_cost_usd);
    if let Some(log_file) = &result.log_file {
        println!("log:      {log_file}");
    }
    println!();
    println!("{}", result.response);
    println!();
}

async fn run_command(args: Args) -> Result<(), u8> {
    let config = load_config(&args.config).map_err(|e| {
        eprintln!("error: {e}");
        EXIT_CONFIG_ERROR
    })?;

    let services = build_services(config).map_err(|e| {
        eprintln!("error: {e}");
        exit_code_for(&e)
    })?;

    match args.command {
        Command::Serve { port } => {
            let state = AppState::new(
                services.runtime,
                services.registry,
                services.db,
                services.logger,
            );
            let handle = quorum_server::start(ServerConfig { port }, state)
                .await
                .map_err(|e| {
                    eprintln!("error: failed to bind: {e}");
                    1u8
                })?;

            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            handle.shutdown();
            handle.drain().await;
            Ok(())
        }

        Command::Ask {
            agent,
            prompt,
            model,
            session,
        } => {
            let result = services
                .runtime
                .run(
                    &agent,
                    &prompt,
                    model.as_deref(),
                    session.as_deref(),
                    SessionSource::Cli,
                )
                .await
                .map_err(|e| {
                    eprintln!("error: {e}");
                    exit_code_for(&e)
                })?;
            print_result(&result, 1, 1);
            Ok(())
        }

        Command::Chain { prompt, stages } => {
            let stages = if stages.is_empty() { None } else { Some(stages) };
            let results = services
                .runtime
                .chain(&prompt, None, SessionSource::Cli, stages)
                .await
                .map_err(|e| {
                    eprintln!("error: {e}");
                    exit_code_for(&e)
                })?;

            let total = results.len();
            for (i, result) in results.iter().enumerate() {
                print_result(result, i + 1, total);
            }

            let total_tokens: u32 = results.iter().map(|r| r.total_tokens).sum();
            let total_cost: f64 = results.iter().map(|r| r.estimated_cost_usd).sum();
            println!("{}", "=".repeat(72));
            println!(
                "chain complete: {total} stages, {total_tokens} tokens, ${total_cost:.6}"
            );
            Ok(())
        }

        Command::Logs { limit } => {
            for log in services.logger.read_logs(limit) {
                println!("{}", serde_json::to_string_pretty(&log).unwrap_or_default());
            }
            Ok(())
        }

        Command::Last => {
            match services.logger.read_logs(1).into_iter().next() {
                Some(log) => println!("{}", serde_json::to_string_pretty(&log).unwrap_or_default()),
                None => println!("no conversations logged yet"),
            }
            Ok(())
        }

        Command::LastChain => {
            let logs = services.logger.read_logs(100);
            let last_session = logs
                .first()
                .and_then(|l| l.get("session_id"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            match last_session {
                Some(session) => {
                    let mut chain_logs: Vec<_> = logs
                        .into_iter()
                        .filter(|l| l.get("session_id").and_then(|v| v.as_str()) == Some(&session))
                        .collect();
                    chain_logs.reverse(); // oldest first
                    for log in chain_logs {
                        println!("{}", serde_json::to_string_pretty(&log).unwrap_or_default());
                    }
                }
                None => println!("no chain logged yet"),
            }
            Ok(())
        }

        Command::Memory { command } => run_memory_command(&services, command).map_err(|e| {
            eprintln!("error: {e}");
            EXIT_STORE_ERROR
        }),
    }
}

fn run_memory_command(
    services: &Services,
    command: MemoryCommand,
) -> Result<(), quorum_store::StoreError> {
    let conversations = ConversationRepo::new(services.db.clone());
    match command {
        MemoryCommand::Search {
            query,
            agent,
            limit,
        } => {
            let rows = conversations.search(&SearchFilter {
                query: Some(query),
                agent,
                limit,
                ..Default::default()
            })?;
            for row in rows {
                println!(
                    "#{} [{}] {} -> {}",
                    row.id,
                    row.timestamp,
                    row.agent,
                    snippet(&row.prompt, 80)
                );
            }
            Ok(())
        }
        MemoryCommand::Recent { agent, limit } => {
            for row in conversations.recent(limit, agent.as_deref())? {
                println!(
                    "#{} [{}] {} -> {}",
                    row.id,
                    row.timestamp,
                    row.agent,
                    snippet(&row.prompt, 80)
                );
            }
            Ok(())
        }
        MemoryCommand::Stats => {
            let stats = conversations.stats()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).unwrap_or_default()
            );
            Ok(())
        }
        MemoryCommand::Delete { id } => {
            conversations.delete(id)?;
            println!("deleted #{id}");
            Ok(())
        }
        MemoryCommand::Cleanup { days } => {
            let sessions = quorum_engine::SessionManager::new(SessionRepo::new(services.db.clone()));
            let pruned = sessions.prune_now(days)?;
            println!("pruned {pruned} inactive sessions");
            Ok(())
        }
        MemoryCommand::Export { out } => {
            let rows = conversations.search(&SearchFilter {
                limit: u32::MAX,
                ..Default::default()
            })?;
            let body = serde_json::to_string_pretty(&rows)?;
            std::fs::write(&out, body)?;
            println!("exported {} conversations to {}", rows.len(), out.display());
            Ok(())
        }
    }
}

fn snippet(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    quorum_telemetry::init_logging(&args.log_level);

    match run_command(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_ask() {
        let args = Args::parse_from(["quorum", "ask", "builder", "do the thing"]);
        match args.command {
            Command::Ask { agent, prompt, model, session } => {
                assert_eq!(agent, "builder");
                assert_eq!(prompt, "do the thing");
                assert!(model.is_none());
                assert!(session.is_none());
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn cli_parses_chain_with_stages() {
        let args = Args::parse_from(["quorum", "chain", "a prompt", "builder", "critics"]);
        match args.command {
            Command::Chain { prompt, stages } => {
                assert_eq!(prompt, "a prompt");
                assert_eq!(stages, vec!["builder", "critics"]);
            }
            _ => panic!("expected chain"),
        }
    }

    #[test]
    fn cli_parses_memory_search() {
        let args = Args::parse_from(["quorum", "memory", "search", "jwt", "--limit", "5"]);
        match args.command {
            Command::Memory {
                command: MemoryCommand::Search { query, limit, .. },
            } => {
                assert_eq!(query, "jwt");
                assert_eq!(limit, 5);
            }
            _ => panic!("expected memory search"),
        }
    }

    #[test]
    fn cli_defaults() {
        let args = Args::parse_from(["quorum", "serve"]);
        assert_eq!(args.config, PathBuf::from("config/agents.yaml"));
        assert_eq!(args.log_level, "info");
        match args.command {
            Command::Serve { port } => assert_eq!(port, 8420),
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn exit_codes_map_error_taxonomy() {
        assert_eq!(
            exit_code_for(&ChainError::InvalidSessionId("x".into())),
            EXIT_INVALID_ARGS
        );
        assert_eq!(
            exit_code_for(&ChainError::Config(ConfigError::UnknownAgent("x".into()))),
            EXIT_CONFIG_ERROR
        );
        assert_eq!(
            exit_code_for(&ChainError::StageFailed {
                stage: "builder".into(),
                source: quorum_llm::LlmError::AllProvidersFailed { attempts: vec![] },
            }),
            EXIT_PROVIDERS_FAILED
        );
        assert_eq!(
            exit_code_for(&ChainError::Store(quorum_store::StoreError::NotFound("x".into()))),
            EXIT_STORE_ERROR
        );
    }

    #[test]
    fn snippet_clips_long_text() {
        assert_eq!(snippet("short", 10), "short");
        assert_eq!(snippet("a very long prompt text", 6), "a very...");
    }
}
