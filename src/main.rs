mod agent;
mod config;
mod display;
mod error;
mod history;
mod llm;
mod query_engine;
mod retriever;
mod vector_db;

use agent::Agent;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use error::AssistantError;
use history::{ChatLog, ChatMessage, Role, Transcript};
use llm::LLM;
use query_engine::QueryEngine;
use retriever::Retriever;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "research-assistant", version, about = "Ask questions against a research knowledge base")]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the index storage directory
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a single question
    Ask {
        question: String,
        /// Route the question through the tool-using agent
        #[arg(long)]
        agent: bool,
    },
    /// Interactive chat session
    Chat {
        #[arg(long)]
        agent: bool,
    },
    /// Print logged chat turns
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

enum Answerer {
    Engine(QueryEngine),
    Agent(Agent),
}

impl Answerer {
    async fn answer(&mut self, query: &str) -> error::Result<String> {
        match self {
            Answerer::Engine(engine) => {
                let response = engine.query(query).await?;
                Ok(display::format_answer(&response.text, &response.source_nodes))
            }
            Answerer::Agent(agent) => {
                let outcome = agent.run(query).await?;
                Ok(display::format_answer(&outcome.answer, &outcome.sources))
            }
        }
    }

    fn reset(&mut self) {
        if let Answerer::Agent(agent) = self {
            agent.memory_mut().clear();
        }
    }
}

/// Chat state for one process: the transcript plus the optional database log.
struct Session {
    answerer: Answerer,
    transcript: Transcript,
    log: Option<ChatLog>,
}

impl Session {
    fn record(&mut self, role: Role, content: &str) {
        let message = self.transcript.push(ChatMessage::new(role, content));
        if let Some(log) = &self.log {
            // losing a log row should not end the conversation
            if let Err(e) = log.append(message) {
                warn!("failed to log chat message: {e}");
            }
        }
        debug!(messages = self.transcript.len(), "recorded {role} message");
    }

    async fn turn(&mut self, query: &str) -> error::Result<String> {
        self.record(Role::User, query);
        let answer = self.answerer.answer(query).await?;
        self.record(Role::Assistant, &answer);
        Ok(answer)
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_log(config: &Config) -> Result<Option<ChatLog>> {
    config
        .database
        .path
        .as_ref()
        .map(|path| {
            ChatLog::open(path).with_context(|| format!("opening chat log at {}", path.display()))
        })
        .transpose()
}

fn build_session(config: &Config, use_agent: bool) -> Result<Session> {
    let retriever = match Retriever::from_storage(&config.storage_dir, config.retrieval.top_k) {
        Ok(retriever) => retriever,
        Err(e) if e.is_index_load() => {
            tracing::error!("{e}");
            anyhow::bail!(display::index_load_message(&config.storage_dir));
        }
        Err(e) => return Err(e.into()),
    };

    let api_key = config.api_key()?;
    let model = Arc::new(LLM::new(config.llm.clone(), api_key)?);
    info!(model = model.model(), top_k = retriever.top_k(), agent = use_agent, "session ready");
    let engine = QueryEngine::new(retriever, model.clone());

    let answerer = if use_agent {
        Answerer::Agent(Agent::from_config(model, &config.agent, Arc::new(engine))?)
    } else {
        Answerer::Engine(engine)
    };

    Ok(Session {
        answerer,
        transcript: Transcript::default(),
        log: open_log(config)?,
    })
}

fn error_message(err: &AssistantError) -> String {
    if err.is_rate_limited() {
        display::rate_limit_message().to_string()
    } else {
        format!("Error: {err}")
    }
}

fn report(err: &AssistantError) {
    eprintln!("{}", error_message(err));
}

async fn run_chat(mut session: Session) -> Result<()> {
    println!("Research assistant ready. Ask a question, /history to review, /reset to forget, /quit to exit.");

    loop {
        let mut query = String::new();
        print!("> ");
        std::io::stdout().flush()?;

        if std::io::stdin().read_line(&mut query)? == 0 {
            break;
        }

        let query = query.trim();
        match query {
            "" => continue,
            "/quit" | "/exit" => break,
            "/history" => {
                if session.transcript.is_empty() {
                    println!("(no messages yet)");
                }
                for message in session.transcript.visible() {
                    println!("{}", display::format_message(message));
                }
                continue;
            }
            "/reset" => {
                session.answerer.reset();
                println!("Conversation memory cleared.");
                continue;
            }
            _ => {}
        }

        print!("\nThinking...");
        std::io::stdout().flush()?;
        match session.turn(query).await {
            Ok(answer) => println!("\r{answer}\n"),
            Err(e) => {
                print!("\r");
                report(&e);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(storage) = cli.storage {
        config.storage_dir = storage;
    }

    match cli.command {
        Command::Ask { question, agent } => {
            let mut session = build_session(&config, agent)?;
            match session.turn(&question).await {
                Ok(answer) => println!("{answer}"),
                Err(e) => {
                    report(&e);
                    std::process::exit(1);
                }
            }
        }
        Command::Chat { agent } => {
            let session = build_session(&config, agent)?;
            run_chat(session).await?;
        }
        Command::History { limit } => {
            let Some(log) = open_log(&config)? else {
                anyhow::bail!("no database.path configured; chat logging is disabled");
            };
            for message in log.recent(limit)? {
                println!("{}", display::format_message(&message));
            }
        }
    }

    Ok(())
}
