use std::path::Path;
use std::sync::Arc;

use ai_tasker::config::{EngineConfig, RuntimeConfig};
use ai_tasker::engine::{Engine, EscalationHandler, ResumeOutcome, TaskControl};
use ai_tasker::llm::{LlmConfig, LlmProvider, create_provider};
use ai_tasker::memory::{HttpMemory, MemoryBoundary, WorkspaceMemory};
use ai_tasker::store::{LibSqlBackend, TaskStore};
use ai_tasker::tasks::{EventEmitter, Task, TaskEvent};
use ai_tasker::tools::{ToolGateway, ToolRegistry};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ai-tasker", version, about = "Autonomous task-processing engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Process the task queue until interrupted (default)
    Run,
    /// Put a failed task back in the queue
    Requeue { id: Uuid },
    /// Return an in-progress task to the queue
    Release { id: Uuid },
    /// Reply to a task as a human; resumes it if it awaits a decision
    Reply { id: Uuid, text: String },
    /// Create a new task
    Create {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Print a task with its comments
    Show { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Requeue { id } => {
            let store = open_store(&RuntimeConfig::db_path_from_env()).await?;
            let (events, mut emitted) = operator_events()?;
            let control = TaskControl::new(Arc::clone(&store), events);
            if control.requeue(id).await? {
                eprintln!("Requeued {id}");
            } else {
                eprintln!("Task {id} changed concurrently, not requeued");
            }
            persist_emitted(store.as_ref(), &mut emitted).await
        }
        Command::Release { id } => {
            let store = open_store(&RuntimeConfig::db_path_from_env()).await?;
            let (events, mut emitted) = operator_events()?;
            let control = TaskControl::new(Arc::clone(&store), events);
            if control.release(id).await? {
                eprintln!("Released {id}");
            } else {
                eprintln!("Task {id} is not in progress");
            }
            persist_emitted(store.as_ref(), &mut emitted).await
        }
        Command::Reply { id, text } => {
            let store = open_store(&RuntimeConfig::db_path_from_env()).await?;
            let (events, mut emitted) = operator_events()?;
            let handler = EscalationHandler::new(Arc::clone(&store), events);
            match handler.on_human_comment(id, &text).await? {
                ResumeOutcome::Resumed => eprintln!("Task {id} resumed"),
                ResumeOutcome::NotAwaiting { status } => {
                    eprintln!("Comment added (task is {status})")
                }
            }
            persist_emitted(store.as_ref(), &mut emitted).await
        }
        Command::Create {
            title,
            description,
            tags,
        } => {
            let store = open_store(&RuntimeConfig::db_path_from_env()).await?;
            let mut task = Task::new(title);
            if let Some(desc) = description {
                task = task.with_description(desc);
            }
            for tag in tags {
                task = task.with_tag(tag);
            }
            store.create_task(&task).await?;
            println!("{}", task.id);
            Ok(())
        }
        Command::Show { id } => {
            let store = open_store(&RuntimeConfig::db_path_from_env()).await?;
            let task = store
                .get(id)
                .await?
                .with_context(|| format!("task {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
    }
}

/// Stderr logging, plus a daily-rotated file when `AI_TASKER_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("AI_TASKER_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ai-tasker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

async fn open_store(path: &Path) -> anyhow::Result<Arc<dyn TaskStore>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let backend = LibSqlBackend::new_local(path)
        .await
        .with_context(|| format!("opening database at {}", path.display()))?;
    Ok(Arc::new(backend))
}

/// Emitter for one-shot operator commands. Events are written to the store
/// by [`persist_emitted`] before the process exits.
fn operator_events() -> anyhow::Result<(EventEmitter, broadcast::Receiver<TaskEvent>)> {
    let events = EventEmitter::new(EngineConfig::from_env()?.event_source);
    let rx = events.subscribe();
    Ok((events, rx))
}

async fn persist_emitted(
    store: &dyn TaskStore,
    emitted: &mut broadcast::Receiver<TaskEvent>,
) -> anyhow::Result<()> {
    while let Ok(event) = emitted.try_recv() {
        store.save_event(&event).await?;
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let engine_config = EngineConfig::from_env()?;
    let runtime = RuntimeConfig::from_env()?;

    eprintln!("AI Tasker v{}", env!("CARGO_PKG_VERSION"));
    let llm = create_provider(&LlmConfig {
        api_key: runtime.api_key.clone(),
        model: runtime.model.clone(),
    })?;
    eprintln!("   Model: {}", llm.model_name());
    eprintln!("   Database: {}", runtime.db_path.display());

    let store = open_store(&runtime.db_path).await?;

    // ── Memory ───────────────────────────────────────────────────────────
    let memory: Arc<dyn MemoryBoundary> = match &runtime.memory_url {
        Some(url) => {
            eprintln!("   Memory: {url}");
            Arc::new(HttpMemory::new(url.as_str(), runtime.memory_group.as_str())?)
        }
        None => {
            let workspace = WorkspaceMemory::new(runtime.workspace.clone());
            workspace.ensure_dirs().await?;
            eprintln!("   Memory: {}", runtime.workspace.display());
            Arc::new(workspace)
        }
    };

    // ── Tools ────────────────────────────────────────────────────────────
    let registry = ToolRegistry::new();
    registry.register_memory_tools(Arc::clone(&memory));
    registry.register_task_tools(Arc::clone(&store));
    eprintln!("   Tools: {}", registry.list().await.join(", "));
    let tools: Arc<dyn ToolGateway> = Arc::new(registry);

    let engine = Engine::new(store, memory, llm, tools, engine_config);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    engine.run(shutdown).await?;
    Ok(())
}
