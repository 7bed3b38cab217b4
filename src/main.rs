use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use kiln::agent::AgentEvent;
use kiln::config::Settings;
use kiln::exec::{ExecStatus, ExecutionRequest};
use kiln::kernel::KernelPool;
use kiln::tools::builtin::{EchoTool, TimeTool};
use kiln::{OpenAiClient, Orchestrator, RunCodeTool, SessionManager, Supervisor, ToolRegistry, ToolRouter};

#[derive(Parser)]
#[command(name = "kiln", version, about = "Turn-based agent with pooled code execution kernels")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat over stdin.
    Chat,
    /// Run a piece of Python once and print the outcome.
    Exec {
        /// Code to run; read from stdin when omitted.
        code: Option<String>,
        /// Wall-clock limit in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Directory to write image artifacts into.
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Command::Chat => chat(settings).await,
        Command::Exec {
            code,
            timeout_secs,
            artifacts_dir,
        } => exec(settings, code, timeout_secs, artifacts_dir).await,
    }
}

async fn chat(settings: Settings) -> anyhow::Result<()> {
    let pool = Arc::new(KernelPool::new(settings.kernel.clone()));
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&pool), settings.exec.clone()));

    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(RunCodeTool::new(
            Arc::clone(&supervisor),
            settings.exec.clone(),
        )))
        .map_err(anyhow::Error::msg)?;
    registry
        .register(Arc::new(EchoTool))
        .map_err(anyhow::Error::msg)?;
    registry
        .register(Arc::new(TimeTool))
        .map_err(anyhow::Error::msg)?;

    let router = Arc::new(ToolRouter::new(Arc::new(registry)));
    let model = Arc::new(OpenAiClient::new(settings.model.clone()));
    let sessions = Arc::new(SessionManager::new(Arc::clone(&pool)));
    let sweeper = sessions.spawn_sweeper(settings.agent.session_idle, settings.agent.sweep_interval);

    let orchestrator = Orchestrator::new(
        Arc::clone(&sessions),
        router,
        model,
        settings.agent.clone(),
    );

    let session = sessions.create().await;
    let session_id = session.lock().await.id;
    println!("kiln chat (session {session_id}). Type 'exit' to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let (tx, rx) = mpsc::channel(32);
        let printer = tokio::spawn(async move {
            let mut events = ReceiverStream::new(rx);
            while let Some(event) = events.next().await {
                match event {
                    AgentEvent::Delta(text) => {
                        print!("{text}");
                        let _ = std::io::stdout().flush();
                    }
                    AgentEvent::ToolStarted { name, .. } => {
                        println!("\n[{name}]");
                    }
                    AgentEvent::ToolFinished { .. } => {}
                }
            }
        });

        match orchestrator.run_turn_with_events(session_id, &line, tx).await {
            Ok(_) => println!(),
            Err(e) => eprintln!("\nerror: {e}"),
        }
        printer.await?;
    }

    sweeper.cancel();
    sessions.close(session_id).await;
    Ok(())
}

async fn exec(
    settings: Settings,
    code: Option<String>,
    timeout_secs: Option<u64>,
    artifacts_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let code = match code {
        Some(code) => code,
        None => {
            let mut buf = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)?;
            buf
        }
    };

    let pool = Arc::new(KernelPool::new(settings.kernel.clone()));
    let supervisor = Supervisor::new(Arc::clone(&pool), settings.exec.clone());

    let session_id = uuid::Uuid::new_v4();
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(settings.exec.default_timeout);
    let request = ExecutionRequest::new(session_id, code, timeout);

    let result = supervisor.execute(&request).await?;
    pool.release(session_id).await;

    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    if let Some(error) = &result.error {
        eprintln!("{error}");
    }
    if result.truncated {
        eprintln!("[output truncated]");
    }

    if let Some(dir) = artifacts_dir {
        std::fs::create_dir_all(&dir)?;
        for artifact in &result.artifacts {
            let path = match artifact.kind {
                kiln::exec::ArtifactKind::Image => {
                    let bytes =
                        base64::engine::general_purpose::STANDARD.decode(&artifact.data)?;
                    let path = dir.join(format!("artifact_{}.png", artifact.index));
                    std::fs::write(&path, bytes)?;
                    path
                }
                kiln::exec::ArtifactKind::Table => {
                    let path = dir.join(format!("artifact_{}.json", artifact.index));
                    std::fs::write(&path, &artifact.data)?;
                    path
                }
                kiln::exec::ArtifactKind::Text => {
                    let path = dir.join(format!("artifact_{}.txt", artifact.index));
                    std::fs::write(&path, &artifact.data)?;
                    path
                }
            };
            eprintln!("wrote {}", path.display());
        }
    }

    if result.status != ExecStatus::Ok {
        anyhow::bail!("execution finished with status {:?}", result.status);
    }
    Ok(())
}
