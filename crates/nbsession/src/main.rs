use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use tabled::{settings::Style, Table, Tabled};

use notebook_session::http::JupyterClient;
use notebook_session::poller::SessionPoller;
use notebook_session::protocol::ContentEntry;
use notebook_session::settings::{save_settings, settings_path};
use notebook_session::{
    CellKind, CellUpdate, ClientSettings, DocumentError, DocumentStore, ExecutionCoordinator,
    ExecutionOutcome, LifecycleController, Output, Session, SessionEvent, SessionRegistry,
};

/// How often, and how many times, a freshly started kernel is probed before
/// giving up on it.
const READY_INTERVAL: Duration = Duration::from_millis(500);
const READY_ATTEMPTS: u32 = 60;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Jupyter REST API base URL (overrides settings and environment)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Server token (overrides settings and environment)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show server status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List running kernels
    Kernels {
        #[arg(long)]
        json: bool,
    },
    /// List notebooks in a server directory
    Notebooks {
        /// Directory relative to the server root
        #[arg(long, default_value = "")]
        dir: String,
        #[arg(long)]
        json: bool,
    },
    /// Start a kernel and wait for it to become ready
    Start {
        /// Language or kernelspec name (defaults to the configured kernel)
        #[arg(long, short)]
        language: Option<String>,
    },
    /// Shut down a kernel
    Stop { id: String },
    /// Restart a kernel
    Restart { id: String },
    /// Create an empty notebook
    New {
        #[arg(long, default_value = "")]
        dir: String,
    },
    /// Delete a notebook
    Delete { path: String },
    /// Execute every code cell of a notebook in order
    Run {
        /// Notebook path on the server
        path: String,
        /// Use an existing kernel instead of starting one
        #[arg(long)]
        kernel: Option<String>,
        /// Language for the started kernel
        #[arg(long, short)]
        language: Option<String>,
        /// Write outputs back to the server afterwards
        #[arg(long)]
        save: bool,
        /// Overwrite even if the file changed on the server meanwhile
        #[arg(long, requires = "save")]
        force: bool,
    },
    /// Execute a snippet in a scratch notebook
    Exec {
        code: String,
        #[arg(long)]
        kernel: Option<String>,
        #[arg(long, short)]
        language: Option<String>,
    },
    /// Print session changes until interrupted
    Watch,
    /// Show the resolved client settings
    Config {
        /// Persist the resolved settings, including command-line overrides
        #[arg(long)]
        save: bool,
    },
}

#[derive(Tabled)]
struct KernelTableRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "KERNEL")]
    name: String,
    #[tabled(rename = "LANGUAGE")]
    language: String,
    #[tabled(rename = "STATE")]
    state: String,
}

impl From<&Session> for KernelTableRow {
    fn from(session: &Session) -> Self {
        KernelTableRow {
            id: session.id.clone(),
            name: session.name.clone(),
            language: session.language.clone(),
            state: session.state.to_string(),
        }
    }
}

#[derive(Tabled)]
struct NotebookTableRow {
    #[tabled(rename = "PATH")]
    path: String,
    #[tabled(rename = "MODIFIED")]
    modified: String,
    #[tabled(rename = "WRITABLE")]
    writable: String,
}

impl From<&ContentEntry> for NotebookTableRow {
    fn from(entry: &ContentEntry) -> Self {
        NotebookTableRow {
            path: entry.path.clone(),
            modified: entry
                .last_modified
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            writable: if entry.writable { "yes" } else { "no" }.to_string(),
        }
    }
}

/// Everything a command needs, wired against one server.
struct Client {
    settings: ClientSettings,
    lifecycle: LifecycleController,
    coordinator: ExecutionCoordinator,
}

impl Client {
    fn connect(cli: &Cli) -> Result<Self> {
        let mut settings = ClientSettings::resolve();
        if let Some(url) = &cli.api_url {
            settings.api_url = url.clone();
        }
        if let Some(token) = &cli.token {
            settings.token = token.clone();
        }

        let server = Arc::new(
            JupyterClient::from_settings(&settings)
                .with_context(|| format!("Invalid API URL {}", settings.api_url))?,
        );
        debug!("Using API at {}", server.base_url());

        let registry = Arc::new(SessionRegistry::with_default_kernel(
            server.clone(),
            settings.default_kernel.clone(),
        ));
        let documents = DocumentStore::new(server);

        Ok(Self {
            lifecycle: LifecycleController::new(registry.clone(), documents.clone()),
            coordinator: ExecutionCoordinator::new(registry, documents),
            settings,
        })
    }

    fn registry(&self) -> &Arc<SessionRegistry> {
        self.lifecycle.registry()
    }

    /// Use `kernel` if given and known, otherwise start one and wait for it.
    /// The second value is true when the session was started here.
    async fn session_for(
        &self,
        kernel: Option<String>,
        language: Option<&str>,
    ) -> Result<(String, bool)> {
        if let Some(id) = kernel {
            self.registry().refresh().await?;
            if self.registry().get(&id).await.is_none() {
                bail!("No kernel with id {}", id);
            }
            return Ok((id, false));
        }

        let session = self.lifecycle.new_kernel(language).await?;
        eprintln!("Started {} kernel {}", session.name, session.id);
        self.registry()
            .await_ready(&session.id, READY_INTERVAL, READY_ATTEMPTS)
            .await?;
        Ok((session.id, true))
    }

    async fn release(&self, session_id: &str, started_here: bool) {
        if !started_here {
            return;
        }
        if let Err(e) = self.lifecycle.stop_kernel(session_id).await {
            eprintln!("Warning: failed to stop kernel {}: {}", session_id, e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let client = Client::connect(&cli)?;

    match cli.command {
        Commands::Status { json } => status(&client, json).await,
        Commands::Kernels { json } => list_kernels(&client, json).await,
        Commands::Notebooks { dir, json } => list_notebooks(&client, &dir, json).await,
        Commands::Start { language } => start_kernel(&client, language.as_deref()).await,
        Commands::Stop { id } => {
            client.lifecycle.stop_kernel(&id).await?;
            println!("Stopped {}", id);
            Ok(())
        }
        Commands::Restart { id } => {
            let session = client.lifecycle.restart_kernel(&id).await?;
            println!("Restarted {} ({})", session.id, session.state);
            Ok(())
        }
        Commands::New { dir } => {
            let notebook = client.lifecycle.new_notebook(&dir).await?;
            println!("{}", notebook.path.unwrap_or_default());
            Ok(())
        }
        Commands::Delete { path } => {
            client.lifecycle.delete_notebook(&path).await?;
            println!("Deleted {}", path);
            Ok(())
        }
        Commands::Run {
            path,
            kernel,
            language,
            save,
            force,
        } => run_notebook(&client, &path, kernel, language.as_deref(), save, force).await,
        Commands::Exec {
            code,
            kernel,
            language,
        } => exec_snippet(&client, &code, kernel, language.as_deref()).await,
        Commands::Watch => watch(&client).await,
        Commands::Config { save } => show_config(&client.settings, save),
    }
}

async fn status(client: &Client, json: bool) -> Result<()> {
    let status = client.registry().service().status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("Server:      {}", client.settings.api_url);
    println!("Kernels:     {}", status.kernels);
    println!("Connections: {}", status.connections);
    if let Some(started) = status.started {
        println!("Started:     {}", started.to_rfc3339());
    }
    if let Some(activity) = status.last_activity {
        println!("Activity:    {}", activity.to_rfc3339());
    }
    Ok(())
}

async fn list_kernels(client: &Client, json: bool) -> Result<()> {
    let sessions = client.registry().refresh().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No running kernels found.");
        return Ok(());
    }
    let rows: Vec<KernelTableRow> = sessions.iter().map(KernelTableRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

async fn list_notebooks(client: &Client, dir: &str, json: bool) -> Result<()> {
    let notebooks = client.lifecycle.browse(dir).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&notebooks)?);
        return Ok(());
    }
    if notebooks.is_empty() {
        println!("No notebooks found.");
        return Ok(());
    }
    let rows: Vec<NotebookTableRow> = notebooks.iter().map(NotebookTableRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

async fn start_kernel(client: &Client, language: Option<&str>) -> Result<()> {
    let session = client.lifecycle.new_kernel(language).await?;
    let ready = client
        .registry()
        .await_ready(&session.id, READY_INTERVAL, READY_ATTEMPTS)
        .await?;
    println!("{} {} {}", ready.id, ready.name, ready.state);
    Ok(())
}

#[derive(Default)]
struct RunSummary {
    completed: usize,
    failed: usize,
    skipped: usize,
}

async fn run_notebook(
    client: &Client,
    path: &str,
    kernel: Option<String>,
    language: Option<&str>,
    save: bool,
    force: bool,
) -> Result<()> {
    let notebook = client.lifecycle.open_notebook(path).await?;
    let cell_ids: Vec<String> = notebook
        .cells
        .iter()
        .filter(|cell| cell.is_code())
        .map(|cell| cell.id.clone())
        .collect();
    info!("Running {} code cells from {}", cell_ids.len(), path);

    let (session_id, started_here) = client.session_for(kernel, language).await?;
    let summary = run_cells(client, &cell_ids, &session_id).await;
    client.release(&session_id, started_here).await;

    eprintln!(
        "{} completed, {} failed, {} skipped",
        summary.completed, summary.failed, summary.skipped
    );

    if save {
        let documents = client.coordinator.documents();
        let saved = if force {
            documents.overwrite().await
        } else {
            documents.save().await
        };
        match saved {
            Ok(()) => eprintln!("Saved {}", path),
            Err(e @ DocumentError::SaveConflict { .. }) => {
                bail!("{} (rerun with --force to overwrite)", e)
            }
            Err(e) => return Err(e.into()),
        }
    }

    if summary.failed > 0 {
        bail!("{} cells failed", summary.failed);
    }
    Ok(())
}

/// Execute cells one after another, printing their outputs. Stops early if
/// the session dies.
async fn run_cells(client: &Client, cell_ids: &[String], session_id: &str) -> RunSummary {
    let mut summary = RunSummary::default();
    for (index, cell_id) in cell_ids.iter().enumerate() {
        match client.coordinator.execute(cell_id, Some(session_id)).await {
            Ok(ExecutionOutcome::Completed {
                execution_count,
                outputs,
                ..
            }) => {
                println!("[{}]", execution_count);
                print_outputs(&outputs);
                if outputs.iter().any(Output::is_failure) {
                    summary.failed += 1;
                } else {
                    summary.completed += 1;
                }
            }
            Ok(ExecutionOutcome::Failed { message }) => {
                eprintln!("Cell {} failed: {}", cell_id, message);
                summary.failed += 1;
            }
            Ok(ExecutionOutcome::SessionDied) => {
                eprintln!("Kernel {} died while running cell {}", session_id, cell_id);
                summary.failed += 1;
                summary.skipped += cell_ids.len() - index - 1;
                break;
            }
            Err(e) => {
                eprintln!("Cell {} not run: {}", cell_id, e);
                summary.skipped += 1;
            }
        }
    }
    summary
}

async fn exec_snippet(
    client: &Client,
    code: &str,
    kernel: Option<String>,
    language: Option<&str>,
) -> Result<()> {
    let documents = client.coordinator.documents();
    documents.open_scratch().await;
    let cell = documents.add_cell(CellKind::Code, None).await?;
    documents
        .update_cell(&cell.id, CellUpdate::source(code))
        .await?;

    let (session_id, started_here) = client.session_for(kernel, language).await?;
    let summary = run_cells(client, std::slice::from_ref(&cell.id), &session_id).await;
    client.release(&session_id, started_here).await;

    if summary.completed == 0 {
        bail!("Execution did not complete");
    }
    Ok(())
}

fn print_outputs(outputs: &[Output]) {
    for output in outputs {
        match output {
            Output::Stream { text, .. } => print!("{}", text),
            Output::Result { data, .. } | Output::Display { data, .. } => {
                match data.get("text/plain").and_then(|v| v.as_str()) {
                    Some(text) => println!("{}", text),
                    None => {
                        let types: Vec<&str> = data.keys().map(String::as_str).collect();
                        println!("<{}>", types.join(", "));
                    }
                }
            }
            Output::Failure { kind, message, .. } => eprintln!("{}: {}", kind, message),
        }
    }
}

async fn watch(client: &Client) -> Result<()> {
    let registry = client.registry().clone();
    let mut events = registry.subscribe();
    let poller = SessionPoller::spawn(registry, client.settings.poll_interval());
    eprintln!(
        "Watching {} every {:?} (Ctrl-C to stop)",
        client.settings.api_url,
        client.settings.poll_interval()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("Missed {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    poller.shutdown().await;
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Added(session) => {
            println!("+ {} {} ({})", session.id, session.name, session.state)
        }
        SessionEvent::StateChanged { id, state } => println!("~ {} {}", id, state),
        SessionEvent::Restarted { id } => println!("~ {} restarted", id),
        SessionEvent::Removed { id } => println!("- {}", id),
        SessionEvent::Died { id } => println!("! {} died", id),
    }
}

fn show_config(settings: &ClientSettings, save: bool) -> Result<()> {
    let path = settings_path();
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(settings)?);
    if save {
        save_settings(settings)?;
        eprintln!("Saved {}", path.display());
    }
    Ok(())
}
