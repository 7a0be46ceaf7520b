//! Kestrel CLI - drives the language server client from the command line.
//!
//! Each subcommand builds an [`LspManager`], roots it at the workspace,
//! opens the target file and prints what the server reports.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kestrel_lsp::{LspConfig, LspEvent, LspManager, SessionState};

#[derive(Parser)]
#[command(name = "kestrel")]
#[command(version, about = "Language server client for diagnostics, completion and hover", long_about = None)]
struct Cli {
    /// Server configuration file (TOML). Defaults to the user config when it exists
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace root the servers are initialized against (default: current dir)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log filter such as `debug` or `kestrel_lsp=trace`; RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured languages, their extensions and commands
    Languages,
    /// Print diagnostics for a file as the server publishes them
    Check {
        file: PathBuf,
        /// How long to wait for diagnostics
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },
    /// Completion items at a one-based line and column
    Complete { file: PathBuf, line: u32, col: u32 },
    /// Hover information at a one-based line and column
    Hover { file: PathBuf, line: u32, col: u32 },
}

fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries results; logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(explicit: Option<&Path>) -> Result<LspConfig> {
    if let Some(path) = explicit {
        return LspConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }
    match LspConfig::default_path() {
        Some(path) if path.is_file() => {
            tracing::info!(path = %path.display(), "Using user LSP config");
            LspConfig::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))
        }
        _ => Ok(LspConfig::builtin()),
    }
}

fn resolve_root(root: Option<&Path>) -> Result<PathBuf> {
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    fs::canonicalize(&root)
        .with_context(|| format!("Workspace root {} is not accessible", root.display()))
}

/// A document to open: absolute path plus its current content.
struct Document {
    path: PathBuf,
    text: String,
}

impl Document {
    fn read(path: &Path) -> Result<Self> {
        let path = fs::canonicalize(path)
            .with_context(|| format!("Cannot open {}", path.display()))?;
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self { path, text })
    }
}

struct Workspace {
    manager: LspManager,
    events: broadcast::Receiver<LspEvent>,
    document: Document,
}

impl Workspace {
    /// Root a manager, subscribe, and open `file`.
    async fn open(config: &LspConfig, root: &Path, file: &Path) -> Result<Self> {
        let manager = LspManager::new(config);
        let document = Document::read(file)?;
        if !manager.is_language_supported(&document.path) {
            bail!(
                "No language server configured for {}",
                document.path.display()
            );
        }
        manager.set_workspace_root(root).await;
        let events = manager.subscribe();
        manager
            .open_document(&document.path, &document.text)
            .await
            .with_context(|| format!("Failed to open {}", document.path.display()))?;
        Ok(Self {
            manager,
            events,
            document,
        })
    }

    /// Wait for the session to finish its handshake.
    ///
    /// Requests issued before that would spend their short timeout waiting
    /// on server startup.
    async fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let ready = tokio::time::timeout(timeout, async {
            loop {
                match self.events.recv().await {
                    Ok(LspEvent::SessionState {
                        state: SessionState::Ready,
                        ..
                    }) => return Ok(()),
                    Ok(LspEvent::SessionState {
                        language,
                        state: SessionState::Degraded,
                        reason,
                    }) => {
                        bail!(
                            "Language server for '{language}' failed: {}",
                            reason.unwrap_or_else(|| "unknown reason".to_string())
                        );
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => bail!("Event stream closed"),
                }
            }
        })
        .await;
        match ready {
            Ok(result) => result,
            Err(_) => bail!("Language server did not start within {}ms", timeout.as_millis()),
        }
    }

    async fn close(self) {
        self.manager.close_document(&self.document.path);
        self.manager.dispose_all().await;
    }
}

fn run_languages(config: &LspConfig) {
    let manager = LspManager::new(config);
    let languages = manager.languages();
    if languages.is_empty() {
        println!("No language servers configured");
        return;
    }
    for descriptor in languages {
        let command = std::iter::once(descriptor.command())
            .chain(descriptor.args().iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<12} {:<24} {command}",
            descriptor.language_id(),
            descriptor.file_extensions().join(", ")
        );
    }
}

async fn run_check(config: &LspConfig, root: &Path, file: &Path, wait: Duration) -> Result<ExitCode> {
    let mut workspace = Workspace::open(config, root, file).await?;

    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = workspace.events.recv() => match event {
                Ok(LspEvent::Diagnostics { uri, path, items }) => {
                    let shown = path.unwrap_or_else(|| PathBuf::from(&uri));
                    if items.is_empty() {
                        println!("{}: no diagnostics", shown.display());
                    }
                    for diagnostic in &items {
                        println!("{}", diagnostic.display_with_path(&shown));
                    }
                }
                Ok(LspEvent::SessionState { language, state: SessionState::Degraded, reason }) => {
                    workspace.close().await;
                    bail!(
                        "Language server for '{language}' failed: {}",
                        reason.unwrap_or_else(|| "unknown reason".to_string())
                    );
                }
                Ok(LspEvent::SessionState { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {skipped} diagnostics events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let snapshot = workspace.manager.diagnostics_snapshot();
    if !snapshot.is_empty() {
        println!("{}", snapshot.status_string());
    }
    workspace.close().await;

    Ok(if snapshot.error_count() > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn run_complete(config: &LspConfig, root: &Path, file: &Path, line: u32, col: u32) -> Result<()> {
    let mut workspace = Workspace::open(config, root, file).await?;
    workspace.wait_ready(config.timeouts.initialize()).await?;

    let items = workspace
        .manager
        .completions(&workspace.document.path, line, col)
        .await;
    let path = workspace.document.path.clone();
    workspace.close().await;

    let items = items.with_context(|| format!("Completion failed at {}:{line}:{col}", path.display()))?;
    if items.is_empty() {
        println!("No completions");
    }
    for item in items {
        let kind = item.kind.map_or("", |kind| kind.label());
        match &item.detail {
            Some(detail) => println!("{:<32} {kind:<14} {detail}", item.label),
            None => println!("{:<32} {kind}", item.label),
        }
    }
    Ok(())
}

async fn run_hover(config: &LspConfig, root: &Path, file: &Path, line: u32, col: u32) -> Result<()> {
    let mut workspace = Workspace::open(config, root, file).await?;
    workspace.wait_ready(config.timeouts.initialize()).await?;

    let hover = workspace
        .manager
        .hover(&workspace.document.path, line, col)
        .await;
    let path = workspace.document.path.clone();
    workspace.close().await;

    match hover.with_context(|| format!("Hover failed at {}:{line}:{col}", path.display()))? {
        Some(info) => println!("{}", info.contents),
        None => println!("No hover information"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Languages => {
            run_languages(&config);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { file, wait_ms } => {
            let root = resolve_root(cli.root.as_deref())?;
            run_check(&config, &root, &file, Duration::from_millis(wait_ms)).await
        }
        Commands::Complete { file, line, col } => {
            let root = resolve_root(cli.root.as_deref())?;
            run_complete(&config, &root, &file, line, col).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Hover { file, line, col } => {
            let root = resolve_root(cli.root.as_deref())?;
            run_hover(&config, &root, &file, line, col).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
