//! gcode server binary
//!
//! Serves the collaborative editor's execution relay, or runs a single
//! snippet from the command line through the same pipelines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gcode_core::config::ConfigLoader;
use gcode_core::{ExecutionRequest, GcodeConfig, Orchestrator, SessionId};
use gcode_server::{language_listing, shutdown_signal, GcodeServer};
use log::LevelFilter;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(author, version, about = "gcode server - compile and run code for the collaborative editor")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(long, short, help = "YAML configuration file (defaults plus environment overrides when omitted)")]
    config: Option<PathBuf>,

    #[clap(long, short, help = "Log level (overrides logging.level from the configuration)")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP/WebSocket server (default command)
    Serve {
        #[clap(long, help = "Bind address, overriding server.bind_addr")]
        bind_addr: Option<String>,
    },
    /// Compile and run one source file, printing the combined output
    Exec {
        #[clap(long, short = 'L')]
        language: String,

        file: PathBuf,

        #[clap(long, conflicts_with = "stdin_file", help = "Text passed to the program's stdin")]
        stdin: Option<String>,

        #[clap(long, help = "File whose contents are passed to the program's stdin")]
        stdin_file: Option<PathBuf>,
    },
    /// List configured languages and whether their toolchains are installed
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).await?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(log_level_filter).init();

    match cli.command {
        Some(Commands::Serve { bind_addr }) => run_server(config, bind_addr).await,
        Some(Commands::Exec {
            language,
            file,
            stdin,
            stdin_file,
        }) => {
            let stdin = match stdin_file {
                Some(path) => Some(
                    tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read stdin file {}", path.display()))?,
                ),
                None => stdin,
            };
            let failed = run_once(&config, &language, &file, stdin).await?;
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Commands::Languages) => list_languages(&config),
        None => run_server(config, None).await,
    }
}

async fn load_config(path: Option<&Path>) -> Result<GcodeConfig> {
    let config = match path {
        Some(path) => ConfigLoader::from_file(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigLoader::from_env().context("Failed to build default configuration")?,
    };
    Ok(config)
}

async fn run_server(mut config: GcodeConfig, bind_addr: Option<String>) -> Result<()> {
    if let Some(addr) = bind_addr {
        config.server.bind_addr = addr;
    }

    let server = GcodeServer::from_config(&config)?;
    log::info!("Configuration:");
    log::info!("  Bind address: {}", server.config().bind_addr);
    log::info!("  CORS enabled: {}", server.config().enable_cors);
    log::info!("  Max body size: {} bytes", server.config().max_body_size);
    log::info!(
        "  Workspace root: {}",
        config.execution.resolved_workspace_root().display()
    );
    log::info!(
        "  Timeouts: compile {}s, run {}s",
        config.execution.compile_timeout,
        config.execution.run_timeout
    );

    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Returns whether the execution failed.
async fn run_once(config: &GcodeConfig, language: &str, file: &Path, stdin: Option<String>) -> Result<bool> {
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read source file {}", file.display()))?;

    let orchestrator = Orchestrator::from_config(config)?;
    let mut request = ExecutionRequest::new(SessionId::new("cli"), language, source);
    request.stdin = stdin;

    let result = orchestrator.execute(&request).await;
    print!("{}", result.combined_output);
    if !result.combined_output.is_empty() && !result.combined_output.ends_with('\n') {
        println!();
    }
    log::debug!("Execution settled: {:?}", result.outcome);
    Ok(result.failed)
}

fn list_languages(config: &GcodeConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    println!("{:<12} {:<12} {:<6} {:<10} REQUIREMENTS", "LANGUAGE", "KIND", "EXT", "TOOLCHAIN");
    for info in language_listing(orchestrator.registry()) {
        println!(
            "{:<12} {:<12} {:<6} {:<10} {}",
            info.id,
            info.kind,
            info.extension,
            if info.available { "found" } else { "missing" },
            info.requirements.unwrap_or_default()
        );
    }
    Ok(())
}
