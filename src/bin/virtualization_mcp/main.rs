//! CLI entry point: `serve` runs the MCP stdio server, `check` verifies the
//! environment (VBoxManage reachable, config valid) without serving, and
//! `version` prints build info. Subcommand shape and the signal-driven
//! graceful shutdown both follow the teacher's daemon entry point.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use virtualization_mcp::adapter::{Adapter, VBoxManageAdapter};
use virtualization_mcp::config::Config;
use virtualization_mcp::context::AppContext;
use virtualization_mcp::mcp::serve_stdio;

#[derive(Parser)]
#[command(name = "virtualization-mcp", version, about = "MCP server over VBoxManage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the MCP server over stdio.
    Serve {
        #[arg(long, env = "VIRTUALIZATION_MCP_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Verify VBoxManage is reachable and the config is valid, then exit.
    Check {
        #[arg(long, env = "VIRTUALIZATION_MCP_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("virtualization-mcp: {e}");
            std::process::ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<std::process::ExitCode> {
    match cli.command {
        Command::Version => {
            println!("virtualization-mcp {}", env!("CARGO_PKG_VERSION"));
            Ok(std::process::ExitCode::SUCCESS)
        }
        Command::Check { config } => {
            let cfg = Config::load(config.as_deref())?;
            let _log_guard = init_tracing(&cfg.log_level, cfg.log_dir.as_deref());
            let path = VBoxManageAdapter::resolve_path(cfg.vboxmanage_path.as_deref())?;
            let adapter = VBoxManageAdapter::new(path, cfg.max_parallel_vboxmanage);
            match adapter.vbox_version().await {
                Ok(version) => {
                    println!("VBoxManage OK: {version}");
                    Ok(std::process::ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("VBoxManage check failed: {e}");
                    Ok(std::process::ExitCode::from(2))
                }
            }
        }
        Command::Serve { config } => {
            let cfg = Config::load(config.as_deref())?;
            let _log_guard = init_tracing(&cfg.log_level, cfg.log_dir.as_deref());
            info!(max_parallel_vboxmanage = cfg.max_parallel_vboxmanage, "starting virtualization-mcp");

            let path = VBoxManageAdapter::resolve_path(cfg.vboxmanage_path.as_deref())?;
            let adapter: Arc<dyn Adapter> = Arc::new(VBoxManageAdapter::new(path, cfg.max_parallel_vboxmanage));
            let shutdown_timeout = Duration::from_secs(cfg.shutdown_timeout_seconds);
            let ctx = AppContext::new(cfg, adapter);
            let sweepers = ctx.spawn_sweepers();

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let term_flag = Arc::new(AtomicBool::new(false));
            #[cfg(unix)]
            {
                signal_hook::flag::register(signal_hook::consts::SIGTERM, term_flag.clone())
                    .map_err(|e| anyhow::anyhow!("failed to register SIGTERM handler: {e}"))?;
                signal_hook::flag::register(signal_hook::consts::SIGINT, term_flag.clone())
                    .map_err(|e| anyhow::anyhow!("failed to register SIGINT handler: {e}"))?;
            }
            let watcher_flag = term_flag.clone();
            let watcher_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                loop {
                    if watcher_flag.load(Ordering::SeqCst) {
                        info!("received shutdown signal");
                        let _ = watcher_tx.send(true);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            });

            let mut serve_task = tokio::spawn(serve_stdio(ctx.clone(), shutdown_rx));
            let mut shutdown_signalled = shutdown_tx.subscribe();

            let outcome = tokio::select! {
                res = &mut serve_task => res.map_err(|e| e.to_string()).and_then(|r| r.map_err(|e| e.to_string())),
                _ = shutdown_signalled.changed() => {
                    match tokio::time::timeout(shutdown_timeout, &mut serve_task).await {
                        Ok(res) => res.map_err(|e| e.to_string()).and_then(|r| r.map_err(|e| e.to_string())),
                        Err(_) => {
                            serve_task.abort();
                            Err("shutdown grace period exceeded, aborted stdio loop".to_string())
                        }
                    }
                }
            };

            for handle in sweepers {
                handle.abort();
            }

            match outcome {
                Ok(()) => Ok(std::process::ExitCode::SUCCESS),
                Err(msg) => {
                    error!(error = %msg, "mcp server did not shut down cleanly");
                    Ok(std::process::ExitCode::from(1))
                }
            }
        }
    }
}

/// Stdout carries the JSON-RPC stream; logs must never land there. Absent a
/// `log_dir`, logging goes to stderr. With one, it rotates daily the same
/// way the teacher's daemon logs to disk. The returned guard must be held
/// for the process lifetime or the non-blocking writer drops buffered lines.
fn init_tracing(log_level: &str, log_dir: Option<&str>) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, guard) = match log_dir {
        Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "virtualization-mcp.log")),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(writer)
        .init();
    guard
}
