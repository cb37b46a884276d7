//! vdp-agentd - VDP uplink agent daemon
//!
//! Entry point: loads the configuration, installs logging and runs the
//! manager until SIGINT.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vdp_agent_common::ShellExecutor;
use vdp_agentd::config::DEFAULT_CONFIG_PATH;
use vdp_agentd::{AgentConfig, LoggingOrchestrator, ScriptUplinkDetector, VdpMgr};

/// VDP/EVB uplink agent
#[derive(Parser, Debug)]
#[command(name = "vdp-agentd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, overrides the configuration file (RUST_LOG wins over both)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Uplink persisted by the orchestrator before restart
    #[arg(long)]
    uplink: Option<String>,

    /// Protocol veth persisted by the orchestrator before restart
    #[arg(long)]
    veth: Option<String>,
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = AgentConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_logging(
        args.log_level.as_deref().unwrap_or(&config.log.level),
        config.log.json,
    )?;

    info!("--- Starting vdp-agentd ---");
    info!(
        br_int = %config.bridges.integration_bridge,
        br_ex = %config.bridges.external_bridge,
        static_uplink = config.uplink.static_uplink,
        "Configuration loaded"
    );

    let exec = Arc::new(ShellExecutor::new(config.agent.root_helper()));
    let detector = Arc::new(ScriptUplinkDetector::new(
        exec.clone(),
        &config.uplink.detect_command,
    ));
    let mgr = VdpMgr::new(config, exec, detector, Arc::new(LoggingOrchestrator))
        .context("creating VDP manager")?;

    mgr.notify_uplink_restart_state(args.uplink, args.veth);
    mgr.start();
    info!("vdp-agentd running");

    signal::ctrl_c().await.context("waiting for SIGINT")?;
    info!("Received SIGINT, shutting down");
    mgr.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "vdp-agentd exiting with error");
            eprintln!("vdp-agentd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
