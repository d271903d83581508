//! Albor Space 5G GNodeB Main Application
//!
//! Runs the slot scheduler of every configured cell against a loopback PHY,
//! driven by a slot-boundary timer, and reports per-cell metrics as JSON.

mod config;
mod loopback;
mod traffic;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, error, warn};
use tracing_subscriber::{EnvFilter, fmt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use common::SlotPoint;
use layers::dispatch::{LoggingErrorNotifier, SlotDispatcher, TokioExecutor};
use layers::mac::CellScheduler;
use layers::metrics::CellMetricsSnapshot;
use layers::phy::{SoftbufferPool, SoftbufferPoolStats};

use crate::config::GnbConfig;
use crate::loopback::LoopbackPhy;
use crate::traffic::TrafficGenerator;

/// Albor Space 5G GNodeB
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of cells, replicating the first configured cell
    #[arg(long)]
    cells: Option<usize>,

    /// Number of test UEs attached per cell
    #[arg(long)]
    test_ues: Option<usize>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration_secs: Option<u64>,
}

/// One cell with its loopback PHY and traffic source
struct CellInstance {
    dispatcher: SlotDispatcher,
    phy: Arc<LoopbackPhy>,
    traffic: TrafficGenerator,
}

/// Metrics report entry of one cell
#[derive(Serialize)]
struct CellReport {
    #[serde(flatten)]
    metrics: CellMetricsSnapshot,
    softbuffers: SoftbufferPoolStats,
    nof_ues: usize,
    pending_feedback: usize,
}

fn metrics_report(cells: &[(SlotDispatcher, Arc<LoopbackPhy>)]) -> Result<String> {
    let report: Vec<CellReport> = cells
        .iter()
        .map(|(dispatcher, phy)| CellReport {
            metrics: dispatcher.metrics(),
            softbuffers: dispatcher.softbuffers().stats(),
            nof_ues: dispatcher.nof_ues(),
            pending_feedback: phy.nof_pending(),
        })
        .collect();
    serde_json::to_string(&report).context("serializing metrics")
}

fn load_config(args: &Args) -> Result<GnbConfig> {
    let mut config = match &args.config {
        Some(path) => GnbConfig::from_file(path)?,
        None => GnbConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
    if let Some(n) = args.cells {
        config = config.with_cells(n);
    }
    if let Some(n) = args.test_ues {
        config.test_ues.count = n;
    }
    Ok(config)
}

fn build_cell(config: &GnbConfig, index: usize) -> Result<CellInstance> {
    let cell_cfg = config.cells[index].to_scheduler_config()?;
    let cell_id = cell_cfg.cell_id;
    let softbuffers = SoftbufferPool::new(config.softbuffer.to_pool_config()?)?;
    let phy = Arc::new(LoopbackPhy::new(cell_id, softbuffers.clone(), config.loopback.clone()));

    info!("Cell {} configuration:", cell_id);
    info!("  PRBs: {}, SCS: {:?}", cell_cfg.nof_prbs, cell_cfg.scs);
    info!("  k1: {}, k2: {}, look-ahead: {} slots", cell_cfg.k1, cell_cfg.k2, cell_cfg.max_lookahead_slots);
    info!("  Policy: {:?}", cell_cfg.policy);

    let scheduler = CellScheduler::new(cell_cfg, softbuffers)?;
    let executor = TokioExecutor::current()?.with_queue_limit(config.dispatcher.executor_queue_limit);
    let dispatcher = SlotDispatcher::new(
        scheduler,
        config.dispatcher.to_dispatcher_config()?,
        Arc::new(executor),
        phy.clone(),
        Arc::new(LoggingErrorNotifier),
    )?;

    let traffic = TrafficGenerator::new(
        config.test_ues.clone(),
        config.dispatcher.processing_delay_slots,
        index,
    );
    traffic.attach(&dispatcher);
    dispatcher.start()?;
    Ok(CellInstance { dispatcher, phy, traffic })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor Space 5G GNodeB");
    if let Some(path) = &args.config {
        info!("Configuration file: {}", path);
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return Err(e);
    }

    let mut cells = Vec::with_capacity(config.cells.len());
    for index in 0..config.cells.len() {
        cells.push(build_cell(&config, index)?);
    }
    let observed: Vec<(SlotDispatcher, Arc<LoopbackPhy>)> = cells
        .iter()
        .map(|cell| (cell.dispatcher.clone(), cell.phy.clone()))
        .collect();

    // All cells share the numerology, checked by validate()
    let scs = config.cells[0].scs()?;
    info!("GNodeB initialized with {} cells, slot duration {} us", cells.len(), scs.slot_duration_us());

    let running = Arc::new(RwLock::new(true));

    // Slot-boundary timer
    let slot_handle = {
        let running = running.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_micros(scs.slot_duration_us() as u64));
            let mut slot = SlotPoint::new(scs.numerology(), 0, 0);

            while *running.read().await {
                interval.tick().await;

                for cell in cells.iter_mut() {
                    for feedback in cell.phy.take_due(slot) {
                        feedback.deliver(&cell.dispatcher);
                    }
                    let served = cell.phy.take_served();
                    cell.traffic.on_slot(slot, &cell.dispatcher, &served);
                    cell.dispatcher.handle_slot_indication(slot);
                }
                slot += 1;
            }
        })
    };

    // Start metrics reporting
    let stats_handle = {
        let observed = observed.clone();
        let running = running.clone();
        let enabled = config.metrics.enabled;
        let period = Duration::from_secs(config.metrics.report_period_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            while enabled && *running.read().await {
                interval.tick().await;
                match metrics_report(&observed) {
                    Ok(json) => info!("Metrics: {}", json),
                    Err(e) => warn!("Metrics report failed: {:#}", e),
                }
            }
        })
    };

    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = deadline => {
            info!("Run duration elapsed");
        }
        _ = slot_handle => {
            warn!("Slot timer stopped unexpectedly");
        }
    }

    // Shutdown
    info!("Shutting down GNodeB");
    *running.write().await = false;

    // Wait for in-flight slot decisions
    for (dispatcher, _) in &observed {
        let dispatcher = dispatcher.clone();
        tokio::task::spawn_blocking(move || dispatcher.stop())
            .await
            .context("stopping slot dispatcher")?;
    }

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), stats_handle).await;

    match metrics_report(&observed) {
        Ok(json) => info!("Final metrics: {}", json),
        Err(e) => warn!("Metrics report failed: {:#}", e),
    }
    info!("GNodeB shutdown complete");
    Ok(())
}
