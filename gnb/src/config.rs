//! GNodeB Configuration
//!
//! Configuration file structures. Every field has a default so a missing file
//! or a partial one still yields a runnable single-cell setup.

use anyhow::{bail, Context};
use common::{nof_prbs, Bandwidth, CellId, SubcarrierSpacing};
use interfaces::message_types::SymbolRange;
use interfaces::PduCeilings;
use layers::dispatch::DispatcherConfig;
use layers::mac::{CellSchedulerConfig, PolicyKind};
use layers::phy::softbuffer::MAX_CODEBLOCK_SOFT_BITS;
use layers::phy::SoftbufferPoolConfig;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Main GNodeB configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GnbConfig {
    /// Cells served by this gNB
    #[serde(default = "default_cells")]
    pub cells: Vec<CellConfig>,
    /// Uplink softbuffer pool, one per cell
    #[serde(default)]
    pub softbuffer: SoftbufferConfig,
    /// Slot dispatch configuration
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    /// Synthetic UEs attached at startup
    #[serde(default)]
    pub test_ues: TestUeConfig,
    /// Loopback PHY behaviour
    #[serde(default)]
    pub loopback: LoopbackConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Metrics report configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GnbConfig {
    fn default() -> Self {
        Self {
            cells: default_cells(),
            softbuffer: SoftbufferConfig::default(),
            dispatcher: DispatcherSection::default(),
            test_ues: TestUeConfig::default(),
            loopback: LoopbackConfig::default(),
            log: LogConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_cells() -> Vec<CellConfig> {
    vec![CellConfig::default()]
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellConfig {
    /// Cell ID
    #[serde(default = "default_cell_id")]
    pub cell_id: u16,
    /// Channel bandwidth in MHz
    #[serde(default = "default_bandwidth_mhz")]
    pub bandwidth_mhz: u32,
    /// Explicit carrier size in PRBs, overrides the bandwidth lookup
    #[serde(default)]
    pub nof_prbs: Option<usize>,
    /// Subcarrier spacing in kHz
    #[serde(default = "default_scs_khz")]
    pub scs_khz: u32,
    /// Nominal RBG size configuration 1
    #[serde(default = "default_true")]
    pub rbg_config_1: bool,
    /// CCEs of the CORESET
    #[serde(default = "default_coreset_cces")]
    pub coreset_cces: usize,
    /// PDCCH candidates per aggregation level
    #[serde(default = "default_pdcch_candidates")]
    pub pdcch_candidates: usize,
    /// PDSCH to HARQ-ACK delay
    #[serde(default = "default_k")]
    pub k1: u32,
    /// PDCCH to PUSCH delay
    #[serde(default = "default_k")]
    pub k2: u32,
    #[serde(default = "default_nof_harqs")]
    pub nof_harqs: usize,
    /// Retransmissions before a transport block is dropped
    #[serde(default = "default_max_harq_retxs")]
    pub max_harq_retxs: u32,
    #[serde(default = "default_harq_feedback_timeout")]
    pub harq_feedback_timeout_slots: u32,
    /// Furthest slot ahead of the decision slot a grant may occupy
    #[serde(default = "default_max_lookahead")]
    pub max_lookahead_slots: u32,
    /// Occupancy ring size, derived from the look-ahead when absent
    #[serde(default)]
    pub ring_size: Option<u32>,
    /// CSI-RS period, `0` disables CSI-RS
    #[serde(default = "default_csi_rs_period")]
    pub csi_rs_period_slots: u32,
    #[serde(default = "default_paging_prbs")]
    pub paging_prbs: usize,
    /// Per-slot PDU ceilings
    #[serde(default)]
    pub ceilings: PduCeilings,
    /// Scheduling policy
    #[serde(default)]
    pub policy: PolicyKind,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            cell_id: default_cell_id(),
            bandwidth_mhz: default_bandwidth_mhz(),
            nof_prbs: None,
            scs_khz: default_scs_khz(),
            rbg_config_1: true,
            coreset_cces: default_coreset_cces(),
            pdcch_candidates: default_pdcch_candidates(),
            k1: default_k(),
            k2: default_k(),
            nof_harqs: default_nof_harqs(),
            max_harq_retxs: default_max_harq_retxs(),
            harq_feedback_timeout_slots: default_harq_feedback_timeout(),
            max_lookahead_slots: default_max_lookahead(),
            ring_size: None,
            csi_rs_period_slots: default_csi_rs_period(),
            paging_prbs: default_paging_prbs(),
            ceilings: PduCeilings::default(),
            policy: PolicyKind::default(),
        }
    }
}

fn default_cell_id() -> u16 {
    1
}

fn default_bandwidth_mhz() -> u32 {
    20
}

fn default_scs_khz() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn default_coreset_cces() -> usize {
    16
}

fn default_pdcch_candidates() -> usize {
    2
}

fn default_k() -> u32 {
    4
}

fn default_nof_harqs() -> usize {
    8
}

fn default_max_harq_retxs() -> u32 {
    4
}

fn default_harq_feedback_timeout() -> u32 {
    8
}

fn default_max_lookahead() -> u32 {
    8
}

fn default_csi_rs_period() -> u32 {
    20
}

fn default_paging_prbs() -> usize {
    8
}

impl CellConfig {
    pub fn scs(&self) -> anyhow::Result<SubcarrierSpacing> {
        SubcarrierSpacing::from_u32(self.scs_khz)
            .with_context(|| format!("cell {}: invalid subcarrier spacing {} kHz", self.cell_id, self.scs_khz))
    }

    /// Carrier size in PRBs, explicit or from the bandwidth table
    pub fn resolve_nof_prbs(&self) -> anyhow::Result<usize> {
        if let Some(n) = self.nof_prbs {
            return Ok(n);
        }
        let bandwidth = Bandwidth::from_mhz(self.bandwidth_mhz)
            .with_context(|| format!("cell {}: invalid bandwidth {} MHz", self.cell_id, self.bandwidth_mhz))?;
        let scs = self.scs()?;
        let n = nof_prbs(bandwidth, scs).with_context(|| {
            format!("cell {}: {} MHz not defined for {} kHz", self.cell_id, self.bandwidth_mhz, self.scs_khz)
        })?;
        Ok(n as usize)
    }

    /// Build and validate the scheduler configuration of this cell
    pub fn to_scheduler_config(&self) -> anyhow::Result<CellSchedulerConfig> {
        let cfg = CellSchedulerConfig {
            cell_id: CellId(self.cell_id),
            scs: self.scs()?,
            nof_prbs: self.resolve_nof_prbs()?,
            rbg_config_1: self.rbg_config_1,
            nof_cces: self.coreset_cces,
            nof_candidates: self.pdcch_candidates,
            pdsch_symbols: SymbolRange::new(2, 14),
            pusch_symbols: SymbolRange::new(0, 14),
            pucch_symbols: SymbolRange::new(0, 14),
            ceilings: self.ceilings,
            nof_harqs: self.nof_harqs,
            max_harq_retxs: self.max_harq_retxs,
            k1: self.k1,
            k2: self.k2,
            harq_feedback_timeout_slots: self.harq_feedback_timeout_slots,
            max_lookahead_slots: self.max_lookahead_slots,
            ring_size: self.ring_size,
            csi_rs_period_slots: (self.csi_rs_period_slots > 0).then_some(self.csi_rs_period_slots),
            paging_prbs: self.paging_prbs,
            policy: self.policy,
            ..CellSchedulerConfig::default()
        };
        cfg.validate().with_context(|| format!("cell {}", self.cell_id))?;
        Ok(cfg)
    }
}

/// Softbuffer pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SoftbufferConfig {
    pub max_softbuffers: usize,
    pub max_nof_codeblocks: usize,
    /// Soft bits per codeblock
    pub max_codeblock_size: usize,
    pub expire_timeout_slots: u32,
}

impl Default for SoftbufferConfig {
    fn default() -> Self {
        Self {
            max_softbuffers: 64,
            max_nof_codeblocks: 512,
            max_codeblock_size: MAX_CODEBLOCK_SOFT_BITS,
            expire_timeout_slots: 100,
        }
    }
}

impl SoftbufferConfig {
    pub fn to_pool_config(&self) -> anyhow::Result<SoftbufferPoolConfig> {
        let cfg = SoftbufferPoolConfig {
            max_softbuffers: self.max_softbuffers,
            max_nof_codeblocks: self.max_nof_codeblocks,
            max_codeblock_size: self.max_codeblock_size,
            expire_timeout_slots: self.expire_timeout_slots,
        };
        cfg.validate().context("softbuffer pool")?;
        Ok(cfg)
    }
}

/// Slot dispatch configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherSection {
    /// Slots between a slot indication and the slot it schedules
    pub processing_delay_slots: u32,
    /// Bound of the PRACH request queue
    pub prach_queue_size: usize,
    /// Slot tasks allowed to wait for a worker thread
    pub executor_queue_limit: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self { processing_delay_slots: 2, prach_queue_size: 16, executor_queue_limit: 4 }
    }
}

impl DispatcherSection {
    pub fn to_dispatcher_config(&self) -> anyhow::Result<DispatcherConfig> {
        let cfg = DispatcherConfig {
            processing_delay_slots: self.processing_delay_slots,
            prach_queue_size: self.prach_queue_size,
        };
        cfg.validate().context("dispatcher")?;
        Ok(cfg)
    }
}

/// Synthetic UEs and the traffic they offer
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TestUeConfig {
    /// UEs attached per cell
    pub count: usize,
    /// Probability of a DL burst per UE and slot
    pub dl_arrival_probability: f64,
    pub dl_burst_bytes: u32,
    /// Probability of a new BSR per UE and slot
    pub ul_arrival_probability: f64,
    pub ul_burst_bytes: u32,
    /// PRACH occasion period, `0` disables PRACH requests
    pub prach_period_slots: u32,
    /// Paging request period, `0` disables paging
    pub paging_period_slots: u32,
    /// Seed of the traffic generator
    pub seed: u64,
}

impl Default for TestUeConfig {
    fn default() -> Self {
        Self {
            count: 4,
            dl_arrival_probability: 0.2,
            dl_burst_bytes: 3_000,
            ul_arrival_probability: 0.1,
            ul_burst_bytes: 1_500,
            prach_period_slots: 40,
            paging_period_slots: 320,
            seed: 1,
        }
    }
}

/// Decode and feedback behaviour of the loopback PHY
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Probability a PUSCH transport block fails its CRC
    pub ul_bler: f64,
    /// Probability a PDSCH transport block is NACKed
    pub dl_bler: f64,
    /// Probability a HARQ-ACK is not received at all
    pub dtx_probability: f64,
    /// Upper bound of reported LDPC decoder iterations
    pub max_decoder_iterations: u32,
    pub seed: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self { ul_bler: 0.1, dl_bler: 0.1, dtx_probability: 0.01, max_decoder_iterations: 6, seed: 2 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level, `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics report configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Seconds between two JSON metrics reports
    pub report_period_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true, report_period_secs: 5 }
    }
}

impl GnbConfig {
    /// Load configuration from a YAML or TOML file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            Some("toml") => Self::from_toml_str(&contents),
            _ => bail!("unsupported configuration format: {}", path.display()),
        }
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(contents).context("parsing YAML configuration")
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).context("parsing TOML configuration")
    }

    /// Replace the cell list by `n` copies of the first cell with consecutive IDs
    pub fn with_cells(mut self, n: usize) -> Self {
        let template = self.cells.first().cloned().unwrap_or_default();
        self.cells = (0..n)
            .map(|i| CellConfig { cell_id: template.cell_id + i as u16, ..template.clone() })
            .collect();
        self
    }

    /// Reject configurations before any slot is processed
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cells.is_empty() {
            bail!("no cells configured");
        }
        let mut ids = HashSet::new();
        let mut scs = None;
        for cell in &self.cells {
            if !ids.insert(cell.cell_id) {
                bail!("duplicate cell ID {}", cell.cell_id);
            }
            let cfg = cell.to_scheduler_config()?;
            // All cells share one slot timer
            if scs.is_some_and(|s| s != cfg.scs) {
                bail!("cell {}: all cells must use the same subcarrier spacing", cell.cell_id);
            }
            scs = Some(cfg.scs);
        }
        self.softbuffer.to_pool_config()?;
        self.dispatcher.to_dispatcher_config()?;
        if self.dispatcher.executor_queue_limit == 0 {
            bail!("dispatcher: executor queue limit must be at least one task");
        }
        for p in [self.loopback.ul_bler, self.loopback.dl_bler, self.loopback.dtx_probability] {
            if !(0.0..=1.0).contains(&p) {
                bail!("loopback: probability {} outside [0, 1]", p);
            }
        }
        if !(0.0..=1.0).contains(&self.test_ues.dl_arrival_probability)
            || !(0.0..=1.0).contains(&self.test_ues.ul_arrival_probability)
        {
            bail!("test_ues: arrival probability outside [0, 1]");
        }
        if self.metrics.enabled && self.metrics.report_period_secs == 0 {
            bail!("metrics: report period must be at least one second");
        }
        Ok(())
    }
}
