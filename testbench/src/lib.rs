use std::path::Path;

use anyhow::{Context, Result};
use dht_sim::{Frame, Peer, ProtocolState, SimConfig, Simulator, Stats};
use serde::Deserialize;

/// Cycle budget for one attempt at the reference clock, with headroom.
pub const DEFAULT_MAX_CYCLES: u64 = 5_000_000;

/// What a scenario run must observe.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expect {
    /// Cycles on which `valid` was high, over all attempts.
    pub valid: u64,
    /// Latched reading after the last attempt.
    #[serde(default)]
    pub reading: Frame,
    #[serde(default)]
    pub discarded: u64,
}

/// Declarative end-to-end test, loaded from `scenarios/*.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(skip)]
    pub name: String,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u64,
    #[serde(flatten)]
    pub config: SimConfig,
    pub expect: Expect,
}

fn default_attempts() -> u32 {
    1
}

fn default_max_cycles() -> u64 {
    DEFAULT_MAX_CYCLES
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let mut scenario: Scenario = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse scenario {}", path.display()))?;
        scenario.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(scenario)
    }
}

/// What the harness saw across one or more attempts.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub valid_cycles: u64,
    /// Valid pulses longer than one cycle.
    pub stretched_pulses: u64,
    pub reading: Frame,
    pub stats: Stats,
}

/// Run one attempt to completion: through Latch and back to Idle.
pub fn watch_attempt<P: Peer>(
    sim: &mut Simulator<P>,
    max_cycles: u64,
    observation: &mut Observation,
) -> Result<()> {
    let latches = sim.stats().latches;
    let mut previous_valid = false;
    sim.run_until(max_cycles, |sim| {
        let valid = sim.controller().valid();
        if valid {
            observation.valid_cycles += 1;
            if previous_valid {
                observation.stretched_pulses += 1;
            }
        }
        previous_valid = valid;
        sim.stats().latches > latches && sim.state() == ProtocolState::Idle
    })
    .context("Attempt did not finish")?;

    observation.reading = sim.controller().reading();
    observation.stats = sim.stats();
    Ok(())
}

/// Run every attempt of `scenario`, optionally dumping a waveform.
pub fn run_scenario(scenario: &Scenario, vcd: Option<&Path>) -> Result<Observation> {
    let mut sim = Simulator::from_config(&scenario.config).context("Failed to create simulator")?;
    if let Some(path) = vcd {
        sim.open_vcd(path)?;
    }
    sim.reset(scenario.config.reset_cycles)?;

    let mut observation = Observation::default();
    for attempt in 1..=scenario.attempts {
        watch_attempt(&mut sim, scenario.max_cycles, &mut observation)
            .with_context(|| format!("Attempt {} of {}", attempt, scenario.name))?;
    }
    sim.close_vcd();
    Ok(observation)
}

pub fn check_scenario(scenario: &Scenario, observation: &Observation) -> Result<()> {
    let expect = &scenario.expect;
    if observation.stretched_pulses != 0 {
        anyhow::bail!(
            "valid stayed high for more than one cycle ({} extra cycles)",
            observation.stretched_pulses
        );
    }
    if observation.valid_cycles != expect.valid {
        anyhow::bail!(
            "expected {} valid pulses, saw {}",
            expect.valid,
            observation.valid_cycles
        );
    }
    if observation.stats.checksum_failures != expect.discarded {
        anyhow::bail!(
            "expected {} discarded readings, saw {}",
            expect.discarded,
            observation.stats.checksum_failures
        );
    }
    if observation.reading != expect.reading {
        anyhow::bail!(
            "latched reading is {}, expected {}",
            observation.reading,
            expect.reading
        );
    }
    if observation.stats.contentions != 0 {
        anyhow::bail!(
            "host and sensor drove the wire together for {} cycles",
            observation.stats.contentions
        );
    }
    Ok(())
}

/// Tick until the controller is in `state`.
pub fn drive_to<P: Peer>(
    sim: &mut Simulator<P>,
    state: ProtocolState,
    max_cycles: u64,
) -> Result<u64> {
    sim.run_until(max_cycles, |sim| sim.state() == state)
        .with_context(|| format!("Controller never reached {}", state))
}
