//! Protocol tests runner
//!
//! Runs every scenario in testbench/scenarios/ end to end, followed by
//! property checks that drive the controller through hand-built sensor
//! responses.

use anyhow::{Context, Result, bail, ensure};
use dht_sim::{
    Error, Frame, Level, LineMode, Outcome, ProtocolState, Pulse, PulseWidths, Registers,
    Response, Sensor, SimConfig, Silent, Simulator, Timing,
};
use glob::glob;
use libtest_mimic::{Arguments, Failed, Trial};
use std::path::{Path, PathBuf};
use testbench::{Observation, Scenario, check_scenario, drive_to, run_scenario, watch_attempt};

const SCENARIO_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/scenarios");
const TARGET_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../target/");

const FAST_CLOCK_HZ: u32 = 1_000_000;
const FAST_BUDGET: u64 = 200_000;
const REFERENCE_BUDGET: u64 = 5_000_000;

fn main() -> Result<()> {
    let args = Arguments::from_args();

    let mut tests = discover_scenarios()?;
    tests.extend(property_trials());

    libtest_mimic::run(&args, tests).exit();
}

/// Discover all scenario files
fn discover_scenarios() -> Result<Vec<Trial>> {
    let mut trials = Vec::new();
    let pattern = format!("{SCENARIO_PATH}/*.yaml");
    for path in glob(&pattern)? {
        let path = path?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .context("Scenario file name is not UTF-8")?
            .to_owned();
        trials.push(Trial::test(format!("scenario::{}", name), move || {
            run_scenario_file(&path)
        }));
    }
    Ok(trials)
}

fn run_scenario_file(path: &Path) -> Result<(), Failed> {
    let run = || -> Result<()> {
        let scenario = Scenario::load(path)?;
        // Waveforms for scenarios are large; only dump them on request.
        let vcd = match std::env::var_os("DHT_SIM_VCD") {
            Some(_) => {
                let dir = PathBuf::from(format!("{}/vcd", TARGET_PATH));
                std::fs::create_dir_all(&dir)?;
                Some(dir.join(format!("{}.vcd", scenario.name)))
            }
            None => None,
        };
        let observation = run_scenario(&scenario, vcd.as_deref())?;
        check_scenario(&scenario, &observation)
    };
    run().map_err(|e| format!("{:#}", e).into())
}

fn property(name: &str, test: fn() -> Result<()>) -> Trial {
    Trial::test(format!("property::{}", name), move || {
        test().map_err(|e| format!("{:#}", e).into())
    })
}

fn property_trials() -> Vec<Trial> {
    vec![
        property("valid_reading_pulses_once", valid_reading_pulses_once),
        property(
            "corrupt_checksum_keeps_power_on_value",
            corrupt_checksum_keeps_power_on_value,
        ),
        property(
            "failed_reading_retains_previous_value",
            failed_reading_retains_previous_value,
        ),
        property("high_width_threshold_is_exact", high_width_threshold_is_exact),
        property(
            "short_low_does_not_advance_bit_index",
            short_low_does_not_advance_bit_index,
        ),
        property("reset_from_every_state", reset_from_every_state),
        property("wait_next_reenters_idle_on_low", wait_next_reenters_idle_on_low),
        property("silent_sensor_stalls_in_response_wait", silent_sensor_stalls),
        property("host_drives_only_during_start", host_drives_only_during_start),
        property("contention_is_counted", contention_is_counted),
        property("monitor_measures_sensor_response", monitor_measures_sensor_response),
        property(
            "collect_readings_skips_discarded",
            collect_readings_skips_discarded,
        ),
    ]
}

fn fast_config() -> SimConfig {
    SimConfig {
        clock_hz: FAST_CLOCK_HZ,
        ..SimConfig::default()
    }
}

fn fast_simulator(frame: Frame) -> Result<Simulator> {
    let config = SimConfig {
        frame,
        ..fast_config()
    };
    let mut sim = Simulator::from_config(&config)?;
    sim.reset(config.reset_cycles)?;
    Ok(sim)
}

/// Reference-clock simulator around a sensor with hand-picked widths.
fn reference_simulator(widths: PulseWidths, frame: Frame) -> Result<Simulator> {
    let config = SimConfig::default();
    let sensor = Sensor::new(widths, frame);
    let mut sim = Simulator::new(config.clock_hz, config.timing()?, sensor);
    sim.reset(config.reset_cycles)?;
    Ok(sim)
}

fn reference_widths() -> PulseWidths {
    let config = SimConfig::default();
    config.sensor.widths(config.clock_hz)
}

fn valid_reading_pulses_once() -> Result<()> {
    let payloads = [
        [0x19, 0x00, 0x1a, 0x00],
        [0xff, 0xff, 0xff, 0xff],
        [0x80, 0x01, 0x7f, 0xfe],
        [0xaa, 0x55, 0xaa, 0x55],
        [0x01, 0x00, 0x00, 0x00],
    ];
    let mut sim = fast_simulator(Frame::default())?;
    for fields in payloads {
        let frame = Frame::with_checksum(fields);
        sim.peer_mut().set_frame(frame);

        let mut observation = Observation::default();
        watch_attempt(&mut sim, FAST_BUDGET, &mut observation)?;
        ensure!(
            observation.valid_cycles == 1,
            "{}: valid high for {} cycles",
            frame,
            observation.valid_cycles
        );
        ensure!(
            observation.reading == frame,
            "latched {}, sent {}",
            observation.reading,
            frame
        );
        ensure!(observation.reading.fields() == fields);
    }
    Ok(())
}

fn corrupt_checksum_keeps_power_on_value() -> Result<()> {
    let mut sim = fast_simulator(Frame::new([0x19, 0x00, 0x1a, 0x00], 0x00))?;
    let mut observation = Observation::default();
    watch_attempt(&mut sim, FAST_BUDGET, &mut observation)?;
    watch_attempt(&mut sim, FAST_BUDGET, &mut observation)?;

    ensure!(observation.valid_cycles == 0, "valid asserted");
    ensure!(observation.stats.checksum_failures == 2);
    ensure!(
        observation.reading == Frame::default(),
        "reading changed to {}",
        observation.reading
    );
    Ok(())
}

fn failed_reading_retains_previous_value() -> Result<()> {
    let good = Frame::with_checksum([0x22, 0x05, 0x17, 0x09]);
    let mut sim = fast_simulator(good)?;
    let mut observation = Observation::default();
    watch_attempt(&mut sim, FAST_BUDGET, &mut observation)?;
    ensure!(observation.reading == good);

    let mut bad = Frame::with_checksum([0x30, 0x00, 0x10, 0x00]);
    bad.checksum ^= 0x01;
    sim.peer_mut().set_frame(bad);
    watch_attempt(&mut sim, FAST_BUDGET, &mut observation)?;

    ensure!(observation.valid_cycles == 1, "second reading pulsed valid");
    ensure!(
        observation.reading == good,
        "reading changed to {}",
        observation.reading
    );
    Ok(())
}

fn high_width_threshold_is_exact() -> Result<()> {
    let threshold = Timing::REFERENCE.one_threshold;

    // Widths on either side of the threshold.
    let frame = Frame::with_checksum([0x19, 0x00, 0x1a, 0x00]);
    let widths = PulseWidths {
        zero_high: threshold,
        one_high: threshold + 1,
        ..reference_widths()
    };
    let mut sim = reference_simulator(widths, frame)?;
    let mut observation = Observation::default();
    watch_attempt(&mut sim, REFERENCE_BUDGET, &mut observation)?;
    ensure!(observation.valid_cycles == 1, "boundary reading not valid");
    ensure!(observation.reading == frame, "decoded {}", observation.reading);

    // Every HIGH at or below the threshold reads as zero.
    let widths = PulseWidths {
        zero_high: 1_300,
        one_high: threshold,
        ..reference_widths()
    };
    let mut sim = reference_simulator(widths, Frame::with_checksum([0xff; 4]))?;
    let mut observation = Observation::default();
    watch_attempt(&mut sim, REFERENCE_BUDGET, &mut observation)?;
    ensure!(observation.valid_cycles == 1, "all-zero reading not valid");
    ensure!(
        observation.reading == Frame::default(),
        "decoded {}",
        observation.reading
    );
    Ok(())
}

fn short_low_does_not_advance_bit_index() -> Result<()> {
    const GLITCH_LOW: u32 = 1_500;
    const GLITCH_HIGH: u32 = 1_300;

    let frame = Frame::with_checksum([0x19, 0x00, 0x1a, 0x00]);
    let widths = reference_widths();
    let mut script = widths.encode(&frame);
    // After the acknowledge, before the first bit-cell.
    script.insert(3, Pulse::Release(GLITCH_HIGH));
    script.insert(3, Pulse::Low(GLITCH_LOW));

    let mut sim = reference_simulator(widths, frame)?;
    sim.peer_mut().set_response(Response::Pulses(script));
    drive_to(&mut sim, ProtocolState::BitLow, REFERENCE_BUDGET)?;

    for _ in 1..GLITCH_LOW + GLITCH_HIGH {
        sim.tick()?;
        ensure!(
            sim.state() == ProtocolState::BitLow,
            "left BitLow on cycle {}",
            sim.cycle()
        );
        ensure!(sim.controller().bit_index() == 0, "bit index advanced");
    }

    let mut observation = Observation::default();
    watch_attempt(&mut sim, REFERENCE_BUDGET, &mut observation)?;
    ensure!(observation.valid_cycles == 1, "reading after glitch not valid");
    ensure!(observation.reading == frame, "decoded {}", observation.reading);
    Ok(())
}

fn reset_from_every_state() -> Result<()> {
    let frame = Frame::with_checksum([0x19, 0x00, 0x1a, 0x00]);
    for state in ProtocolState::ALL {
        let mut sim = fast_simulator(frame)?;
        // Latch a reading first so the output registers are non-zero.
        if state != ProtocolState::Idle {
            let mut observation = Observation::default();
            watch_attempt(&mut sim, FAST_BUDGET, &mut observation)?;
        }
        drive_to(&mut sim, state, FAST_BUDGET)?;

        sim.set_reset(true);
        sim.tick()?;
        let regs = sim.controller().registers();
        ensure!(
            *regs == Registers::default(),
            "reset from {} left {:?}",
            state,
            regs
        );
        ensure!(regs.line.mode() == LineMode::Driven);
        ensure!(regs.line.output() == Some(Level::Low));
        sim.set_reset(false);

        let mut observation = Observation::default();
        watch_attempt(&mut sim, FAST_BUDGET, &mut observation)
            .with_context(|| format!("no recovery after reset from {}", state))?;
        ensure!(observation.reading == frame);
    }
    Ok(())
}

fn wait_next_reenters_idle_on_low() -> Result<()> {
    let config = fast_config();
    // A one-cycle trailing LOW leaves the wire HIGH in WaitNext.
    let widths = PulseWidths {
        end_low: 1,
        ..config.sensor.widths(config.clock_hz)
    };
    let sensor = Sensor::new(widths, config.frame);
    let mut sim = Simulator::new(config.clock_hz, config.timing()?, sensor);
    sim.reset(config.reset_cycles)?;

    drive_to(&mut sim, ProtocolState::WaitNext, FAST_BUDGET)?;
    for _ in 0..500 {
        sim.tick()?;
        ensure!(sim.state() == ProtocolState::WaitNext, "left WaitNext early");
    }

    sim.peer_mut().inject([Pulse::Low(10)]);
    sim.tick()?;
    ensure!(
        sim.state() == ProtocolState::Idle,
        "still in {}",
        sim.state()
    );
    sim.tick()?;
    ensure!(sim.state() == ProtocolState::StartLow);

    // The same sensor leaves the wire HIGH again, so only wait for the latch.
    let attempt = sim.next_attempt(FAST_BUDGET)?;
    ensure!(
        attempt.outcome == Outcome::Valid(config.frame),
        "re-armed reading ended with {:?}",
        attempt
    );
    ensure!(sim.state() == ProtocolState::WaitNext);
    Ok(())
}

fn silent_sensor_stalls() -> Result<()> {
    let config = fast_config();
    let mut sim = Simulator::new(config.clock_hz, config.timing()?, Silent);
    sim.reset(config.reset_cycles)?;

    match sim.next_attempt(FAST_BUDGET) {
        Err(Error::Stalled {
            state: ProtocolState::WaitRespLow,
            ..
        }) => {}
        other => bail!("expected a stall in WaitRespLow, got {:?}", other),
    }
    ensure!(sim.controller().line().mode() == LineMode::Released);
    ensure!(sim.level() == Level::High, "released wire not pulled up");
    ensure!(!sim.controller().valid());
    Ok(())
}

fn host_drives_only_during_start() -> Result<()> {
    let mut sim = fast_simulator(Frame::with_checksum([0x12, 0x34, 0x56, 0x78]))?;
    let latches = sim.stats().latches;
    let mut violations = Vec::new();
    sim.run_until(FAST_BUDGET, |sim| {
        let regs = sim.controller().registers();
        let driven = regs.line.mode() == LineMode::Driven;
        let must_drive = matches!(
            regs.state,
            ProtocolState::StartLow | ProtocolState::StartHigh
        );
        if (driven && !regs.state.host_drives()) || (must_drive && !driven) {
            violations.push((sim.cycle(), regs.state, regs.line));
        }
        sim.stats().latches > latches && sim.state() == ProtocolState::Idle
    })?;

    ensure!(violations.is_empty(), "line mode violations: {:?}", violations);
    ensure!(sim.stats().contentions == 0, "bus contention");
    Ok(())
}

fn contention_is_counted() -> Result<()> {
    let mut sim = fast_simulator(Frame::default())?;
    drive_to(&mut sim, ProtocolState::StartHigh, FAST_BUDGET)?;
    ensure!(sim.controller().line().output() == Some(Level::High));

    sim.peer_mut().inject([Pulse::Low(5)]);
    sim.run_cycles(8)?;
    ensure!(
        sim.stats().contentions == 5,
        "counted {} contention cycles",
        sim.stats().contentions
    );
    Ok(())
}

fn monitor_measures_sensor_response() -> Result<()> {
    let config = fast_config();
    let widths = config.sensor.widths(config.clock_hz);
    let timing = config.timing()?;
    let mut sim = fast_simulator(config.frame)?;
    sim.record_pulses(true);
    sim.next_attempt(FAST_BUDGET)?;
    let pulses = sim.take_pulses();

    let start = pulses
        .iter()
        .position(|pulse| pulse.level == Level::Low)
        .context("no LOW pulse on the wire")?;
    ensure!(
        pulses[start].width >= u64::from(timing.start_low),
        "start pulse only {} cycles",
        pulses[start].width
    );

    let expected = [
        (Level::High, widths.response_delay + 1),
        (Level::Low, widths.response_low),
        (Level::High, widths.response_high),
        (Level::Low, widths.bit_low),
    ];
    for (offset, (level, width)) in expected.into_iter().enumerate() {
        let pulse = pulses
            .get(start + 1 + offset)
            .context("response cut short")?;
        ensure!(
            pulse.level == level && pulse.width == u64::from(width),
            "pulse {} is {:?}, expected {:?} for {} cycles",
            offset,
            pulse,
            level,
            width
        );
    }
    Ok(())
}

fn collect_readings_skips_discarded() -> Result<()> {
    let good = Frame::with_checksum([0x2d, 0x00, 0x15, 0x03]);
    let frame = good.to_bits();
    let mut sim = fast_simulator(Frame::from_bits(frame ^ 0x01))?;

    // One discarded attempt, then the sensor is fixed.
    let attempt = sim.next_attempt(FAST_BUDGET)?;
    ensure!(attempt.outcome == Outcome::Discarded, "got {:?}", attempt);
    sim.peer_mut().set_frame(good);

    let readings = sim.collect_readings(2, 2 * FAST_BUDGET)?;
    ensure!(readings == [good, good], "collected {:?}", readings);
    ensure!(sim.stats().readings == 2);
    ensure!(sim.stats().checksum_failures == 1);
    Ok(())
}
