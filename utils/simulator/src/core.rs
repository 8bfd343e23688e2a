use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info};
use vcd::{IdCode, TimescaleUnit, Value};

use crate::config::SimConfig;
use crate::controller::{Controller, Inputs, ProtocolState};
use crate::line::{Bus, Level, LineMode};
use crate::monitor::{ObservedPulse, PulseMonitor};
use crate::reading::Frame;
use crate::sensor::{Peer, Sensor};
use crate::timing::Timing;
use crate::{Error, Result};

/// Counters collected by the harness while it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub cycles: u64,
    /// Latch cycles executed by the controller.
    pub latches: u64,
    /// Latches that passed the checksum and pulsed `valid`.
    pub readings: u64,
    /// Latches that were silently discarded.
    pub checksum_failures: u64,
    /// Cycles the host drove HIGH against the peripheral.
    pub contentions: u64,
}

/// How one pass through the Latch state ended.
///
/// The controller does not tell these apart on its outputs; the harness can
/// only because it sees the internal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Valid(Frame),
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Cycle on which the outcome became visible.
    pub cycle: u64,
    pub outcome: Outcome,
    /// Latched reading after the attempt.
    pub reading: Frame,
}

#[derive(Clone, Copy)]
struct TraceSignals {
    clock: IdCode,
    reset_n: IdCode,
    line: IdCode,
    peer_pull: IdCode,
    host_driven: IdCode,
    host_level: IdCode,
    state: IdCode,
    counter: IdCode,
    bit_index: IdCode,
    valid: IdCode,
    reading: [IdCode; 5],
}

struct Wire {
    width: u32,
    last: Option<u64>,
}

/// Waveform dump; a value is only written when it changed.
struct Trace<W: Write> {
    writer: vcd::Writer<W>,
    wires: HashMap<IdCode, Wire>,
    signals: TraceSignals,
    half_period_ps: u64,
}

fn add_wire<W: Write>(
    writer: &mut vcd::Writer<W>,
    wires: &mut HashMap<IdCode, Wire>,
    name: &str,
    width: u32,
) -> io::Result<IdCode> {
    let id = writer.add_wire(width, name)?;
    wires.insert(id, Wire { width, last: None });
    Ok(id)
}

fn scalar(bit: bool) -> Value {
    if bit { Value::V1 } else { Value::V0 }
}

impl<W: Write> Trace<W> {
    fn new(out: W, clock_hz: u32) -> io::Result<Self> {
        let mut writer = vcd::Writer::new(out);
        let mut wires = HashMap::new();
        writer.timescale(1, TimescaleUnit::PS)?;
        writer.add_module("dht")?;
        let mut wire = |name: &str, width: u32| add_wire(&mut writer, &mut wires, name, width);
        let signals = TraceSignals {
            clock: wire("clock", 1)?,
            reset_n: wire("reset_n", 1)?,
            line: wire("line", 1)?,
            peer_pull: wire("peer_pull", 1)?,
            host_driven: wire("host_driven", 1)?,
            host_level: wire("host_level", 1)?,
            state: wire("state", 4)?,
            counter: wire("counter", 32)?,
            bit_index: wire("bit_index", 6)?,
            valid: wire("valid", 1)?,
            reading: [
                wire("first_integral", 8)?,
                wire("first_fractional", 8)?,
                wire("second_integral", 8)?,
                wire("second_fractional", 8)?,
                wire("checksum", 8)?,
            ],
        };
        writer.upscope()?;
        writer.enddefinitions()?;

        Ok(Self {
            writer,
            wires,
            signals,
            half_period_ps: (500_000_000_000 / u64::from(clock_hz.max(1))).max(1),
        })
    }

    fn change(&mut self, id: IdCode, value: u64) -> io::Result<()> {
        let Some(wire) = self.wires.get_mut(&id) else {
            return Ok(());
        };
        if wire.last == Some(value) {
            return Ok(());
        }
        wire.last = Some(value);
        let width = wire.width;
        if width == 1 {
            self.writer.change_scalar(id, scalar(value & 1 == 1))
        } else {
            self.writer
                .change_vector(id, (0..width).rev().map(|bit| scalar((value >> bit) & 1 == 1)))
        }
    }
}

pub struct Simulator<P: Peer = Sensor> {
    clock_hz: u32,
    controller: Controller,
    peer: P,
    bus: Bus,
    reset_n: bool,
    level: Level,
    monitor: PulseMonitor,
    pulses: Option<Vec<ObservedPulse>>,
    trace: Option<Trace<BufWriter<File>>>,
    stats: Stats,
}

impl Simulator<Sensor> {
    pub fn from_config(config: &SimConfig) -> Result<Self> {
        let timing = config.timing()?;
        let sensor = Sensor::new(config.sensor.widths(config.clock_hz), config.frame);
        Ok(Self::new(config.clock_hz, timing, sensor))
    }
}

impl<P: Peer> Simulator<P> {
    pub fn new(clock_hz: u32, timing: Timing, peer: P) -> Self {
        Simulator {
            clock_hz,
            controller: Controller::new(timing),
            peer,
            bus: Bus::new(),
            reset_n: true,
            level: Level::Low,
            monitor: PulseMonitor::new(),
            pulses: None,
            trace: None,
            stats: Stats::default(),
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn state(&self) -> ProtocolState {
        self.controller.state()
    }

    pub fn peer_mut(&mut self) -> &mut P {
        &mut self.peer
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn cycle(&self) -> u64 {
        self.stats.cycles
    }

    /// Wire level sampled on the most recent edge.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Drive the active-low reset input.
    pub fn set_reset(&mut self, asserted: bool) {
        self.reset_n = !asserted;
    }

    /// Hold reset for `cycles` edges, then release it.
    pub fn reset(&mut self, cycles: u32) -> Result<()> {
        self.set_reset(true);
        for _ in 0..cycles {
            self.tick()?;
        }
        self.set_reset(false);
        debug!(cycle = self.stats.cycles, "reset released");
        Ok(())
    }

    /// Keep every completed pulse seen on the wire until `take_pulses`.
    pub fn record_pulses(&mut self, enable: bool) {
        self.pulses = enable.then(Vec::new);
    }

    pub fn take_pulses(&mut self) -> Vec<ObservedPulse> {
        self.pulses.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub fn open_vcd<Q: AsRef<Path>>(&mut self, path: Q) -> Result<()> {
        let file = BufWriter::new(File::create(path.as_ref())?);
        self.trace = Some(Trace::new(file, self.clock_hz)?);
        info!(path = %path.as_ref().display(), "VCD trace opened");
        Ok(())
    }

    /// Stop tracing. The file is flushed when the writer is dropped.
    pub fn close_vcd(&mut self) {
        self.trace = None;
    }

    /// One full clock period: sample the wire, clock every register.
    pub fn tick(&mut self) -> Result<()> {
        let peer_pull = self.peer.pulls_low();
        let level = self.bus.resolve(self.controller.line(), peer_pull);
        self.dump_clock_low(level, peer_pull)?;

        let before = self.controller.state();
        self.controller.tick(Inputs {
            reset_n: self.reset_n,
            line: level,
        });
        self.peer.tick(level);
        self.level = level;

        if let Some(pulse) = self.monitor.process(level) {
            if let Some(pulses) = self.pulses.as_mut() {
                pulses.push(pulse);
            }
        }

        if before == ProtocolState::Latch && self.reset_n {
            self.stats.latches += 1;
            if self.controller.valid() {
                self.stats.readings += 1;
            } else {
                self.stats.checksum_failures += 1;
            }
        }
        self.stats.contentions = self.bus.contentions();

        self.dump_clock_high()?;
        self.stats.cycles += 1;
        Ok(())
    }

    pub fn run_cycles(&mut self, cycles: u64) -> Result<()> {
        for _ in 0..cycles {
            self.tick()?;
        }
        Ok(())
    }

    /// Tick until `done` holds, for at most `max_cycles` cycles.
    /// Returns the number of cycles run.
    pub fn run_until<F>(&mut self, max_cycles: u64, mut done: F) -> Result<u64>
    where
        F: FnMut(&Self) -> bool,
    {
        for elapsed in 0..max_cycles {
            if done(self) {
                return Ok(elapsed);
            }
            self.tick()?;
        }
        if done(self) {
            return Ok(max_cycles);
        }
        Err(Error::Stalled {
            cycles: max_cycles,
            state: self.controller.state(),
        })
    }

    /// Run until the controller has passed through Latch once.
    pub fn next_attempt(&mut self, max_cycles: u64) -> Result<Attempt> {
        let latches = self.stats.latches;
        self.run_until(max_cycles, |sim| sim.stats.latches > latches)?;

        let outcome = if self.controller.valid() {
            Outcome::Valid(self.controller.reading())
        } else {
            Outcome::Discarded
        };
        debug!(cycle = self.stats.cycles, ?outcome, "attempt finished");
        Ok(Attempt {
            cycle: self.stats.cycles,
            outcome,
            reading: self.controller.reading(),
        })
    }

    /// Collect `count` valid readings within a total budget of `max_cycles`.
    pub fn collect_readings(&mut self, count: usize, max_cycles: u64) -> Result<Vec<Frame>> {
        let deadline = self.stats.cycles.saturating_add(max_cycles);
        let mut readings = Vec::with_capacity(count);
        while readings.len() < count {
            let budget = deadline.saturating_sub(self.stats.cycles);
            if let Outcome::Valid(frame) = self.next_attempt(budget)?.outcome {
                readings.push(frame);
            }
        }
        Ok(readings)
    }

    fn dump_clock_low(&mut self, level: Level, peer_pull: bool) -> Result<()> {
        let Some(trace) = self.trace.as_mut() else {
            return Ok(());
        };
        let signals = trace.signals;
        trace
            .writer
            .timestamp(2 * self.stats.cycles * trace.half_period_ps)?;
        trace.change(signals.clock, 0)?;
        trace.change(signals.reset_n, u64::from(self.reset_n))?;
        trace.change(signals.line, u64::from(level.bit()))?;
        trace.change(signals.peer_pull, u64::from(peer_pull))?;
        Ok(())
    }

    fn dump_clock_high(&mut self) -> Result<()> {
        let Some(trace) = self.trace.as_mut() else {
            return Ok(());
        };
        let regs = self.controller.registers();
        let signals = trace.signals;
        trace
            .writer
            .timestamp((2 * self.stats.cycles + 1) * trace.half_period_ps)?;
        trace.change(signals.clock, 1)?;
        trace.change(
            signals.host_driven,
            u64::from(regs.line.mode() == LineMode::Driven),
        )?;
        trace.change(signals.host_level, u64::from(regs.line.level().bit()))?;
        trace.change(signals.state, u64::from(regs.state.code()))?;
        trace.change(signals.counter, u64::from(regs.counter))?;
        trace.change(signals.bit_index, u64::from(regs.bit_index))?;
        trace.change(signals.valid, u64::from(regs.valid))?;
        for (id, byte) in signals.reading.iter().zip(regs.reading.bytes()) {
            trace.change(*id, u64::from(byte))?;
        }
        Ok(())
    }
}
