use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use dht_sim::{
    Frame, Level, ObservedPulse, Outcome, SimConfig, Simulator, Timing, parse_hex_byte,
};

#[derive(Parser)]
#[command(name = "dht-sim")]
#[command(about = "Cycle-accurate single-wire sensor controller simulator")]
#[command(version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<Utf8PathBuf>,

    /// Controller clock in Hz (protocol windows are rescaled)
    #[arg(long)]
    clock_hz: Option<u32>,

    /// Frame sent by the sensor, e.g. "19 00 1a 00" (checksum computed) or five bytes
    #[arg(long, value_parser = parse_frame)]
    frame: Option<Frame>,

    /// Override the transmitted checksum byte, in hex (e.g. 33 or 0x00)
    #[arg(long, value_parser = parse_hex)]
    checksum: Option<u8>,

    /// Number of read attempts to simulate
    #[arg(long, default_value = "1")]
    readings: u32,

    /// Cycle budget for each attempt
    #[arg(long, default_value = "10000000")]
    max_cycles: u64,

    /// VCD output file
    #[arg(long)]
    vcd: Option<Utf8PathBuf>,

    /// Print the derived cycle constants and exit
    #[arg(long)]
    print_timing: bool,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_hex(s: &str) -> Result<u8, String> {
    parse_hex_byte(s).ok_or_else(|| format!("`{}` is not a hex byte", s))
}

fn parse_frame(s: &str) -> Result<Frame, String> {
    s.parse::<Frame>().map_err(|e| e.to_string())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

fn micros(cycles: u64, clock_hz: u32) -> f64 {
    cycles as f64 * 1e6 / f64::from(clock_hz)
}

fn print_timing(config: &SimConfig, timing: &Timing) {
    let hz = config.clock_hz;
    println!("Clock: {} Hz", hz);
    println!("Controller windows (cycles):");
    for (name, cycles) in [
        ("start low", timing.start_low),
        ("start high", timing.start_high),
        ("min bit low", timing.min_bit_low),
        ("one threshold", timing.one_threshold),
    ] {
        println!(
            "  {:<14} {:>9}  ({:.1} us)",
            name,
            cycles,
            micros(cycles.into(), hz)
        );
    }

    let widths = config.sensor.widths(hz);
    println!("Sensor pulses (cycles):");
    for (name, cycles) in [
        ("start detect", widths.start_detect),
        ("response delay", widths.response_delay),
        ("response low", widths.response_low),
        ("response high", widths.response_high),
        ("bit low", widths.bit_low),
        ("zero high", widths.zero_high),
        ("one high", widths.one_high),
        ("end low", widths.end_low),
    ] {
        println!("  {:<14} {:>9}", name, cycles);
    }
}

/// The host start pulse is the longest LOW on the wire.
fn start_pulse(pulses: &[ObservedPulse]) -> Option<&ObservedPulse> {
    pulses
        .iter()
        .filter(|pulse| pulse.level == Level::Low)
        .max_by_key(|pulse| pulse.width)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => SimConfig::load(path).context("Failed to load configuration")?,
        None => SimConfig::default(),
    };
    if let Some(clock_hz) = args.clock_hz {
        config.clock_hz = clock_hz;
    }
    if let Some(frame) = args.frame {
        config.frame = frame;
    }
    if let Some(checksum) = args.checksum {
        config.frame.checksum = checksum;
    }

    let timing = config.timing().context("Unsupported clock rate")?;
    if args.print_timing {
        print_timing(&config, &timing);
        return Ok(());
    }

    let mut sim = Simulator::from_config(&config).context("Failed to create simulator")?;
    sim.record_pulses(true);
    if let Some(path) = &args.vcd {
        sim.open_vcd(path)
            .with_context(|| format!("Failed to open VCD trace {}", path))?;
    }

    println!(
        "Sensor frame: {} (checksum {})",
        config.frame,
        if config.frame.is_valid() { "ok" } else { "corrupt" }
    );

    sim.reset(config.reset_cycles)?;
    for attempt_no in 1..=args.readings {
        let attempt = sim
            .next_attempt(args.max_cycles)
            .with_context(|| format!("Attempt {} did not complete", attempt_no))?;

        if let Some(pulse) = start_pulse(&sim.take_pulses()) {
            println!(
                "[{}] host start pulse: {} cycles ({:.1} us)",
                attempt_no,
                pulse.width,
                micros(pulse.width, config.clock_hz)
            );
        }

        match attempt.outcome {
            Outcome::Valid(frame) => {
                println!("[{}] cycle {}: valid {}", attempt_no, attempt.cycle, frame)
            }
            Outcome::Discarded => println!(
                "[{}] cycle {}: no valid pulse, latched reading stays {}",
                attempt_no, attempt.cycle, attempt.reading
            ),
        }
    }

    let stats = sim.stats();
    println!(
        "Cycles: {}, valid: {}, discarded: {}, contention cycles: {}",
        stats.cycles, stats.readings, stats.checksum_failures, stats.contentions
    );

    sim.close_vcd();
    Ok(())
}
