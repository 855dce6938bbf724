// src/main.rs
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use xdm_scope::drivers::list_ports;
use xdm_scope::{format_value, Identity, Mode, Rate, ScopeConfig, Session, CONSUMER_TICK};

const READOUT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "xdm-scope", version, about = "Live readout for OWON XDM multimeters")]
struct Opts {
    /// JSON settings file; command-line options override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<String>,

    #[arg(long)]
    baud: Option<u32>,

    #[arg(long = "poll-hz")]
    poll_hz: Option<f64>,

    /// Visible window in seconds.
    #[arg(long)]
    window: Option<f64>,

    /// Readings above this are hidden from the window and statistics.
    #[arg(long)]
    ceiling: Option<f64>,

    /// Function to select, e.g. "VOLT DC", "RES", "FREQ".
    #[arg(long)]
    mode: Option<Mode>,

    /// S, M or F.
    #[arg(long)]
    rate: Option<Rate>,

    /// Use the built-in simulated meter.
    #[arg(long)]
    simulate: bool,

    /// Scan serial ports for a meter.
    #[arg(long)]
    auto: bool,

    /// Print the serial ports found and exit.
    #[arg(long = "list-ports")]
    list_ports: bool,

    /// Stop after this many seconds; runs until killed otherwise.
    #[arg(long = "run-seconds")]
    run_seconds: Option<f64>,

    #[arg(long = "marker-a")]
    marker_a: Option<f64>,

    #[arg(long = "marker-b")]
    marker_b: Option<f64>,
}

fn load_config(opts: &Opts) -> Result<ScopeConfig> {
    let mut config = match &opts.config {
        Some(path) => ScopeConfig::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ScopeConfig::default(),
    };
    if let Some(port) = &opts.port {
        config.port = Some(port.clone());
    }
    if let Some(baud) = opts.baud {
        config.baud_rate = baud;
    }
    if let Some(hz) = opts.poll_hz {
        config.poll_hz = hz;
    }
    if let Some(window) = opts.window {
        config.window_seconds = window;
    }
    if opts.ceiling.is_some() {
        config.value_ceiling = opts.ceiling;
    }
    config.validate().context("invalid settings")?;
    Ok(config)
}

/// How long to acquire, `None` meaning until killed.
fn run_limit(run_seconds: Option<f64>) -> Result<Option<Duration>> {
    run_seconds
        .map(|seconds| {
            Duration::try_from_secs_f64(seconds)
                .with_context(|| format!("--run-seconds {seconds} is not a usable duration"))
        })
        .transpose()
}

fn connect(session: &mut Session, opts: &Opts, config: &ScopeConfig) -> Result<Identity> {
    if opts.simulate {
        return Ok(session.connect_simulated());
    }
    if let Some(port) = &config.port {
        return session
            .connect(port, config.baud_rate)
            .with_context(|| format!("connecting to {port}"));
    }
    if opts.auto {
        return session
            .auto_connect(config.baud_rate)
            .context("scanning serial ports");
    }
    bail!("no port given; use --port, --auto or --simulate")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::parse();

    if opts.list_ports {
        for port in list_ports() {
            println!("{port}");
        }
        return Ok(());
    }

    let config = load_config(&opts)?;
    let limit = run_limit(opts.run_seconds)?;
    let mut session = Session::new(&config);
    let identity = connect(&mut session, &opts, &config)?;
    info!("instrument: {}", identity.text());

    if let Some(mode) = opts.mode.or(config.selected_mode()?) {
        session.select_mode(mode)?;
    }
    if let Some(rate) = opts.rate.or(config.selected_rate()?) {
        session.select_rate(rate)?;
    }

    session.start()?;
    let started = Instant::now();
    let mut last_readout = Instant::now();
    while limit.map_or(true, |limit| started.elapsed() < limit) {
        thread::sleep(CONSUMER_TICK);
        session.tick();
        if last_readout.elapsed() >= READOUT_INTERVAL {
            last_readout = Instant::now();
            info!(
                "{} [{}] range {}",
                session.value_text(),
                session.current_mode().unwrap_or("?"),
                session.range_text()
            );
        }
    }
    session.stop();
    session.tick();

    if let Some(t) = opts.marker_a {
        session.set_marker_a(t);
    }
    if let Some(t) = opts.marker_b {
        session.set_marker_b(t);
    }
    let window = session.visible_window();
    println!(
        "{} samples, window {:.1}..{:.1} s",
        session.series().len(),
        window.t_min,
        window.t_max
    );
    if let Some((lo, hi)) = window.y_range() {
        println!(
            "visible range {} .. {}",
            format_value(Some(lo), session.unit()),
            format_value(Some(hi), session.unit())
        );
    }
    if let Some(span) = session.marker_span() {
        println!("marker span {span:.3} s");
    }
    println!("{}", session.stats_summary());

    session.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_limit_rejects_unusable_durations() {
        assert_eq!(run_limit(None).unwrap(), None);
        assert_eq!(
            run_limit(Some(2.5)).unwrap(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(run_limit(Some(0.0)).unwrap(), Some(Duration::ZERO));
        assert!(run_limit(Some(-1.0)).is_err());
        assert!(run_limit(Some(f64::NAN)).is_err());
        assert!(run_limit(Some(f64::INFINITY)).is_err());
    }

    #[test]
    fn options_parse_modes_and_rates() {
        let opts = Opts::try_parse_from([
            "xdm-scope",
            "--simulate",
            "--mode",
            "res",
            "--rate",
            "fast",
            "--run-seconds=-1",
        ])
        .unwrap();
        assert_eq!(opts.mode, Some(Mode::Resistance));
        assert_eq!(opts.rate, Some(Rate::Fast));
        assert!(run_limit(opts.run_seconds).is_err());
    }
}
