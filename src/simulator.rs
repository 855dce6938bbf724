// src/simulator.rs
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::{Mode, Rate, ScriptedLink, Transport, DEFAULT_TIMEOUT};

pub const SIMULATED_IDN: &str = "OWON,XDM1041,SIM00001,V3.9.0 (simulated)";
const DROPOUT_PROBABILITY: f64 = 0.02;

/// Software stand-in for an XDM meter that answers the SCPI subset the
/// driver uses.
pub struct SimulatedMeter {
    mode: Mode,
    rate: Rate,
    phase: f64,
    rng: StdRng,
}

impl SimulatedMeter {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            mode: Mode::VoltDc,
            rate: Rate::Medium,
            phase: 0.0,
            rng,
        }
    }

    pub fn into_transport(self) -> Transport {
        let mut meter = self;
        let link = ScriptedLink::new(move |cmd| meter.respond(cmd));
        Transport::from_link("simulated XDM", link, DEFAULT_TIMEOUT)
    }

    pub fn respond(&mut self, command: &str) -> Option<String> {
        let command = command.trim().to_ascii_uppercase();
        match command.as_str() {
            "*IDN?" => Some(SIMULATED_IDN.to_owned()),
            "FUNC?" => Some(format!("\"{}\"", reported_function(self.mode))),
            "MEAS?" => self.measure().map(|v| format!("{v:.6E}")),
            "RANG?" => Some(nominal_range(self.mode).to_owned()),
            _ if command.starts_with("CONF:") && !command.ends_with('?') => {
                if let Some(mode) = Mode::ALL
                    .into_iter()
                    .find(|m| m.configure_command() == command)
                {
                    self.mode = mode;
                }
                None
            }
            _ if command.starts_with("RATE ") => {
                if let Ok(rate) = command["RATE ".len()..].parse() {
                    self.rate = rate;
                }
                None
            }
            _ => None,
        }
    }

    fn measure(&mut self) -> Option<f64> {
        if self.rng.gen_bool(DROPOUT_PROBABILITY) {
            return None;
        }
        self.phase += match self.rate {
            Rate::Slow => 0.05,
            Rate::Medium => 0.1,
            Rate::Fast => 0.2,
        };
        let wave = self.phase.sin();
        let noise: f64 = self.rng.gen_range(-1.0..1.0);
        let value = match self.mode {
            Mode::VoltDc => 3.3 + 0.05 * wave + 0.002 * noise,
            Mode::VoltAc => 230.0 + 2.0 * wave + 0.5 * noise,
            Mode::CurrDc => 0.012 * wave + 0.0002 * noise,
            Mode::CurrAc => 0.5 + 0.01 * noise,
            Mode::Resistance => 4_700.0 + 5.0 * noise,
            Mode::Continuity => 0.3 + 0.05 * noise,
            Mode::Capacitance => 1.0e-6 * (1.0 + 0.01 * noise),
            Mode::Diode => 0.62 + 0.005 * noise,
            Mode::Frequency => 50.0 + 0.02 * noise,
            Mode::Temperature => 23.5 + 0.3 * wave + 0.05 * noise,
        };
        Some(value)
    }
}

impl Default for SimulatedMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn reported_function(mode: Mode) -> &'static str {
    match mode {
        Mode::VoltDc => "VOLT",
        Mode::CurrDc => "CURR",
        other => other.label(),
    }
}

fn nominal_range(mode: Mode) -> &'static str {
    match mode {
        Mode::VoltDc => "5V",
        Mode::VoltAc => "500V",
        Mode::CurrDc | Mode::CurrAc => "50mA",
        Mode::Resistance => "5kΩ",
        Mode::Capacitance => "5uF",
        _ => "AUTO",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{parse_reading, Multimeter};

    #[test]
    fn answers_identity_and_function() {
        let mut sim = SimulatedMeter::with_seed(7);
        assert_eq!(sim.respond("*IDN?").as_deref(), Some(SIMULATED_IDN));
        assert_eq!(sim.respond("FUNC?").as_deref(), Some("\"VOLT\""));
        assert_eq!(sim.respond("CONF:RES"), None);
        assert_eq!(sim.respond("FUNC?").as_deref(), Some("\"RES\""));
        assert_eq!(sim.respond("CONF?"), None);
        assert_eq!(sim.respond("RANG?").as_deref(), Some("5kΩ"));
    }

    #[test]
    fn resistance_readings_stay_near_nominal() {
        let mut sim = SimulatedMeter::with_seed(11);
        sim.respond("CONF:RES");
        let readings: Vec<f64> = (0..200)
            .filter_map(|_| sim.respond("MEAS?"))
            .filter_map(|text| parse_reading(&text))
            .collect();
        assert!(readings.len() > 150);
        assert!(readings.iter().all(|v| *v > 4_000.0 && *v < 5_000.0));
    }

    #[test]
    fn drives_the_multimeter_driver() {
        let mut meter = Multimeter::new(SimulatedMeter::with_seed(3).into_transport())
            .with_settle_delay(std::time::Duration::ZERO);
        assert!(meter.identify().is_recognized());
        assert!(meter.set_mode(Mode::Frequency));
        assert!(meter.set_rate(Rate::Fast));
        assert_eq!(meter.query_mode().as_deref(), Some("FREQ"));
        assert_eq!(meter.query_range(), "AUTO");
    }
}
