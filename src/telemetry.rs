//! Live telemetry frames for the dashboard socket
//!
//! The simulated source is the only one built in. A hardware front-end plugs
//! in by implementing [`TelemetrySource`].

pub mod sensors;

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Dashboard refresh rate
pub const FRAME_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Unix seconds
    pub timestamp: f64,
    pub source: String,
    pub channels: BTreeMap<String, f64>,
}

pub trait TelemetrySource: Send + Sync {
    fn name(&self) -> &str;

    /// Frame for `t` seconds into the stream, stamped with `unix_ts`
    fn frame(&self, t: f64, unix_ts: f64) -> TelemetryFrame;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub active_source: String,
    pub channels: usize,
}

/// Handle to the active source, shared by every socket
#[derive(Clone)]
pub struct Telemetry {
    source: Arc<dyn TelemetrySource>,
    channels: Arc<Vec<ChannelInfo>>,
}

impl Telemetry {
    pub fn new(source: Arc<dyn TelemetrySource>, channels: Vec<ChannelInfo>) -> Self {
        Self {
            source,
            channels: Arc::new(channels),
        }
    }

    pub fn simulated() -> Self {
        Self::new(Arc::new(SimulatedSource::new()), default_channels())
    }

    /// Channels the source produces. The dashboard list comes from the
    /// sensor registry, which starts out as a copy of these.
    pub fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    pub fn frame(&self, t: f64, unix_ts: f64) -> TelemetryFrame {
        self.source.frame(t, unix_ts)
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            active_source: self.source.name().to_string(),
            channels: self.channels.len(),
        }
    }
}

pub fn default_channels() -> Vec<ChannelInfo> {
    const CHANNELS: [(&str, &str, &str, f64, f64, &str); 15] = [
        ("speed", "Vehicle Speed", "km/h", 0.0, 160.0, "Performance"),
        ("rpm", "Engine RPM", "rpm", 0.0, 14000.0, "Performance"),
        ("throttle", "Throttle Position", "%", 0.0, 100.0, "Performance"),
        ("brake_pressure", "Brake Pressure", "bar", 0.0, 120.0, "Performance"),
        ("coolant_temp", "Coolant Temp", "C", 60.0, 120.0, "Temperatures"),
        ("oil_temp", "Oil Temp", "C", 60.0, 140.0, "Temperatures"),
        ("intake_temp", "Intake Air Temp", "C", 20.0, 60.0, "Temperatures"),
        ("exhaust_temp", "Exhaust Temp", "C", 200.0, 900.0, "Temperatures"),
        ("g_lateral", "Lateral G-Force", "g", -2.5, 2.5, "G-Forces"),
        ("g_longitudinal", "Longitudinal G-Force", "g", -3.0, 3.0, "G-Forces"),
        ("wheel_fl", "Wheel Speed FL", "km/h", 0.0, 160.0, "Wheel Speeds"),
        ("wheel_fr", "Wheel Speed FR", "km/h", 0.0, 160.0, "Wheel Speeds"),
        ("wheel_rl", "Wheel Speed RL", "km/h", 0.0, 160.0, "Wheel Speeds"),
        ("wheel_rr", "Wheel Speed RR", "km/h", 0.0, 160.0, "Wheel Speeds"),
        ("battery_voltage", "Battery Voltage", "V", 10.0, 15.0, "Electrical"),
    ];

    CHANNELS
        .iter()
        .map(|&(id, name, unit, min, max, group)| ChannelInfo {
            id: id.into(),
            name: name.into(),
            unit: unit.into(),
            min,
            max,
            group: group.into(),
        })
        .collect()
}

/// Smooth lap-like signals with gaussian noise
pub struct SimulatedSource {
    rng: Mutex<StdRng>,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    fn frame(&self, t: f64, unix_ts: f64) -> TelemetryFrame {
        let mut rng = self.rng.lock();
        let mut noise = |sigma: f64| gauss(&mut *rng, sigma);

        let phase = (t * 0.3).sin() * 0.5 + 0.5;
        let speed = 40.0 + phase * 100.0;
        let rpm = 3000.0 + phase * 9000.0;

        let channels = [
            ("speed", round(speed + noise(2.0), 1)),
            ("rpm", round(rpm + noise(200.0), 0)),
            ("throttle", round((phase * 100.0 + noise(5.0)).clamp(0.0, 100.0), 1)),
            ("brake_pressure", round(((1.0 - phase) * 80.0 + noise(3.0)).max(0.0), 1)),
            ("coolant_temp", round(85.0 + (t * 0.1).sin() * 10.0 + noise(1.0), 1)),
            ("oil_temp", round(95.0 + (t * 0.08).sin() * 15.0 + noise(1.0), 1)),
            ("intake_temp", round(35.0 + (t * 0.05).sin() * 8.0 + noise(0.5), 1)),
            ("exhaust_temp", round(400.0 + phase * 350.0 + noise(15.0), 1)),
            ("g_lateral", round((t * 0.7).sin() * 1.8 + noise(0.1), 2)),
            ("g_longitudinal", round((t * 0.5).cos() * 1.5 + noise(0.1), 2)),
            ("wheel_fl", round(speed + noise(1.5), 1)),
            ("wheel_fr", round(speed + noise(1.5), 1)),
            ("wheel_rl", round(speed * 0.98 + noise(1.5), 1)),
            ("wheel_rr", round(speed * 0.98 + noise(1.5), 1)),
            ("battery_voltage", round(12.6 + (t * 0.2).sin() * 0.5 + noise(0.05), 2)),
        ];

        TelemetryFrame {
            timestamp: unix_ts,
            source: self.name().to_string(),
            channels: channels
                .into_iter()
                .map(|(id, value)| (id.to_string(), value))
                .collect(),
        }
    }
}

// Box-Muller
fn gauss<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos() * sigma
}

fn round(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}
