//! Synthetic sensor model.
//!
//! Values follow a slow orbit and a faster thermal cycle, with noise on top.

use clap::ValueEnum;
use lunar_bridge_core::TelemetryRecord;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

const ORBIT_STEP: f64 = 0.01;
const THERMAL_STEP: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Scenario {
    #[default]
    Nominal,
    /// Noisy gyros, twice the radiation scatter.
    Anomaly,
    /// Wider temperature swings.
    Eclipse,
}

/// Noise levels.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub gyro_noise: f64,
    pub accel_noise: f64,
    pub temp_variation: f64,
    pub radiation_base: f64,
    pub radiation_variation: f64,
}

impl Default for Baseline {
    fn default() -> Self {
        Self {
            gyro_noise: 0.1,
            accel_noise: 0.05,
            temp_variation: 2.0,
            radiation_base: 1000.0,
            radiation_variation: 50.0,
        }
    }
}

impl Baseline {
    pub fn for_scenario(scenario: Scenario) -> Self {
        let mut baseline = Self::default();
        match scenario {
            Scenario::Nominal => {}
            Scenario::Anomaly => {
                baseline.gyro_noise *= 3.0;
                baseline.radiation_variation *= 2.0;
            }
            Scenario::Eclipse => baseline.temp_variation *= 2.0,
        }
        baseline
    }
}

pub struct SensorModel {
    baseline: Baseline,
    orbit_phase: f64,
    thermal_cycle: f64,
}

impl SensorModel {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            baseline: Baseline::for_scenario(scenario),
            orbit_phase: 0.0,
            thermal_cycle: 0.0,
        }
    }

    pub fn orbit_phase(&self) -> f64 {
        self.orbit_phase
    }

    pub fn thermal_cycle(&self) -> f64 {
        self.thermal_cycle
    }

    /// Produce one record and advance the model.
    pub fn next(&mut self, rng: &mut impl Rng) -> TelemetryRecord {
        let record = self.sample(rng);
        self.orbit_phase += ORBIT_STEP;
        self.thermal_cycle += THERMAL_STEP;
        record
    }

    fn sample(&self, rng: &mut impl Rng) -> TelemetryRecord {
        let b = &self.baseline;
        let orbit = self.orbit_phase;
        let thermal = self.thermal_cycle;
        let radiation = 1.0 + 0.3 * (orbit * 2.0).sin();

        TelemetryRecord {
            icm_gyr_x: (orbit.sin() * 10.0 + noise(rng, b.gyro_noise) * 100.0) as i16,
            icm_gyr_y: (orbit.cos() * 8.0 + noise(rng, b.gyro_noise) * 100.0) as i16,
            icm_gyr_z: (noise(rng, b.gyro_noise) * 100.0) as i16,
            icm_acc_x: (noise(rng, b.accel_noise) * 1000.0) as i16,
            icm_acc_y: (noise(rng, b.accel_noise) * 1000.0) as i16,
            // slight residual acceleration
            icm_acc_z: ((0.001 + noise(rng, b.accel_noise)) * 1000.0) as i16,
            icm_temp: (-10.0 + 15.0 * thermal.sin() + noise(rng, b.temp_variation) * 10.0) as i16,
            mmc_mag_x: (-25000.0 + 5000.0 * orbit.sin()) as i32,
            mmc_mag_y: (15000.0 + 3000.0 * orbit.cos()) as i32,
            mmc_mag_z: (45000.0 + 2000.0 * (orbit * 0.7).sin()) as i32,
            mmc_temp: (-5.0 + 10.0 * (thermal + 0.5).sin() + noise(rng, b.temp_variation) * 10.0)
                as i16,
            rdn_serial_dose: (b.radiation_base * radiation + noise(rng, b.radiation_variation))
                as u32,
            rdn_sen1_dose: (b.radiation_base * radiation * 0.9 + noise(rng, b.radiation_variation))
                as u32,
            rdn_sen2_dose: (b.radiation_base * radiation * 1.1 + noise(rng, b.radiation_variation))
                as u32,
            rdn_serial_intensity: (100.0 + 20.0 * (orbit * 3.0).sin()) as u32,
            rdn_sen1_intensity: (95.0 + 18.0 * (orbit * 3.0 + 0.2).sin()) as u32,
            rdn_sen2_intensity: (105.0 + 22.0 * (orbit * 3.0 + 0.4).sin()) as u32,
            rdn_temp: (20.0 + 5.0 * (thermal + 1.0).sin() + noise(rng, 1.0) * 10.0) as i16,
            rdn_vdd: (3300.0 + noise(rng, 10.0)) as i16,
            rdn_crystal_ok: rng.gen_bool(0.99),
            rdn_analog_ok: rng.gen_bool(0.995),
            encoder_sensor: rng.gen_range(0..=255),
            hall_endstop: u8::from(rng.gen_bool(0.1)),
            reflective_endstop: u8::from(rng.gen_bool(0.05)),
            light_sensor: (1000.0 + 500.0 * orbit.sin() + noise(rng, 50.0)) as u16,
        }
    }
}

/// Zero-mean gaussian noise with standard deviation `sigma`.
fn noise(rng: &mut impl Rng, sigma: f64) -> f64 {
    match Normal::new(0.0, sigma) {
        Ok(normal) if sigma > 0.0 => normal.sample(rng),
        _ => 0.0,
    }
}

/// Format mission elapsed time as HH:MM:SS.
pub fn mission_clock(elapsed_secs: f64) -> String {
    let total = elapsed_secs.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Full orbits completed at a given phase.
pub fn orbits(phase: f64) -> u64 {
    (phase / (2.0 * PI)) as u64
}
