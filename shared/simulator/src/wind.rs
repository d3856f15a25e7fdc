//! Wind model: a seeded oscillation of the mean wind and a static field of
//! puffs and lulls drifting downwind.

use crate::config::SimConfig;
use crate::geometry::{normalize_deg, upwind_vector, Vec2};
use crate::physics::SPEED_SCALE;
use crate::rng::{new_rng, SeededRng};
use crate::state::{RaceState, WindFieldConfig};
use nalgebra::vector;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

/// Slow drift of wind direction and speed around the baseline.
#[derive(Clone, Debug)]
pub struct WindOscillator {
    rng: Option<(u32, SeededRng)>,
    cycle_elapsed: f64,
    shift_deg: f64,
    speed_delta: f64,
    target_shift_deg: f64,
    target_speed_delta: f64,
}

impl WindOscillator {
    pub fn new() -> Self {
        Self {
            rng: None,
            cycle_elapsed: 0.0,
            shift_deg: 0.0,
            speed_delta: 0.0,
            target_shift_deg: 0.0,
            target_speed_delta: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = WindOscillator::new();
    }

    pub fn target_shift_deg(&self) -> f64 {
        self.target_shift_deg
    }

    pub fn apply(&mut self, state: &mut RaceState, dt: f64, config: &SimConfig) {
        if config.fixed_wind {
            state.wind.direction_deg = normalize_deg(state.baseline_wind_deg);
            state.wind.speed = config.baseline_wind_speed;
            return;
        }

        let osc = &config.oscillation;
        let seed = state.meta.seed;
        let fresh = !matches!(&self.rng, Some((s, _)) if *s == seed);
        if fresh {
            self.rng = Some((seed, new_rng(seed, "wind-oscillation")));
            self.cycle_elapsed = 0.0;
        } else {
            self.cycle_elapsed += dt;
        }

        if fresh || self.cycle_elapsed >= osc.cycle_seconds {
            if !fresh {
                self.cycle_elapsed -= osc.cycle_seconds.max(0.0);
            }
            let shift = osc.shift_range_deg.abs();
            let speed = osc.speed_range.abs();
            match self.rng.as_mut() {
                Some((_, rng)) if shift.is_finite() && speed.is_finite() => {
                    self.target_shift_deg = Uniform::new_inclusive(-shift, shift).sample(rng);
                    self.target_speed_delta = Uniform::new_inclusive(-speed, speed).sample(rng);
                }
                Some(_) => log::warn!("Skipping wind shift draw, ranges {shift} and {speed}"),
                None => {}
            }
        }

        let blend = if osc.settle_seconds > 0.0 {
            1.0 - (-dt / osc.settle_seconds).exp()
        } else {
            1.0
        };
        self.shift_deg += (self.target_shift_deg - self.shift_deg) * blend;
        self.speed_delta += (self.target_speed_delta - self.speed_delta) * blend;

        state.wind.direction_deg = normalize_deg(state.baseline_wind_deg + self.shift_deg);
        state.wind.speed = (config.baseline_wind_speed + self.speed_delta).max(0.0);
    }
}

impl Default for WindOscillator {
    fn default() -> Self {
        WindOscillator::new()
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Blob {
    along: f64,
    across: f64,
    radius_along: f64,
    radius_across: f64,
    amplitude: f64,
}

fn smoothstep(x: f64) -> f64 {
    let x = x.clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

fn wrap_centered(x: f64, period: f64) -> f64 {
    let half = period * 0.5;
    (x + half).rem_euclid(period) - half
}

/// Puff/lull field, sampled as a relative speed change at a position.
pub struct WindField {
    key: Option<String>,
    blobs: Vec<Blob>,
}

impl WindField {
    pub fn new() -> Self {
        Self {
            key: None,
            blobs: vec![],
        }
    }

    pub fn reset(&mut self) {
        self.key = None;
        self.blobs.clear();
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    fn generate(seed: u32, config: &WindFieldConfig) -> Vec<Blob> {
        let usable = |v: f64| v.is_finite() && v > 0.0;
        if !usable(config.domain_size)
            || !usable(config.blob_size)
            || !usable(config.intensity)
            || !config.advection_factor.is_finite()
        {
            log::warn!("Wind field disabled by unusable layout {config:?}");
            return vec![];
        }
        let mut rng = new_rng(seed, "wind-field");
        let half = config.domain_size * 0.5;
        let size = match Normal::new(config.blob_size, config.blob_size * 0.25) {
            Ok(size) => size,
            Err(e) => {
                log::warn!("Bad wind field blob size {}: {e}", config.blob_size);
                return vec![];
            }
        };
        let min_size = config.blob_size * 0.25;
        (0..config.blob_count)
            .map(|_| {
                let radius = size.sample(&mut rng).max(min_size);
                Blob {
                    along: rng.gen_range(-half..half),
                    across: rng.gen_range(-half..half),
                    // Gusts stretch downwind.
                    radius_along: radius * 1.5,
                    radius_across: radius,
                    amplitude: rng.gen_range(-config.intensity..=config.intensity),
                }
            })
            .collect()
    }

    fn refresh(&mut self, seed: u32, config: &WindFieldConfig) -> bool {
        let key = match serde_json::to_string(&(seed, config)) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("Unable to key wind field layout: {e}");
                return false;
            }
        };
        if self.key.as_deref() != Some(key.as_str()) {
            log::debug!("Regenerating wind field for seed {seed}");
            self.blobs = WindField::generate(seed, config);
            self.key = Some(key);
        }
        true
    }

    /// Relative speed change at `pos`, within ±intensity. Zero without a field.
    pub fn sample(&mut self, state: &RaceState, pos: &Vec2) -> f64 {
        let Some(config) = state.wind_field.as_ref() else {
            return 0.0;
        };
        if !self.refresh(state.meta.seed, config) || self.blobs.is_empty() {
            return 0.0;
        }

        let downwind = -upwind_vector(state.wind.direction_deg);
        let crosswind = vector![-downwind.y, downwind.x];
        let drift = config.advection_factor * state.wind.speed * SPEED_SCALE * state.t;
        let along = pos.dot(&downwind) - drift;
        let across = pos.dot(&crosswind);

        let total: f64 = self
            .blobs
            .iter()
            .map(|blob| {
                let da = wrap_centered(along - blob.along, config.domain_size);
                let dc = across - blob.across;
                let fa = smoothstep(1.0 - da.abs() / blob.radius_along);
                let fc = smoothstep(1.0 - dc.abs() / blob.radius_across);
                blob.amplitude * fa * fc
            })
            .sum();
        total.clamp(-config.intensity, config.intensity)
    }
}

impl Default for WindField {
    fn default() -> Self {
        WindField::new()
    }
}
