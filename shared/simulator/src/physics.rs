//! Boat motion: steering, polar speed curve, tack and stall timers, wind
//! shadow and penalty spins.

use crate::geometry::{heading_vector, normalize_deg, upwind_vector, wrap_deg, Vec2};
use crate::input::{PlayerInput, Steering};
use crate::rules::{get_tack, true_wind_angle, Tack};
use crate::state::{BoatId, BoatState, RaceState};
use crate::wind::WindField;
use nalgebra::vector;
use std::collections::BTreeMap;

/// World units travelled per second per knot of boat speed.
pub const SPEED_SCALE: f64 = 2.0;
pub const TURN_RATE_DEG_PER_SEC: f64 = 90.0;
pub const SPIN_RATE_DEG_PER_SEC: f64 = 120.0;
pub const TACK_SECONDS: f64 = 1.5;
pub const TACK_TURN_FACTOR: f64 = 0.6;
pub const TACK_SPEED_FACTOR: f64 = 0.6;
pub const SPIN_SPEED_FACTOR: f64 = 0.5;
pub const NO_GO_DEG: f64 = 30.0;
pub const SPEED_TAU_SECONDS: f64 = 2.0;
pub const WAKE_LENGTH: f64 = 120.0;
pub const WAKE_HALF_WIDTH: f64 = 30.0;
pub const WAKE_STRENGTH: f64 = 0.25;
pub const VMG_UPWIND_TWA: f64 = 45.0;
pub const VMG_DOWNWIND_TWA: f64 = 150.0;

const POLAR: &[(f64, f64)] = &[
    (0.0, 0.0),
    (30.0, 0.0),
    (35.0, 0.45),
    (45.0, 0.75),
    (60.0, 0.87),
    (80.0, 0.95),
    (100.0, 1.0),
    (120.0, 0.96),
    (140.0, 0.88),
    (160.0, 0.78),
    (180.0, 0.7),
];

/// Fraction of wind speed a boat reaches at the given true wind angle.
pub fn polar_speed_ratio(twa_deg: f64) -> f64 {
    let a = twa_deg.abs().min(180.0);
    for w in POLAR.windows(2) {
        let (a0, r0) = w[0];
        let (a1, r1) = w[1];
        if a <= a1 {
            return r0 + (r1 - r0) * (a - a0) / (a1 - a0);
        }
    }
    POLAR[POLAR.len() - 1].1
}

fn turn_toward(current: f64, target: f64, max_step: f64) -> f64 {
    let diff = wrap_deg(target - current);
    if diff.abs() <= max_step {
        normalize_deg(target)
    } else {
        normalize_deg(current + max_step * diff.signum())
    }
}

fn vmg_heading(boat: &BoatState, wind_deg: f64) -> f64 {
    let twa = true_wind_angle(boat.heading_deg, wind_deg);
    let target = if twa.abs() < 90.0 {
        VMG_UPWIND_TWA
    } else {
        VMG_DOWNWIND_TWA
    };
    normalize_deg(wind_deg + bear_away_sign(boat, wind_deg) * target)
}

fn bear_away_sign(boat: &BoatState, wind_deg: f64) -> f64 {
    match get_tack(boat.heading_deg, wind_deg) {
        Tack::Port => 1.0,
        Tack::Starboard => -1.0,
    }
}

fn apply_input(boat: &mut BoatState, input: &PlayerInput, wind_deg: f64) {
    if let Some(vmg) = input.vmg_mode {
        boat.vmg_mode = vmg;
    }
    if input.spin && !boat.is_spinning() {
        // Signed so the turn direction holds once the spin passes the wind.
        boat.spin_remaining_deg = 360.0 * bear_away_sign(boat, wind_deg);
        boat.rights_suspended = true;
    }
    if boat.is_spinning() {
        return;
    }
    match input.steering {
        Some(Steering::Desired(h)) => boat.desired_heading_deg = normalize_deg(h),
        Some(Steering::Delta(d)) => {
            boat.desired_heading_deg = normalize_deg(boat.desired_heading_deg + d)
        }
        Some(Steering::Absolute(h)) => {
            boat.heading_deg = normalize_deg(h);
            boat.desired_heading_deg = boat.heading_deg;
        }
        None => {}
    }
}

fn finish_spin(boat: &mut BoatState) {
    boat.spin_remaining_deg = 0.0;
    boat.rights_suspended = false;
    boat.penalties = boat.penalties.saturating_sub(1);
    boat.protest_penalties = boat.protest_penalties.min(boat.penalties);
    boat.desired_heading_deg = boat.heading_deg;
    log::debug!("{} completed a penalty turn", boat.id);
}

fn steer(boat: &mut BoatState, wind_deg: f64, dt: f64) {
    if boat.is_spinning() {
        let direction = boat.spin_remaining_deg.signum();
        let step = (SPIN_RATE_DEG_PER_SEC * dt).min(boat.spin_remaining_deg.abs());
        boat.heading_deg = normalize_deg(boat.heading_deg + direction * step);
        boat.spin_remaining_deg -= direction * step;
        if boat.spin_remaining_deg.abs() <= 1e-9 {
            finish_spin(boat);
        }
        return;
    }

    if boat.vmg_mode {
        boat.desired_heading_deg = vmg_heading(boat, wind_deg);
    }
    let rate = if boat.tack_timer > 0.0 {
        TURN_RATE_DEG_PER_SEC * TACK_TURN_FACTOR
    } else {
        TURN_RATE_DEG_PER_SEC
    };
    let before = get_tack(boat.heading_deg, wind_deg);
    boat.heading_deg = turn_toward(boat.heading_deg, boat.desired_heading_deg, rate * dt);
    let twa = true_wind_angle(boat.heading_deg, wind_deg);
    if get_tack(boat.heading_deg, wind_deg) != before && twa.abs() < 90.0 {
        boat.tack_timer = TACK_SECONDS;
    }
}

/// Speed multiplier from the wind shadow of boats upwind of `pos`.
pub fn wake_factor(pos: &Vec2, own_id: &str, others: &[(BoatId, Vec2)], wind_deg: f64) -> f64 {
    let downwind = -upwind_vector(wind_deg);
    let crosswind = vector![-downwind.y, downwind.x];
    let reduction = others
        .iter()
        .filter(|(id, _)| id != own_id)
        .map(|(_, other)| {
            let rel = pos - other;
            let along = rel.dot(&downwind);
            let across = rel.dot(&crosswind).abs();
            if along > 0.0 && along < WAKE_LENGTH && across < WAKE_HALF_WIDTH {
                WAKE_STRENGTH * (1.0 - along / WAKE_LENGTH) * (1.0 - across / WAKE_HALF_WIDTH)
            } else {
                0.0
            }
        })
        .fold(0.0, f64::max);
    1.0 - reduction
}

/// Advances every boat by `dt` seconds under the current wind.
pub fn step_race_state(
    state: &mut RaceState,
    inputs: &BTreeMap<BoatId, PlayerInput>,
    dt: f64,
    field: &mut WindField,
) {
    let wind_deg = state.wind.direction_deg;
    for boat in state.boats.values_mut() {
        if let Some(input) = inputs.get(&boat.id) {
            apply_input(boat, input, wind_deg);
        }
    }
    if dt <= 0.0 {
        return;
    }
    let positions: Vec<(BoatId, Vec2)> = state
        .boats
        .values()
        .map(|b| (b.id.clone(), b.pos))
        .collect();

    let gusts: Vec<f64> = positions
        .iter()
        .map(|(_, pos)| field.sample(state, pos))
        .collect();

    for (boat, gust) in state.boats.values_mut().zip(gusts) {
        steer(boat, wind_deg, dt);

        let twa = true_wind_angle(boat.heading_deg, wind_deg);
        if twa.abs() < NO_GO_DEG {
            boat.stall_timer += dt;
        } else {
            boat.stall_timer = (boat.stall_timer - dt).max(0.0);
        }
        boat.tack_timer = (boat.tack_timer - dt).max(0.0);

        boat.wake_factor = wake_factor(&boat.pos, &boat.id, &positions, wind_deg);
        let local_wind = state.wind.speed * (1.0 + gust);
        let mut target = local_wind * polar_speed_ratio(twa) * boat.wake_factor;
        if boat.tack_timer > 0.0 {
            target *= TACK_SPEED_FACTOR;
        }
        if boat.is_spinning() {
            target *= SPIN_SPEED_FACTOR;
        }
        let blend = 1.0 - (-dt / SPEED_TAU_SECONDS).exp();
        boat.speed = (boat.speed + (target - boat.speed) * blend).max(0.0);

        boat.prev_pos = Some(boat.pos);
        boat.pos += heading_vector(boat.heading_deg) * boat.speed * SPEED_SCALE * dt;
    }
}
