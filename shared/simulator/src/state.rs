use crate::geometry::Vec2;
use nalgebra::vector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type BoatId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RacePhase {
    Prestart,
    Running,
    Finished,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceMeta {
    pub race_id: String,
    pub course_name: String,
    pub created_at: i64,
    pub seed: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wind {
    pub direction_deg: f64,
    pub speed: f64,
}

/// Static layout parameters for the puff/lull field.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindFieldConfig {
    /// Maximum relative speed change (0.2 = ±20 %).
    pub intensity: f64,
    pub blob_count: u32,
    /// Mean blob radius in world units.
    pub blob_size: f64,
    /// Side length of the square area the blobs are scattered over.
    pub domain_size: f64,
    /// Fraction of the true wind speed at which blobs drift downwind.
    pub advection_factor: f64,
}

impl Default for WindFieldConfig {
    fn default() -> Self {
        Self {
            intensity: 0.2,
            blob_count: 12,
            blob_size: 180.0,
            domain_size: 2400.0,
            advection_factor: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartLine {
    pub pin: Vec2,
    pub committee: Vec2,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub left: Vec2,
    pub right: Vec2,
}

impl Gate {
    pub fn midpoint(&self) -> Vec2 {
        (self.left + self.right) * 0.5
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoatState {
    pub id: BoatId,
    pub name: String,
    pub color: u32,
    pub pos: Vec2,
    pub prev_pos: Option<Vec2>,
    pub heading_deg: f64,
    pub desired_heading_deg: f64,
    pub speed: f64,
    pub wake_factor: f64,
    pub lap: u32,
    pub next_mark_index: usize,
    pub in_mark_zone: bool,
    pub finished: bool,
    pub finish_time: Option<f64>,
    pub distance_to_next_mark: f64,
    pub penalties: u32,
    /// Portion of `penalties` awarded through upheld protests.
    pub protest_penalties: u32,
    pub stall_timer: f64,
    pub tack_timer: f64,
    pub over_early: bool,
    pub fouled: bool,
    pub last_input_seq: u64,
    /// Wall-clock milliseconds of the tick that consumed `last_input_seq`.
    pub last_input_applied_at: i64,
    pub rights_suspended: bool,
    pub vmg_mode: bool,
    /// Degrees left in an in-progress penalty spin, signed by turn direction.
    pub spin_remaining_deg: f64,
}

impl BoatState {
    pub fn new(
        id: impl Into<BoatId>,
        name: impl Into<String>,
        color: u32,
        pos: Vec2,
        heading_deg: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color,
            pos,
            prev_pos: None,
            heading_deg,
            desired_heading_deg: heading_deg,
            speed: 0.0,
            wake_factor: 1.0,
            lap: 0,
            next_mark_index: 0,
            in_mark_zone: false,
            finished: false,
            finish_time: None,
            distance_to_next_mark: 0.0,
            penalties: 0,
            protest_penalties: 0,
            stall_timer: 0.0,
            tack_timer: 0.0,
            over_early: false,
            fouled: false,
            last_input_seq: 0,
            last_input_applied_at: 0,
            rights_suspended: false,
            vmg_mode: false,
            spin_remaining_deg: 0.0,
        }
    }

    pub fn is_spinning(&self) -> bool {
        self.spin_remaining_deg != 0.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protest {
    pub protestor_id: BoatId,
    pub protested_id: BoatId,
    pub rule_id: String,
    pub filed_at: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StartSignal,
    Penalty,
    RuleHint,
    GeneralRecall,
    Finish,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceEvent {
    pub event_id: u64,
    pub t: f64,
    pub kind: EventKind,
    pub rule_id: Option<String>,
    pub boats: Vec<BoatId>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceState {
    pub t: f64,
    pub meta: RaceMeta,
    pub wind: Wind,
    pub baseline_wind_deg: f64,
    pub wind_field: Option<WindFieldConfig>,
    /// Index 0 is the windward mark.
    pub marks: Vec<Vec2>,
    pub start_line: StartLine,
    pub leeward_gate: Gate,
    pub phase: RacePhase,
    pub countdown_armed: bool,
    pub clock_start_ms: Option<i64>,
    pub laps_to_finish: u32,
    pub boats: BTreeMap<BoatId, BoatState>,
    pub protests: BTreeMap<BoatId, Protest>,
    pub leaderboard: Vec<BoatId>,
}

impl RaceState {
    /// Windward/leeward course: windward mark upwind of a leeward gate,
    /// start line below the gate. Wind from the north.
    pub fn windward_leeward(race_id: &str, seed: u32) -> Self {
        let gate = Gate {
            left: vector![-60.0, 0.0],
            right: vector![60.0, 0.0],
        };
        RaceState {
            t: 0.0,
            meta: RaceMeta {
                race_id: race_id.to_string(),
                course_name: "windward-leeward".to_string(),
                created_at: 0,
                seed,
            },
            wind: Wind {
                direction_deg: 0.0,
                speed: 12.0,
            },
            baseline_wind_deg: 0.0,
            wind_field: None,
            marks: vec![vector![0.0, -900.0], gate.midpoint()],
            start_line: StartLine {
                pin: vector![-200.0, 150.0],
                committee: vector![200.0, 150.0],
            },
            leeward_gate: gate,
            phase: RacePhase::Prestart,
            countdown_armed: false,
            clock_start_ms: None,
            laps_to_finish: 2,
            boats: BTreeMap::new(),
            protests: BTreeMap::new(),
            leaderboard: vec![],
        }
    }

    pub fn wind_shift_deg(&self) -> f64 {
        crate::geometry::wrap_deg(self.wind.direction_deg - self.baseline_wind_deg)
    }

    pub fn hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::Hasher;
        let fixedpoint = |v: f64| (v * 1e9) as i64;
        let mut s = DefaultHasher::new();
        s.write_i64(fixedpoint(self.t));
        s.write_i64(fixedpoint(self.wind.direction_deg));
        s.write_i64(fixedpoint(self.wind.speed));
        for boat in self.boats.values() {
            s.write(boat.id.as_bytes());
            s.write_i64(fixedpoint(boat.pos.x));
            s.write_i64(fixedpoint(boat.pos.y));
            s.write_i64(fixedpoint(boat.heading_deg));
            s.write_i64(fixedpoint(boat.speed));
            s.write_u32(boat.lap);
            s.write_usize(boat.next_mark_index);
            s.write_u32(boat.penalties);
            s.write_u8(boat.over_early as u8);
        }
        for id in self.leaderboard.iter() {
            s.write(id.as_bytes());
        }
        s.finish()
    }
}
