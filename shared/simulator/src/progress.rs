//! Course progress, leaderboard ordering and start-line (OCS) tracking.

use crate::config::ProtestRanking;
use crate::geometry::{cross, upwind_vector};
use crate::state::{BoatId, BoatState, RacePhase, RaceState};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Rounding radius for marks without a line-crossing test.
pub const MARK_DISTANCE_THRESHOLD: f64 = 30.0;
pub const MARK_ZONE_RADIUS: f64 = 60.0;
/// Course index of the leeward gate (the midpoint of `leeward_gate`).
pub const LEEWARD_GATE_MARK_INDEX: usize = 1;

fn crossed_next_mark(state: &RaceState, boat: &BoatState, index: usize) -> bool {
    let mark = state.marks[index];
    let prev = boat.prev_pos;
    match index {
        0 => prev.map_or(false, |p| p.y > mark.y && boat.pos.y <= mark.y),
        LEEWARD_GATE_MARK_INDEX => {
            let gate_y = state.leeward_gate.midpoint().y;
            prev.map_or(false, |p| p.y < gate_y && boat.pos.y >= gate_y)
        }
        _ => (boat.pos - mark).magnitude() <= MARK_DISTANCE_THRESHOLD,
    }
}

/// Advances marks, laps and finishes. Returns boats that finished this call.
pub fn update_progress(state: &mut RaceState) -> Vec<BoatId> {
    let mark_count = state.marks.len();
    if mark_count == 0 {
        return vec![];
    }
    let racing = state.phase == RacePhase::Running;
    let t = state.t;
    let mut rounded: Vec<(BoatId, bool)> = vec![];
    for boat in state.boats.values() {
        if boat.finished {
            continue;
        }
        let index = boat.next_mark_index % mark_count;
        rounded.push((boat.id.clone(), racing && crossed_next_mark(state, boat, index)));
    }

    let mut finished = vec![];
    for (id, crossed) in rounded {
        let laps_to_finish = state.laps_to_finish;
        let marks = &state.marks;
        let Some(boat) = state.boats.get_mut(&id) else {
            continue;
        };
        let mut index = boat.next_mark_index % mark_count;
        let mut lap_completed = false;
        if crossed {
            index = (index + 1) % mark_count;
            if index == 0 {
                boat.lap += 1;
                lap_completed = true;
                log::debug!("{} completed lap {}", boat.id, boat.lap);
            }
        }
        boat.next_mark_index = index;
        if lap_completed && boat.lap >= laps_to_finish {
            boat.finished = true;
            boat.finish_time = Some(t);
            boat.distance_to_next_mark = 0.0;
            boat.in_mark_zone = false;
            finished.push(id);
            continue;
        }
        boat.distance_to_next_mark = (boat.pos - marks[index]).magnitude();
        boat.in_mark_zone = boat.distance_to_next_mark < MARK_ZONE_RADIUS;
    }
    finished
}

fn penalized(boat: &BoatState, ranking: ProtestRanking) -> bool {
    let penalties = match ranking {
        ProtestRanking::Counted => boat.penalties,
        ProtestRanking::Ignored => boat.penalties.saturating_sub(boat.protest_penalties),
    };
    penalties > 0 || boat.over_early
}

/// Total order used for the leaderboard, best first.
pub fn compare_boats(a: &BoatState, b: &BoatState, ranking: ProtestRanking) -> Ordering {
    b.finished
        .cmp(&a.finished)
        .then_with(|| match (a.finish_time, b.finish_time) {
            (Some(x), Some(y)) if a.finished && b.finished => {
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            _ => Ordering::Equal,
        })
        .then_with(|| penalized(a, ranking).cmp(&penalized(b, ranking)))
        .then_with(|| b.lap.cmp(&a.lap))
        .then_with(|| b.next_mark_index.cmp(&a.next_mark_index))
        .then_with(|| {
            a.distance_to_next_mark
                .partial_cmp(&b.distance_to_next_mark)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.id.cmp(&b.id))
}

pub fn leaderboard(state: &RaceState, ranking: ProtestRanking) -> Vec<BoatId> {
    let mut boats: Vec<&BoatState> = state.boats.values().collect();
    boats.sort_by(|a, b| compare_boats(a, b, ranking));
    boats.into_iter().map(|b| b.id.clone()).collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartLineEvent {
    OverEarly(BoatId),
    Cleared(BoatId),
    StartSignal,
    GeneralRecall(Vec<BoatId>),
}

/// Per-race OCS bookkeeping around the start signal.
#[derive(Clone, Debug)]
pub struct StartLineTracker {
    course_side: Option<f64>,
    ocs: BTreeSet<BoatId>,
    gun_fired: bool,
}

impl StartLineTracker {
    pub fn new() -> Self {
        Self {
            course_side: None,
            ocs: BTreeSet::new(),
            gun_fired: false,
        }
    }

    pub fn reset(&mut self) {
        *self = StartLineTracker::new();
    }

    pub fn gun_fired(&self) -> bool {
        self.gun_fired
    }

    pub fn ocs(&self) -> &BTreeSet<BoatId> {
        &self.ocs
    }

    /// Sign of the course side, fixed the first time it is asked for.
    fn course_side(&mut self, state: &RaceState) -> Option<f64> {
        if self.course_side.is_none() {
            let line = state.start_line.committee - state.start_line.pin;
            let side = cross(&line, &upwind_vector(state.wind.direction_deg));
            if line.magnitude() < 1e-9 || side.abs() < 1e-9 {
                return None;
            }
            self.course_side = Some(side.signum());
        }
        self.course_side
    }

    pub fn check(&mut self, state: &mut RaceState) -> Vec<StartLineEvent> {
        if self.gun_fired {
            return vec![];
        }
        let mut events = vec![];
        if state.t < 0.0 {
            let Some(sign) = self.course_side(state) else {
                return events;
            };
            let pin = state.start_line.pin;
            let line = state.start_line.committee - pin;
            for boat in state.boats.values_mut() {
                let on_course_side = cross(&line, &(boat.pos - pin)) * sign > 0.0;
                if on_course_side && !boat.over_early {
                    boat.over_early = true;
                    self.ocs.insert(boat.id.clone());
                    events.push(StartLineEvent::OverEarly(boat.id.clone()));
                } else if !on_course_side && boat.over_early {
                    boat.over_early = false;
                    self.ocs.remove(&boat.id);
                    events.push(StartLineEvent::Cleared(boat.id.clone()));
                }
            }
            return events;
        }

        self.gun_fired = true;
        if state.phase == RacePhase::Prestart {
            state.phase = RacePhase::Running;
        }
        if self.ocs.is_empty() {
            events.push(StartLineEvent::StartSignal);
        } else {
            events.push(StartLineEvent::GeneralRecall(self.ocs.iter().cloned().collect()));
        }
        self.ocs.clear();
        events
    }
}

impl Default for StartLineTracker {
    fn default() -> Self {
        StartLineTracker::new()
    }
}
