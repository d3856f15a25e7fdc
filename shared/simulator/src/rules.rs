//! Right-of-way evaluation: port/starboard, windward/leeward, the stern
//! rammer override and the downwind dead zone, with duplicate suppression.

use crate::geometry::{
    boat_circles, circle_penetration, circles_within, upwind_vector, wrap_deg, CirclePart,
    NEARBY_FACTOR,
};
use crate::state::{BoatId, BoatState, RaceState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Above this |TWA| tack is too unstable to decide right of way.
pub const DOWNWIND_DEAD_ZONE_DEG: f64 = 165.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuleId {
    /// Port gives way to starboard.
    #[serde(rename = "10")]
    PortStarboard,
    /// Windward gives way to leeward.
    #[serde(rename = "11")]
    WindwardLeeward,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::PortStarboard => "10",
            RuleId::WindwardLeeward => "11",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tack {
    Port,
    Starboard,
}

/// Heading relative to the wind, in (-180, 180].
pub fn true_wind_angle(heading_deg: f64, wind_deg: f64) -> f64 {
    wrap_deg(heading_deg - wind_deg)
}

/// Port for TWA >= 0, including exactly 0 and 180.
///
/// Near dead downwind a couple of degrees of heading flips the result; the
/// dead zone in [`RulesEngine`] keeps that from deciding right of way.
pub fn get_tack(heading_deg: f64, wind_deg: f64) -> Tack {
    if true_wind_angle(heading_deg, wind_deg) >= 0.0 {
        Tack::Port
    } else {
        Tack::Starboard
    }
}

fn any_circles(a: &BoatState, b: &BoatState, factor: f64) -> bool {
    let ca = boat_circles(&a.pos, a.heading_deg);
    let cb = boat_circles(&b.pos, b.heading_deg);
    ca.iter()
        .any(|(_, x)| cb.iter().any(|(_, y)| circles_within(x, y, factor)))
}

/// Any bow/stern circle pair overlaps.
pub fn too_close(a: &BoatState, b: &BoatState) -> bool {
    any_circles(a, b, 1.0)
}

/// Within the warning band around the collision radius.
pub fn nearby(a: &BoatState, b: &BoatState) -> bool {
    any_circles(a, b, NEARBY_FACTOR)
}

/// `a`'s bow circle overlaps `b`'s stern circle.
pub fn bow_hits_stern(a: &BoatState, b: &BoatState) -> bool {
    let ca = boat_circles(&a.pos, a.heading_deg);
    let cb = boat_circles(&b.pos, b.heading_deg);
    let bow = ca.iter().find(|(p, _)| *p == CirclePart::Bow).map(|(_, c)| c);
    let stern = cb.iter().find(|(p, _)| *p == CirclePart::Stern).map(|(_, c)| c);
    match (bow, stern) {
        (Some(bow), Some(stern)) => circle_penetration(bow, stern).is_some(),
        _ => false,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleViolation {
    pub offender_id: BoatId,
    /// Both boats of the incident, ordered by id.
    pub boats: [BoatId; 2],
    pub rule_id: RuleId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollisionOutcome {
    pub at_fault: BoatId,
    pub stand_on: BoatId,
}

struct Judgement<'a> {
    offender: &'a BoatState,
    stand_on: &'a BoatState,
    rule_id: RuleId,
}

fn judge<'a>(a: &'a BoatState, b: &'a BoatState, wind_deg: f64) -> Judgement<'a> {
    let twa_a = true_wind_angle(a.heading_deg, wind_deg);
    let twa_b = true_wind_angle(b.heading_deg, wind_deg);
    let dead_zone =
        twa_a.abs() > DOWNWIND_DEAD_ZONE_DEG || twa_b.abs() > DOWNWIND_DEAD_ZONE_DEG;
    let tack_a = get_tack(a.heading_deg, wind_deg);
    let tack_b = get_tack(b.heading_deg, wind_deg);

    if !dead_zone && tack_a != tack_b {
        let (offender, stand_on) = if tack_a == Tack::Port { (a, b) } else { (b, a) };
        return Judgement {
            offender,
            stand_on,
            rule_id: RuleId::PortStarboard,
        };
    }

    let a_rams = bow_hits_stern(a, b);
    let b_rams = bow_hits_stern(b, a);
    let (offender, stand_on) = if a_rams && !b_rams {
        (a, b)
    } else if b_rams && !a_rams {
        (b, a)
    } else {
        let upwind = upwind_vector(wind_deg);
        // Ties go against the first boat so the outcome stays deterministic.
        if a.pos.dot(&upwind) >= b.pos.dot(&upwind) {
            (a, b)
        } else {
            (b, a)
        }
    };
    Judgement {
        offender,
        stand_on,
        rule_id: RuleId::WindwardLeeward,
    }
}

fn violation(a: &BoatState, b: &BoatState, wind_deg: f64) -> Option<RuleViolation> {
    let j = judge(a, b, wind_deg);
    if j.stand_on.rights_suspended {
        return None;
    }
    let (first, second) = pair_key(&a.id, &b.id);
    Some(RuleViolation {
        offender_id: j.offender.id.clone(),
        boats: [first, second],
        rule_id: j.rule_id,
    })
}

fn pair_key(a: &str, b: &str) -> (BoatId, BoatId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn racing_pairs(state: &RaceState) -> Vec<(&BoatState, &BoatState)> {
    let boats: Vec<&BoatState> = state.boats.values().filter(|b| !b.finished).collect();
    let mut pairs = vec![];
    for (i, a) in boats.iter().enumerate() {
        for b in boats[i + 1..].iter() {
            pairs.push((*a, *b));
        }
    }
    pairs
}

/// Fault split for every overlapping pair, ignoring cooldowns.
///
/// A boat whose rights are suspended is at fault against a boat it would
/// otherwise hold right of way over.
pub fn collision_outcomes(state: &RaceState) -> Vec<CollisionOutcome> {
    let wind_deg = state.wind.direction_deg;
    racing_pairs(state)
        .into_iter()
        .filter(|(a, b)| too_close(a, b))
        .map(|(a, b)| {
            let j = judge(a, b, wind_deg);
            let (at_fault, stand_on) =
                if j.stand_on.rights_suspended && !j.offender.rights_suspended {
                    (j.stand_on, j.offender)
                } else {
                    (j.offender, j.stand_on)
                };
            CollisionOutcome {
                at_fault: at_fault.id.clone(),
                stand_on: stand_on.id.clone(),
            }
        })
        .collect()
}

#[derive(Clone, Copy, Debug)]
struct Incident {
    fired_at: f64,
    separated: bool,
}

/// Stateful evaluator owning the two cooldown tables.
#[derive(Clone, Debug)]
pub struct RulesEngine {
    cooldown_seconds: f64,
    offender_cooldown: HashMap<(BoatId, RuleId), f64>,
    incidents: HashMap<(BoatId, BoatId), Incident>,
}

impl RulesEngine {
    pub fn new(cooldown_seconds: f64) -> Self {
        Self {
            cooldown_seconds,
            offender_cooldown: HashMap::new(),
            incidents: HashMap::new(),
        }
    }

    pub fn cooldown_seconds(&self) -> f64 {
        self.cooldown_seconds
    }

    pub fn reset(&mut self) {
        self.offender_cooldown.clear();
        self.incidents.clear();
    }

    pub fn forget_boat(&mut self, id: &str) {
        self.offender_cooldown.retain(|(offender, _), _| offender != id);
        self.incidents.retain(|(a, b), _| a != id && b != id);
    }

    /// True while a penalised pair has not yet both separated and waited out
    /// the cooldown.
    pub fn under_incident_cooldown(&self, a: &str, b: &str) -> bool {
        self.incidents.contains_key(&pair_key(a, b))
    }

    fn update_incidents(&mut self, state: &RaceState) {
        let t = state.t;
        let cooldown = self.cooldown_seconds;
        self.incidents.retain(|(a, b), incident| {
            let (Some(boat_a), Some(boat_b)) = (state.boats.get(a), state.boats.get(b)) else {
                return false;
            };
            if !nearby(boat_a, boat_b) {
                incident.separated = true;
            }
            !(incident.separated && t - incident.fired_at >= cooldown)
        });
    }

    /// Violations that should be penalised this tick.
    pub fn evaluate(&mut self, state: &RaceState) -> Vec<RuleViolation> {
        self.update_incidents(state);
        let t = state.t;
        let wind_deg = state.wind.direction_deg;
        let mut fired = vec![];
        for (a, b) in racing_pairs(state) {
            if !too_close(a, b) {
                continue;
            }
            let Some(v) = violation(a, b, wind_deg) else {
                continue;
            };
            let pair = pair_key(&a.id, &b.id);
            if self.incidents.contains_key(&pair) {
                continue;
            }
            let offender_key = (v.offender_id.clone(), v.rule_id);
            if let Some(&last) = self.offender_cooldown.get(&offender_key) {
                if t - last < self.cooldown_seconds {
                    log::debug!(
                        "Suppressed rule {} by {} (offender cooldown)",
                        v.rule_id.as_str(),
                        v.offender_id
                    );
                    continue;
                }
            }
            self.offender_cooldown.insert(offender_key, t);
            self.incidents.insert(
                pair,
                Incident {
                    fired_at: t,
                    separated: false,
                },
            );
            log::debug!(
                "Rule {} violation by {} against {:?} at t={t:.2}",
                v.rule_id.as_str(),
                v.offender_id,
                v.boats
            );
            fired.push(v);
        }
        fired
    }

    /// Would-be offenders in pairs that are close but not yet touching.
    pub fn compute_warnings(&self, state: &RaceState) -> BTreeSet<BoatId> {
        let wind_deg = state.wind.direction_deg;
        racing_pairs(state)
            .into_iter()
            .filter(|(a, b)| nearby(a, b) && !too_close(a, b))
            .filter(|(a, b)| !self.under_incident_cooldown(&a.id, &b.id))
            .filter_map(|(a, b)| violation(a, b, wind_deg))
            .map(|v| v.offender_id)
            .collect()
    }
}
