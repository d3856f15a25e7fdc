//! Capsule-circle collision resolution between boats, and between boats and
//! the fixed mark colliders.

use crate::geometry::{
    boat_circles, circle_penetration, Vec2, BOAT_BOW_OFFSET, BOAT_BOW_RADIUS, BOAT_STERN_OFFSET,
    BOAT_STERN_RADIUS,
};
use crate::progress::LEEWARD_GATE_MARK_INDEX;
use crate::rules::CollisionOutcome;
use crate::state::{BoatId, BoatState, RaceState};
use nalgebra::vector;
use rapier2d_f64::parry::query;
use rapier2d_f64::prelude::*;
use std::collections::{BTreeMap, HashMap};

pub const MARK_COLLIDER_RADIUS: f64 = 6.0;
pub const GATE_COLLIDER_RADIUS: f64 = 10.0;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoatCollisions {
    /// Corrected position for every boat, moved or not.
    pub positions: BTreeMap<BoatId, Vec2>,
    /// Overlapping pairs, each ordered by id.
    pub collided: Vec<(BoatId, BoatId)>,
}

fn push_shares(a: &str, b: &str, outcomes: Option<&[CollisionOutcome]>) -> (f64, f64) {
    let outcome = outcomes.and_then(|outcomes| {
        outcomes.iter().find(|o| {
            (o.at_fault == a && o.stand_on == b) || (o.at_fault == b && o.stand_on == a)
        })
    });
    match outcome {
        Some(o) if o.at_fault == a => (1.0, 0.0),
        Some(_) => (0.0, 1.0),
        None => (0.5, 0.5),
    }
}

/// Pushes overlapping boats apart.
///
/// Without fault information each penetration is split evenly; with it the
/// boat at fault takes the whole correction and the stand-on boat holds its
/// course.
pub fn resolve_boat_collisions(
    boats: &BTreeMap<BoatId, BoatState>,
    outcomes: Option<&[CollisionOutcome]>,
) -> BoatCollisions {
    let list: Vec<&BoatState> = boats.values().collect();
    let mut pushes: Vec<Vec2> = vec![Vec2::zeros(); list.len()];
    let mut collided = vec![];

    for i in 0..list.len() {
        for j in (i + 1)..list.len() {
            let (a, b) = (list[i], list[j]);
            let ca = boat_circles(&a.pos, a.heading_deg);
            let cb = boat_circles(&b.pos, b.heading_deg);
            let (share_a, share_b) = push_shares(&a.id, &b.id, outcomes);
            let mut hit = false;
            for (_, x) in ca.iter() {
                for (_, y) in cb.iter() {
                    if let Some(p) = circle_penetration(x, y) {
                        pushes[i] += p * share_a;
                        pushes[j] -= p * share_b;
                        hit = true;
                    }
                }
            }
            if hit {
                collided.push((a.id.clone(), b.id.clone()));
            }
        }
    }

    BoatCollisions {
        positions: list
            .iter()
            .zip(pushes)
            .map(|(boat, push)| (boat.id.clone(), boat.pos + push))
            .collect(),
        collided,
    }
}

struct BoatBody {
    body: RigidBodyHandle,
    circles: [ColliderHandle; 2],
}

/// Physics-library world holding fixed mark colliders and a kinematic body
/// per boat. Rebuilt whenever the mark layout changes.
pub struct MarkColliders {
    layout_hash: Option<u64>,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    island_manager: IslandManager,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    marks: Vec<ColliderHandle>,
    boats: HashMap<BoatId, BoatBody>,
}

fn layout_hash(state: &RaceState) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;
    let fixedpoint = |v: f64| (v * 1e6) as i64;
    let mut s = DefaultHasher::new();
    s.write_usize(state.marks.len());
    for p in state
        .marks
        .iter()
        .chain([state.leeward_gate.left, state.leeward_gate.right].iter())
    {
        s.write_i64(fixedpoint(p.x));
        s.write_i64(fixedpoint(p.y));
    }
    s.finish()
}

impl MarkColliders {
    pub fn new() -> Self {
        Self {
            layout_hash: None,
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            island_manager: IslandManager::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            marks: vec![],
            boats: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = MarkColliders::new();
    }

    pub fn mark_count(&self) -> usize {
        self.marks.len()
    }

    pub fn boat_count(&self) -> usize {
        self.boats.len()
    }

    fn rebuild(&mut self, state: &RaceState, hash: u64) {
        log::debug!("Rebuilding mark colliders for {} marks", state.marks.len());
        self.reset();
        let gate = [state.leeward_gate.left, state.leeward_gate.right];
        // The leeward gate course mark is the gap between the gate marks.
        let fixed = state
            .marks
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != LEEWARD_GATE_MARK_INDEX)
            .map(|(_, p)| (*p, MARK_COLLIDER_RADIUS))
            .chain(gate.iter().map(|p| (*p, GATE_COLLIDER_RADIUS)));
        for (p, radius) in fixed {
            let collider = ColliderBuilder::ball(radius)
                .translation(vector![p.x, p.y])
                .build();
            self.marks.push(self.colliders.insert(collider));
        }
        self.layout_hash = Some(hash);
    }

    fn add_boat(&mut self, id: &BoatId) {
        let body = self
            .bodies
            .insert(RigidBodyBuilder::kinematic_position_based().build());
        let bow = ColliderBuilder::ball(BOAT_BOW_RADIUS)
            .translation(vector![0.0, -BOAT_BOW_OFFSET])
            .build();
        let stern = ColliderBuilder::ball(BOAT_STERN_RADIUS)
            .translation(vector![0.0, BOAT_STERN_OFFSET])
            .build();
        let bow = self
            .colliders
            .insert_with_parent(bow, body, &mut self.bodies);
        let stern = self
            .colliders
            .insert_with_parent(stern, body, &mut self.bodies);
        self.boats.insert(
            id.clone(),
            BoatBody {
                body,
                circles: [bow, stern],
            },
        );
    }

    fn remove_boat(&mut self, id: &BoatId) {
        if let Some(boat) = self.boats.remove(id) {
            self.bodies.remove(
                boat.body,
                &mut self.island_manager,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                true,
            );
        }
    }

    /// Mirrors the mark layout and boat poses into the collision world.
    pub fn sync(&mut self, state: &RaceState) {
        let hash = layout_hash(state);
        if self.layout_hash != Some(hash) {
            self.rebuild(state, hash);
        }

        let stale: Vec<BoatId> = self
            .boats
            .keys()
            .filter(|id| !state.boats.contains_key(*id))
            .cloned()
            .collect();
        for id in stale.iter() {
            self.remove_boat(id);
        }

        for boat in state.boats.values() {
            if !self.boats.contains_key(&boat.id) {
                self.add_boat(&boat.id);
            }
            let handle = self.boats[&boat.id].body;
            if let Some(body) = self.bodies.get_mut(handle) {
                body.set_position(
                    Isometry::new(
                        vector![boat.pos.x, boat.pos.y],
                        boat.heading_deg.to_radians(),
                    ),
                    true,
                );
            }
        }
    }

    /// Push that moves each overlapping boat clear of every mark.
    ///
    /// A failed contact query leaves that boat uncorrected for the tick.
    pub fn resolve(&mut self, state: &RaceState) -> BTreeMap<BoatId, Vec2> {
        self.sync(state);
        let mut pushes = BTreeMap::new();
        for (id, boat) in self.boats.iter() {
            let Some(body) = self.bodies.get(boat.body) else {
                continue;
            };
            let mut push = Vec2::zeros();
            'circles: for handle in boat.circles.iter() {
                let Some(circle) = self.colliders.get(*handle) else {
                    continue;
                };
                let Some(local) = circle.position_wrt_parent() else {
                    continue;
                };
                let world = body.position() * local;
                for mark in self.marks.iter() {
                    let Some(mark) = self.colliders.get(*mark) else {
                        continue;
                    };
                    match query::contact(&world, circle.shape(), mark.position(), mark.shape(), 0.0)
                    {
                        Ok(Some(contact)) if contact.dist < 0.0 => {
                            let n = contact.normal1.into_inner();
                            push += vector![n.x, n.y] * contact.dist;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("Mark contact query failed for {id}: {e:?}");
                            push = Vec2::zeros();
                            break 'circles;
                        }
                    }
                }
            }
            if push != Vec2::zeros() {
                pushes.insert(id.clone(), push);
            }
        }
        pushes
    }
}

impl Default for MarkColliders {
    fn default() -> Self {
        MarkColliders::new()
    }
}
