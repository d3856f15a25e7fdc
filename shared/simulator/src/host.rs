//! Fixed-rate tick orchestration. The host is the only writer of
//! [`RaceState`]: each tick works on a private copy and publishes it whole.

use crate::collision::{resolve_boat_collisions, MarkColliders};
use crate::config::SimConfig;
use crate::error::Error;
use crate::geometry::normalize_deg;
use crate::input::{InputMailbox, InputSender, PlayerInput};
use crate::physics::step_race_state;
use crate::progress::{leaderboard, update_progress, StartLineEvent, StartLineTracker};
use crate::protest;
use crate::rules::{collision_outcomes, CollisionOutcome, RulesEngine};
use crate::state::{BoatId, BoatState, EventKind, RaceEvent, RacePhase, RaceState, Wind};
use crate::wind::{WindField, WindOscillator};
use instant::Instant;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Rule id attached to OCS events.
pub const OCS_RULE_ID: &str = "29";

pub type TickCallback = Box<dyn FnMut(&RaceState, &[RaceEvent]) + Send>;
pub type EventsCallback = Box<dyn FnMut(&[RaceEvent]) + Send>;

pub trait Clock: Send {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Engine memory carried from tick to tick. A tick runs against a copy that
/// is only kept if the tick publishes.
#[derive(Clone, Debug)]
struct TickEngines {
    rules: RulesEngine,
    wind: WindOscillator,
    start_line: StartLineTracker,
    warned: BTreeSet<BoatId>,
    next_event_id: u64,
}

impl TickEngines {
    fn new(cooldown_seconds: f64) -> Self {
        Self {
            rules: RulesEngine::new(cooldown_seconds),
            wind: WindOscillator::new(),
            start_line: StartLineTracker::new(),
            warned: BTreeSet::new(),
            next_event_id: 1,
        }
    }

    fn event(
        &mut self,
        t: f64,
        kind: EventKind,
        rule_id: Option<&str>,
        boats: Vec<BoatId>,
        message: String,
    ) -> RaceEvent {
        let event = RaceEvent {
            event_id: self.next_event_id,
            t,
            kind,
            rule_id: rule_id.map(|r| r.to_string()),
            boats,
            message,
        };
        self.next_event_id += 1;
        event
    }
}

fn ensure_finite(state: &RaceState) -> Result<(), Error> {
    if !state.t.is_finite() || !state.wind.direction_deg.is_finite() || !state.wind.speed.is_finite()
    {
        return Err(Error::new("Race clock or wind is not finite"));
    }
    for boat in state.boats.values() {
        let kinematics = [boat.pos.x, boat.pos.y, boat.heading_deg, boat.speed];
        if kinematics.iter().any(|v| !v.is_finite()) {
            return Err(Error::new(format!("Boat {} has non-finite kinematics", boat.id)));
        }
    }
    Ok(())
}

pub struct RaceHost {
    config: SimConfig,
    state: Arc<RaceState>,
    mailbox: InputMailbox,
    engines: TickEngines,
    field: WindField,
    mark_colliders: MarkColliders,
    running: bool,
    last_tick_ms: Option<i64>,
    pending_events: Vec<RaceEvent>,
    last_events: Vec<RaceEvent>,
    on_tick: Option<TickCallback>,
    on_events: Option<EventsCallback>,
}

impl RaceHost {
    pub fn new(state: RaceState, config: SimConfig) -> Self {
        let mut host = RaceHost {
            engines: TickEngines::new(config.penalty_cooldown_seconds),
            config,
            state: Arc::new(state.clone()),
            mailbox: InputMailbox::new(),
            field: WindField::new(),
            mark_colliders: MarkColliders::new(),
            running: false,
            last_tick_ms: None,
            pending_events: vec![],
            last_events: vec![],
            on_tick: None,
            on_events: None,
        };
        host.reset(state);
        host
    }

    pub fn state(&self) -> Arc<RaceState> {
        self.state.clone()
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn last_events(&self) -> &[RaceEvent] {
        &self.last_events
    }

    pub fn input_sender(&self) -> InputSender {
        self.mailbox.sender()
    }

    pub fn submit_input(&self, boat_id: impl Into<BoatId>, input: PlayerInput) {
        self.mailbox.push(boat_id, input);
    }

    pub fn set_on_tick(&mut self, callback: TickCallback) {
        self.on_tick = Some(callback);
    }

    pub fn set_on_events(&mut self, callback: EventsCallback) {
        self.on_events = Some(callback);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        log::info!("Starting race {}", self.state.meta.race_id);
        self.running = true;
        self.last_tick_ms = None;
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        log::info!("Stopping race {}", self.state.meta.race_id);
        self.running = false;
    }

    /// Replaces the race and forgets everything the engines remembered.
    ///
    /// The configured baseline wind and wind field are applied to `state`.
    pub fn reset(&mut self, mut state: RaceState) {
        log::info!(
            "Resetting race {} (seed {})",
            state.meta.race_id,
            state.meta.seed
        );
        self.engines = TickEngines::new(self.config.penalty_cooldown_seconds);
        self.field.reset();
        self.mark_colliders.reset();
        self.mailbox.clear();
        self.last_tick_ms = None;
        self.pending_events.clear();
        self.last_events.clear();
        state.baseline_wind_deg = self.config.baseline_wind_deg;
        state.wind = Wind {
            direction_deg: normalize_deg(self.config.baseline_wind_deg),
            speed: self.config.baseline_wind_speed,
        };
        if state.wind_field.is_none() {
            state.wind_field = self.config.wind_field.clone();
        }
        if state.phase == RacePhase::Prestart && !state.countdown_armed {
            state.t = -self.config.countdown_seconds;
        }
        state.leaderboard = leaderboard(&state, self.config.protest_ranking);
        self.state = Arc::new(state);
    }

    fn publish_command(&mut self, mut state: RaceState) {
        state.leaderboard = leaderboard(&state, self.config.protest_ranking);
        self.state = Arc::new(state);
    }

    /// Starts the countdown; the gun fires `countdown_seconds` later.
    pub fn arm_countdown(&mut self, now_ms: i64) -> Result<(), Error> {
        if self.state.phase != RacePhase::Prestart {
            return Err(Error::new("Countdown can only be armed before the start"));
        }
        if self.state.countdown_armed {
            return Ok(());
        }
        let mut draft = (*self.state).clone();
        draft.countdown_armed = true;
        draft.clock_start_ms = Some(now_ms + (self.config.countdown_seconds * 1000.0) as i64);
        draft.t = -self.config.countdown_seconds;
        log::info!(
            "Countdown armed for race {}, {}s to start",
            draft.meta.race_id,
            self.config.countdown_seconds
        );
        self.publish_command(draft);
        Ok(())
    }

    pub fn add_boat(&mut self, boat: BoatState) -> Result<(), Error> {
        if self.state.boats.contains_key(&boat.id) {
            return Err(Error::new(format!("Boat {} already exists", boat.id)));
        }
        let mut draft = (*self.state).clone();
        log::info!("Boat {} joined race {}", boat.id, draft.meta.race_id);
        draft.boats.insert(boat.id.clone(), boat);
        self.publish_command(draft);
        Ok(())
    }

    pub fn remove_boat(&mut self, id: &str) -> Result<BoatState, Error> {
        let mut draft = (*self.state).clone();
        let boat = draft
            .boats
            .remove(id)
            .ok_or_else(|| Error::new(format!("Unknown boat {id}")))?;
        draft.protests.remove(id);
        self.engines.rules.forget_boat(id);
        self.engines.warned.remove(id);
        log::info!("Boat {id} left race {}", draft.meta.race_id);
        self.publish_command(draft);
        Ok(boat)
    }

    pub fn file_protest(
        &mut self,
        protestor: &str,
        protested: &str,
        rule_id: &str,
    ) -> Result<(), Error> {
        let mut draft = (*self.state).clone();
        protest::file_protest(&mut draft, protestor, protested, rule_id)?;
        let event = self.engines.event(
            draft.t,
            EventKind::RuleHint,
            Some(rule_id),
            vec![protestor.to_string(), protested.to_string()],
            format!("{protestor} protests {protested} under rule {rule_id}"),
        );
        self.pending_events.push(event);
        self.publish_command(draft);
        Ok(())
    }

    pub fn resolve_protest(&mut self, protested: &str, upheld: bool) -> Result<(), Error> {
        let mut draft = (*self.state).clone();
        let protest = protest::resolve_protest(&mut draft, protested, upheld)?;
        let (kind, message) = if upheld {
            (
                EventKind::Penalty,
                format!("Protest upheld: {protested} penalised under rule {}", protest.rule_id),
            )
        } else {
            (
                EventKind::RuleHint,
                format!("Protest against {protested} dismissed"),
            )
        };
        let event = self.engines.event(
            draft.t,
            kind,
            Some(protest.rule_id.as_str()),
            vec![protest.protestor_id.clone(), protest.protested_id.clone()],
            message,
        );
        self.pending_events.push(event);
        self.publish_command(draft);
        Ok(())
    }

    /// Runs one tick at wall-clock `now_ms`. Does nothing while stopped.
    pub fn tick(&mut self, now_ms: i64) {
        if !self.running {
            return;
        }
        let dt = match self.last_tick_ms {
            Some(last) => ((now_ms - last) as f64 / 1000.0)
                .min(self.config.max_dt)
                .max(0.0),
            None => 0.0,
        };
        self.last_tick_ms = Some(now_ms);

        let inputs = self.mailbox.drain();
        let mut engines = self.engines.clone();
        match catch_unwind(AssertUnwindSafe(|| {
            self.step(&mut engines, inputs, now_ms, dt)
        })) {
            Ok(Ok((state, events))) => {
                self.engines = engines;
                self.publish(state, events);
            }
            Ok(Err(e)) => {
                log::warn!("Tick failed, keeping previous state: {e}");
                self.last_events.clear();
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::warn!("Tick panicked, keeping previous state: {msg}");
                self.last_events.clear();
            }
        }

        if self.state.phase == RacePhase::Finished {
            self.stop();
        }
    }

    fn publish(&mut self, state: RaceState, events: Vec<RaceEvent>) {
        self.state = Arc::new(state);
        self.pending_events.clear();
        self.last_events = events;
        if let Some(on_tick) = self.on_tick.as_mut() {
            on_tick(&self.state, &self.last_events);
        }
        if !self.last_events.is_empty() {
            if let Some(on_events) = self.on_events.as_mut() {
                on_events(&self.last_events);
            }
        }
    }

    fn step(
        &mut self,
        engines: &mut TickEngines,
        mut inputs: BTreeMap<BoatId, PlayerInput>,
        now_ms: i64,
        dt: f64,
    ) -> Result<(RaceState, Vec<RaceEvent>), Error> {
        let mut draft = (*self.state).clone();
        let mut events = self.pending_events.clone();

        inputs.retain(|id, _| {
            let known = draft.boats.contains_key(id);
            if !known {
                log::debug!("Dropping input for unknown boat {id}");
            }
            known
        });

        if draft.phase == RacePhase::Finished {
            return Ok((draft, events));
        }

        let held = draft.phase == RacePhase::Prestart && !draft.countdown_armed;
        if held {
            draft.t = -self.config.countdown_seconds;
        } else {
            step_race_state(&mut draft, &inputs, dt, &mut self.field);
        }

        for (id, input) in inputs.iter() {
            if let Some(boat) = draft.boats.get_mut(id) {
                boat.last_input_seq = input.seq;
                boat.last_input_applied_at = now_ms;
            }
        }

        engines.wind.apply(&mut draft, dt, &self.config);

        if let Some(start_ms) = draft.clock_start_ms {
            draft.t = (now_ms - start_ms) as f64 / 1000.0;
        } else if !held {
            draft.t += dt;
        }
        ensure_finite(&draft)?;

        let timeout = self.config.race_timeout_minutes * 60.0;
        if timeout > 0.0 && draft.clock_start_ms.is_some() && draft.t >= timeout {
            draft.phase = RacePhase::Finished;
            log::info!("Race {} timed out at t={:.1}", draft.meta.race_id, draft.t);
            events.push(engines.event(
                draft.t,
                EventKind::Finish,
                None,
                vec![],
                "Race time limit reached".to_string(),
            ));
            draft.leaderboard = leaderboard(&draft, self.config.protest_ranking);
            return Ok((draft, events));
        }

        for id in update_progress(&mut draft) {
            let name = draft.boats.get(&id).map(|b| b.name.clone()).unwrap_or_default();
            log::info!("{id} finished at t={:.1}", draft.t);
            events.push(engines.event(
                draft.t,
                EventKind::Finish,
                None,
                vec![id],
                format!("{name} finished"),
            ));
        }

        for start_event in engines.start_line.check(&mut draft) {
            let t = draft.t;
            let event = match start_event {
                StartLineEvent::OverEarly(id) => engines.event(
                    t,
                    EventKind::Penalty,
                    Some(OCS_RULE_ID),
                    vec![id.clone()],
                    format!("{id} is over the line early"),
                ),
                StartLineEvent::Cleared(id) => engines.event(
                    t,
                    EventKind::RuleHint,
                    Some(OCS_RULE_ID),
                    vec![id.clone()],
                    format!("{id} has returned behind the line"),
                ),
                StartLineEvent::StartSignal => {
                    log::info!("Start signal for race {}", draft.meta.race_id);
                    engines.event(t, EventKind::StartSignal, None, vec![], "Start".to_string())
                }
                StartLineEvent::GeneralRecall(ids) => {
                    log::info!("General recall in race {}: {:?}", draft.meta.race_id, ids);
                    let message = format!("General recall: {}", ids.join(", "));
                    engines.event(
                        t,
                        EventKind::GeneralRecall,
                        Some(OCS_RULE_ID),
                        ids,
                        message,
                    )
                }
            };
            events.push(event);
        }

        let outcomes = Self::apply_rules(engines, &mut draft, &mut events);
        self.apply_collisions(&mut draft, &outcomes);

        draft.leaderboard = leaderboard(&draft, self.config.protest_ranking);

        if draft.phase == RacePhase::Running
            && !draft.boats.is_empty()
            && draft.boats.values().all(|b| b.finished)
        {
            draft.phase = RacePhase::Finished;
            log::info!("All boats finished race {}", draft.meta.race_id);
            events.push(engines.event(
                draft.t,
                EventKind::Finish,
                None,
                draft.leaderboard.clone(),
                "All boats finished".to_string(),
            ));
        }

        Ok((draft, events))
    }

    /// Penalises new violations, marks fouls and raises warnings. Returns the
    /// fault split of the overlapping pairs.
    fn apply_rules(
        engines: &mut TickEngines,
        draft: &mut RaceState,
        events: &mut Vec<RaceEvent>,
    ) -> Vec<CollisionOutcome> {
        for violation in engines.rules.evaluate(draft) {
            if let Some(boat) = draft.boats.get_mut(&violation.offender_id) {
                boat.penalties += 1;
            }
            let other = violation
                .boats
                .iter()
                .find(|id| **id != violation.offender_id)
                .cloned()
                .unwrap_or_default();
            let event = engines.event(
                draft.t,
                EventKind::Penalty,
                Some(violation.rule_id.as_str()),
                violation.boats.to_vec(),
                format!(
                    "{} penalised under rule {} (against {})",
                    violation.offender_id,
                    violation.rule_id.as_str(),
                    other
                ),
            );
            events.push(event);
        }

        for boat in draft.boats.values_mut() {
            boat.fouled = false;
        }
        let outcomes = collision_outcomes(draft);
        for outcome in outcomes.iter() {
            if let Some(boat) = draft.boats.get_mut(&outcome.at_fault) {
                boat.fouled = true;
            }
        }

        let warnings = engines.rules.compute_warnings(draft);
        let fresh: Vec<BoatId> = warnings.difference(&engines.warned).cloned().collect();
        for id in fresh {
            log::debug!("{id} is about to foul");
            events.push(engines.event(
                draft.t,
                EventKind::RuleHint,
                None,
                vec![id.clone()],
                format!("{id}: keep clear"),
            ));
        }
        engines.warned = warnings;
        outcomes
    }

    fn apply_collisions(&mut self, draft: &mut RaceState, outcomes: &[CollisionOutcome]) {
        let fault = if self.config.fault_weighted_push {
            Some(outcomes)
        } else {
            None
        };
        let resolved = resolve_boat_collisions(&draft.boats, fault);
        for (id, pos) in resolved.positions {
            if let Some(boat) = draft.boats.get_mut(&id) {
                boat.pos = pos;
            }
        }
        for (id, push) in self.mark_colliders.resolve(draft) {
            if let Some(boat) = draft.boats.get_mut(&id) {
                boat.pos += push;
            }
        }
    }

    /// Runs the loop on its own thread at the configured tick rate.
    pub fn spawn(mut self, clock: Box<dyn Clock>) -> RaceLoop {
        let stop = Arc::new(AtomicBool::new(false));
        let sender = self.input_sender();
        let stop_flag = stop.clone();
        let handle = std::thread::spawn(move || {
            self.start();
            let interval = self.config.tick_interval();
            let mut next = Instant::now();
            while !stop_flag.load(Ordering::Relaxed) && self.is_running() {
                self.tick(clock.now_ms());
                next += interval;
                let now = Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
            self.stop();
            self
        });
        RaceLoop {
            stop,
            sender,
            handle: Some(handle),
        }
    }
}

/// Handle to a race running on its own thread.
pub struct RaceLoop {
    stop: Arc<AtomicBool>,
    sender: InputSender,
    handle: Option<JoinHandle<RaceHost>>,
}

impl RaceLoop {
    pub fn input_sender(&self) -> InputSender {
        self.sender.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stops after the in-flight tick and hands the host back.
    pub fn stop(mut self) -> Option<RaceHost> {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.take()?.join() {
            Ok(host) => Some(host),
            Err(_) => {
                log::warn!("Race loop thread panicked");
                None
            }
        }
    }
}

impl Drop for RaceLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
