use approx::assert_abs_diff_eq;
use nalgebra::vector;
use regatta_simulator::config::SimConfig;
use regatta_simulator::host::{Clock, RaceHost, SystemClock, OCS_RULE_ID};
use regatta_simulator::input::{PlayerInput, Steering};
use regatta_simulator::physics::step_race_state;
use regatta_simulator::state::{
    BoatState, EventKind, RaceEvent, RacePhase, RaceState, WindFieldConfig,
};
use regatta_simulator::wind::WindField;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use test_log::test;

fn boat(id: &str, x: f64, y: f64, heading: f64) -> BoatState {
    BoatState::new(id, id, 0xffffff, vector![x, y], heading)
}

fn race(boats: Vec<BoatState>) -> RaceState {
    let mut state = RaceState::windward_leeward("host", 1234);
    for b in boats {
        state.boats.insert(b.id.clone(), b);
    }
    state
}

fn fixed_wind() -> SimConfig {
    SimConfig {
        fixed_wind: true,
        ..Default::default()
    }
}

fn started(state: RaceState, config: SimConfig) -> RaceHost {
    let mut host = RaceHost::new(state, config);
    host.start();
    host
}

fn has_event(events: &[RaceEvent], kind: EventKind) -> bool {
    events.iter().any(|e| e.kind == kind)
}

#[test]
fn test_held_countdown() {
    let mut host = started(race(vec![boat("a", 0.0, 300.0, 90.0)]), fixed_wind());
    let before = host.state().boats["a"].pos;
    for now in [1000, 2000, 3000] {
        host.tick(now);
        assert_eq!(host.state().t, -60.0);
    }
    assert_eq!(host.state().phase, RacePhase::Prestart);
    assert_eq!(host.state().boats["a"].pos, before);
}

#[test]
fn test_start_and_stop_are_idempotent() {
    let mut host = RaceHost::new(race(vec![]), fixed_wind());
    host.start();
    host.start();
    assert!(host.is_running());
    host.stop();
    host.stop();
    assert!(!host.is_running());

    let before = host.state();
    host.tick(1000);
    assert!(Arc::ptr_eq(&before, &host.state()));
}

#[test]
fn test_clock_drives_race_time_and_dt_is_clamped() {
    let mut host = started(race(vec![boat("a", 0.0, 300.0, 90.0)]), fixed_wind());
    host.arm_countdown(0).unwrap();
    assert_eq!(host.state().clock_start_ms, Some(60_000));
    host.tick(0);
    assert_eq!(host.state().t, -60.0);

    let mut expected = (*host.state()).clone();
    step_race_state(&mut expected, &BTreeMap::new(), 0.25, &mut WindField::new());

    // A ten second stall only advances physics by the clamp.
    host.tick(10_000);
    let state = host.state();
    assert_eq!(state.t, -50.0);
    assert_abs_diff_eq!(state.boats["a"].pos.x, expected.boats["a"].pos.x, epsilon = 1e-9);
    assert_abs_diff_eq!(state.boats["a"].speed, expected.boats["a"].speed, epsilon = 1e-9);
}

#[test]
fn test_input_stamping_and_last_write_wins() {
    let mut host = started(race(vec![boat("a", 0.0, 300.0, 90.0)]), fixed_wind());
    host.arm_countdown(0).unwrap();
    host.submit_input(
        "a",
        PlayerInput {
            seq: 1,
            steering: Some(Steering::Absolute(120.0)),
            ..Default::default()
        },
    );
    host.input_sender().send(
        "a",
        PlayerInput {
            seq: 2,
            steering: Some(Steering::Absolute(45.0)),
            ..Default::default()
        },
    );
    host.submit_input("ghost", PlayerInput::default());
    host.tick(5_000);

    let state = host.state();
    assert!(!state.boats.contains_key("ghost"));
    let a = &state.boats["a"];
    assert_eq!(a.heading_deg, 45.0);
    assert_eq!(a.last_input_seq, 2);
    assert_eq!(a.last_input_applied_at, 5_000);

    // No new input, no new stamp.
    host.tick(5_050);
    assert_eq!(host.state().boats["a"].last_input_applied_at, 5_000);
}

#[test]
fn test_inputs_stamped_while_held() {
    let mut host = started(race(vec![boat("a", 0.0, 300.0, 90.0)]), fixed_wind());
    host.submit_input(
        "a",
        PlayerInput {
            seq: 9,
            ..Default::default()
        },
    );
    host.tick(1_000);
    assert_eq!(host.state().boats["a"].last_input_seq, 9);
    assert_eq!(host.state().boats["a"].last_input_applied_at, 1_000);
}

#[test]
fn test_start_signal() {
    let mut host = started(race(vec![boat("a", 0.0, 300.0, 90.0)]), fixed_wind());
    host.arm_countdown(0).unwrap();
    host.tick(0);
    host.tick(59_950);
    assert_eq!(host.state().phase, RacePhase::Prestart);
    host.tick(60_000);
    assert_eq!(host.state().phase, RacePhase::Running);
    assert!(has_event(host.last_events(), EventKind::StartSignal));
    assert!(host.arm_countdown(60_000).is_err());
}

#[test]
fn test_ocs_and_general_recall() {
    let mut host = started(
        race(vec![boat("early", 0.0, 100.0, 90.0), boat("b", 0.0, 300.0, 90.0)]),
        fixed_wind(),
    );
    host.arm_countdown(0).unwrap();
    host.tick(0);
    let penalty = host
        .last_events()
        .iter()
        .find(|e| e.kind == EventKind::Penalty)
        .cloned()
        .unwrap();
    assert_eq!(penalty.rule_id.as_deref(), Some(OCS_RULE_ID));
    assert_eq!(penalty.boats, vec!["early".to_string()]);
    assert!(host.state().boats["early"].over_early);

    host.tick(60_000);
    let events = host.last_events();
    assert!(!has_event(events, EventKind::StartSignal));
    let recall = events
        .iter()
        .find(|e| e.kind == EventKind::GeneralRecall)
        .unwrap();
    assert_eq!(recall.boats, vec!["early".to_string()]);
}

#[test]
fn test_rule_violation_penalises_offender() {
    let mut state = race(vec![boat("a", 0.0, 300.0, 45.0), boat("b", 5.0, 300.0, 315.0)]);
    state.phase = RacePhase::Running;
    state.countdown_armed = true;
    state.clock_start_ms = Some(0);
    let mut host = started(state, fixed_wind());
    host.tick(1_000);

    let state = host.state();
    assert_eq!(state.boats["a"].penalties, 1);
    assert_eq!(state.boats["b"].penalties, 0);
    assert!(state.boats["a"].fouled);
    assert!(!state.boats["b"].fouled);
    let penalty = host
        .last_events()
        .iter()
        .find(|e| e.kind == EventKind::Penalty)
        .unwrap();
    assert_eq!(penalty.rule_id.as_deref(), Some("10"));
    assert_eq!(state.leaderboard, vec!["b".to_string(), "a".to_string()]);

    // Still overlapping: no double penalty.
    host.tick(1_050);
    assert_eq!(host.state().boats["a"].penalties, 1);
}

#[test]
fn test_warning_hint_on_rising_edge() {
    let mut state = race(vec![boat("a", 0.0, 300.0, 90.0), boat("b", 0.0, 320.0, 90.0)]);
    state.phase = RacePhase::Running;
    state.clock_start_ms = Some(0);
    let mut host = started(state, fixed_wind());
    host.tick(1_000);
    let hints: Vec<&RaceEvent> = host
        .last_events()
        .iter()
        .filter(|e| e.kind == EventKind::RuleHint)
        .collect();
    assert_eq!(hints.len(), 1);
    assert_eq!(hints[0].boats, vec!["a".to_string()]);

    host.tick(1_000);
    assert!(!has_event(host.last_events(), EventKind::RuleHint));
}

#[test]
fn test_failed_tick_keeps_previous_state() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let mut state = race(vec![boat("a", 0.0, 300.0, 90.0), boat("b", 0.0, 600.0, 90.0)]);
    state.phase = RacePhase::Running;
    state.clock_start_ms = Some(0);
    let mut host = started(state, fixed_wind());
    {
        let ticks = ticks.clone();
        host.set_on_tick(Box::new(move |_, _| {
            ticks.fetch_add(1, Ordering::SeqCst);
        }));
    }
    host.tick(1_000);
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    assert!(!host.last_events().is_empty());

    host.file_protest("a", "b", "10").unwrap();
    let before = host.state();
    host.submit_input(
        "a",
        PlayerInput {
            seq: 5,
            steering: Some(Steering::Absolute(f64::NAN)),
            ..Default::default()
        },
    );
    host.tick(1_050);
    assert!(Arc::ptr_eq(&before, &host.state()));
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    assert!(host.last_events().is_empty());

    // The next tick carries on from the last published state, including the
    // protest hint queued before the failure.
    host.tick(1_100);
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
    let state = host.state();
    assert_eq!(state.t, 1.1);
    let a = &state.boats["a"];
    assert_eq!(a.heading_deg, 90.0);
    assert_eq!(a.last_input_seq, 0);
    assert!(a.pos.x > before.boats["a"].pos.x);
    let hint = host
        .last_events()
        .iter()
        .find(|e| e.kind == EventKind::RuleHint)
        .unwrap();
    assert_eq!(hint.rule_id.as_deref(), Some("10"));
    assert_eq!(hint.boats, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn test_unusable_wind_config_does_not_stall_the_race() {
    let mut config = SimConfig {
        wind_field: Some(WindFieldConfig {
            domain_size: f64::NAN,
            intensity: f64::NAN,
            ..Default::default()
        }),
        ..Default::default()
    };
    config.oscillation.shift_range_deg = f64::INFINITY;
    let mut host = started(race(vec![boat("a", 0.0, 300.0, 90.0)]), config);
    host.arm_countdown(0).unwrap();
    let mut gun = false;
    for i in 0..1300 {
        host.tick(i * 50);
        gun |= has_event(host.last_events(), EventKind::StartSignal);
    }
    let state = host.state();
    assert!(gun);
    assert_eq!(state.phase, RacePhase::Running);
    assert!(state.t > 0.0);
    assert!(state.boats["a"].pos.x.is_finite());
    assert!(state.boats["a"].pos.x > 0.0);
}

#[test]
fn test_timeout_finishes_race() {
    let config = SimConfig {
        race_timeout_minutes: 1.0,
        ..fixed_wind()
    };
    let mut host = started(race(vec![boat("a", 0.0, 300.0, 90.0)]), config);
    host.arm_countdown(0).unwrap();
    host.tick(0);
    host.tick(60_000);
    assert!(host.is_running());
    host.tick(120_000);

    assert_eq!(host.state().phase, RacePhase::Finished);
    assert!(has_event(host.last_events(), EventKind::Finish));
    assert!(!host.is_running());
}

#[test]
fn test_all_finished() {
    let mut a = boat("a", 0.0, -1.0, 180.0);
    a.next_mark_index = 1;
    a.speed = 10.0;
    let mut state = race(vec![a]);
    state.phase = RacePhase::Running;
    state.laps_to_finish = 1;
    let mut host = started(state, fixed_wind());
    host.tick(0);
    host.tick(250);

    let state = host.state();
    assert!(state.boats["a"].finished);
    assert_eq!(state.phase, RacePhase::Finished);
    let finishes = host
        .last_events()
        .iter()
        .filter(|e| e.kind == EventKind::Finish)
        .count();
    assert_eq!(finishes, 2);
    assert!(!host.is_running());
}

#[test]
fn test_callbacks() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(vec![]));
    let mut host = started(race(vec![boat("a", 0.0, 300.0, 90.0)]), fixed_wind());
    {
        let ticks = ticks.clone();
        host.set_on_tick(Box::new(move |state, _events| {
            assert_eq!(state.meta.race_id, "host");
            ticks.fetch_add(1, Ordering::SeqCst);
        }));
        let seen = seen.clone();
        host.set_on_events(Box::new(move |events| {
            assert!(!events.is_empty());
            seen.lock().unwrap().extend(events.iter().map(|e| e.kind));
        }));
    }
    host.arm_countdown(0).unwrap();
    host.tick(0);
    host.tick(30_000);
    host.tick(60_000);
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
    assert_eq!(*seen.lock().unwrap(), vec![EventKind::StartSignal]);
}

#[test]
fn test_event_ids_increase() {
    let mut host = started(
        race(vec![boat("a", 0.0, 100.0, 90.0), boat("b", 0.0, 300.0, 90.0)]),
        fixed_wind(),
    );
    host.arm_countdown(0).unwrap();
    host.tick(0);
    let first = host.last_events()[0].event_id;
    host.tick(60_000);
    assert!(host.last_events().iter().all(|e| e.event_id > first));
}

#[test]
fn test_reset_is_idempotent() {
    let initial = race(vec![
        boat("a", -50.0, 300.0, 45.0),
        boat("b", 50.0, 300.0, 315.0),
    ]);
    let run = |host: &mut RaceHost| -> Vec<u64> {
        host.start();
        host.arm_countdown(0).unwrap();
        (0..200)
            .map(|i| {
                host.tick(i * 50);
                host.state().hash()
            })
            .collect()
    };

    let mut host = RaceHost::new(initial.clone(), SimConfig::default());
    let first = run(&mut host);
    host.reset(initial.clone());
    let second = run(&mut host);
    host.reset(initial.clone());
    host.reset(initial);
    let third = run(&mut host);
    assert_eq!(first, second);
    assert_eq!(first, third);
}

#[test]
fn test_protests() {
    let mut host = started(
        race(vec![boat("a", 0.0, 300.0, 90.0), boat("b", 0.0, 600.0, 90.0)]),
        fixed_wind(),
    );
    assert!(host.file_protest("a", "a", "10").is_err());
    assert!(host.file_protest("a", "zzz", "10").is_err());
    host.file_protest("a", "b", "10").unwrap();
    assert!(host.file_protest("a", "b", "11").is_err());
    assert!(host.state().protests.contains_key("b"));

    host.tick(0);
    assert!(has_event(host.last_events(), EventKind::RuleHint));

    host.resolve_protest("b", true).unwrap();
    let state = host.state();
    assert!(state.protests.is_empty());
    assert_eq!(state.boats["b"].penalties, 1);
    assert_eq!(state.boats["b"].protest_penalties, 1);
    assert!(host.resolve_protest("b", true).is_err());

    host.tick(50);
    assert!(has_event(host.last_events(), EventKind::Penalty));
}

#[test]
fn test_add_and_remove_boats() {
    let mut host = started(race(vec![boat("a", 0.0, 300.0, 90.0)]), fixed_wind());
    host.add_boat(boat("b", 0.0, 400.0, 90.0)).unwrap();
    assert!(host.add_boat(boat("b", 0.0, 400.0, 90.0)).is_err());
    assert_eq!(host.state().leaderboard.len(), 2);

    let removed = host.remove_boat("a").unwrap();
    assert_eq!(removed.id, "a");
    assert!(host.remove_boat("a").is_err());
    assert_eq!(host.state().leaderboard, vec!["b".to_string()]);
}

#[test]
fn test_config_wind_applied_on_reset() {
    let config = SimConfig {
        baseline_wind_deg: 20.0,
        baseline_wind_speed: 8.0,
        ..fixed_wind()
    };
    let host = RaceHost::new(race(vec![]), config);
    let state = host.state();
    assert_eq!(state.baseline_wind_deg, 20.0);
    assert_eq!(state.wind.direction_deg, 20.0);
    assert_eq!(state.wind.speed, 8.0);
}

struct FrozenClock(i64);

impl Clock for FrozenClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

#[test]
fn test_race_loop_thread() {
    let mut state = race(vec![boat("a", 0.0, 300.0, 90.0)]);
    state.phase = RacePhase::Running;
    let race_loop = RaceHost::new(state, fixed_wind()).spawn(Box::new(SystemClock));
    race_loop.input_sender().send(
        "a",
        PlayerInput {
            seq: 3,
            ..Default::default()
        },
    );
    std::thread::sleep(std::time::Duration::from_millis(300));
    let host = race_loop.stop().unwrap();
    assert!(!host.is_running());
    assert!(host.state().t > 0.0);
    assert_eq!(host.state().boats["a"].last_input_seq, 3);
}

#[test]
fn test_race_loop_stops_when_finished() {
    let config = SimConfig {
        race_timeout_minutes: 1.0,
        ..fixed_wind()
    };
    let mut state = race(vec![]);
    state.phase = RacePhase::Running;
    state.clock_start_ms = Some(0);
    let race_loop = RaceHost::new(state, config).spawn(Box::new(FrozenClock(3_600_000)));
    for _ in 0..100 {
        if race_loop.is_finished() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(race_loop.is_finished());
    let host = race_loop.stop().unwrap();
    assert_eq!(host.state().phase, RacePhase::Finished);
}
