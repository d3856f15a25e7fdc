use crate::error::Error;
use crate::state::BoatId;
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Steering {
    /// Rate-limited steering target.
    Desired(f64),
    /// Sets heading immediately (autopilot and AI).
    Absolute(f64),
    /// Relative nudge of the steering target.
    Delta(f64),
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct PlayerInput {
    pub seq: u64,
    pub steering: Option<Steering>,
    /// Start a 360 degree penalty turn.
    pub spin: bool,
    pub vmg_mode: Option<bool>,
}

/// Loosely shaped input as it arrives from a client.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInput {
    #[serde(default)]
    pub seq: u64,
    pub desired_heading_deg: Option<f64>,
    pub absolute_heading_deg: Option<f64>,
    pub delta_heading_deg: Option<f64>,
    pub spin: Option<String>,
    pub vmg_mode: Option<bool>,
}

fn finite(name: &str, v: Option<f64>) -> Result<Option<f64>, Error> {
    match v {
        Some(x) if !x.is_finite() => Err(Error::new(format!("{name} is not finite"))),
        _ => Ok(v),
    }
}

impl TryFrom<RawInput> for PlayerInput {
    type Error = Error;

    fn try_from(raw: RawInput) -> Result<Self, Error> {
        let absolute = finite("absoluteHeadingDeg", raw.absolute_heading_deg)?;
        let desired = finite("desiredHeadingDeg", raw.desired_heading_deg)?;
        let delta = finite("deltaHeadingDeg", raw.delta_heading_deg)?;
        let steering = absolute
            .map(Steering::Absolute)
            .or(desired.map(Steering::Desired))
            .or(delta.map(Steering::Delta));
        let spin = match raw.spin.as_deref() {
            None => false,
            Some("full") => true,
            Some(other) => return Err(Error::new(format!("Unknown spin mode {other:?}"))),
        };
        Ok(PlayerInput {
            seq: raw.seq,
            steering,
            spin,
            vmg_mode: raw.vmg_mode,
        })
    }
}

impl PlayerInput {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        let raw: RawInput = serde_json::from_str(s)?;
        raw.try_into()
    }
}

/// Cloneable producer side of the mailbox, handed to network handlers.
#[derive(Clone)]
pub struct InputSender {
    sender: Sender<(BoatId, PlayerInput)>,
}

impl InputSender {
    pub fn send(&self, boat_id: impl Into<BoatId>, input: PlayerInput) {
        // The host owns the receiver; a dropped host just discards input.
        let _ = self.sender.send((boat_id.into(), input));
    }
}

/// At most one pending input per boat survives until the next drain.
pub struct InputMailbox {
    sender: Sender<(BoatId, PlayerInput)>,
    receiver: Receiver<(BoatId, PlayerInput)>,
}

impl InputMailbox {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> InputSender {
        InputSender {
            sender: self.sender.clone(),
        }
    }

    pub fn push(&self, boat_id: impl Into<BoatId>, input: PlayerInput) {
        let _ = self.sender.send((boat_id.into(), input));
    }

    pub fn drain(&self) -> BTreeMap<BoatId, PlayerInput> {
        let mut inputs = BTreeMap::new();
        while let Ok((boat_id, input)) = self.receiver.try_recv() {
            inputs.insert(boat_id, input);
        }
        inputs
    }

    pub fn clear(&self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

impl Default for InputMailbox {
    fn default() -> Self {
        InputMailbox::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_precedence() {
        let input = PlayerInput::from_json(
            r#"{"seq": 4, "desiredHeadingDeg": 10.0, "absoluteHeadingDeg": 20.0}"#,
        )
        .unwrap();
        assert_eq!(input.seq, 4);
        assert_eq!(input.steering, Some(Steering::Absolute(20.0)));

        let input = PlayerInput::from_json(r#"{"deltaHeadingDeg": -5.0, "spin": "full"}"#).unwrap();
        assert_eq!(input.steering, Some(Steering::Delta(-5.0)));
        assert!(input.spin);
    }

    #[test]
    fn test_rejects_bad_spin() {
        assert!(PlayerInput::from_json(r#"{"spin": "half"}"#).is_err());
    }

    #[test]
    fn test_last_write_wins() {
        let mailbox = InputMailbox::new();
        let sender = mailbox.sender();
        sender.send(
            "a",
            PlayerInput {
                seq: 1,
                ..Default::default()
            },
        );
        sender.send(
            "a",
            PlayerInput {
                seq: 2,
                ..Default::default()
            },
        );
        sender.send(
            "b",
            PlayerInput {
                seq: 7,
                ..Default::default()
            },
        );
        let drained = mailbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained["a"].seq, 2);
        assert_eq!(drained["b"].seq, 7);
        assert!(mailbox.drain().is_empty());
    }
}
