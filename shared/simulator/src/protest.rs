use crate::error::Error;
use crate::state::{Protest, RaceState};

pub fn file_protest(
    state: &mut RaceState,
    protestor: &str,
    protested: &str,
    rule_id: &str,
) -> Result<(), Error> {
    if protestor == protested {
        return Err(Error::new(format!("{protestor} cannot protest itself")));
    }
    for id in [protestor, protested] {
        if !state.boats.contains_key(id) {
            return Err(Error::new(format!("Unknown boat {id}")));
        }
    }
    if state.protests.contains_key(protested) {
        return Err(Error::new(format!("{protested} already has an open protest")));
    }
    state.protests.insert(
        protested.to_string(),
        Protest {
            protestor_id: protestor.to_string(),
            protested_id: protested.to_string(),
            rule_id: rule_id.to_string(),
            filed_at: state.t,
        },
    );
    Ok(())
}

/// Closes the protest against `protested`; an upheld protest adds a penalty.
pub fn resolve_protest(
    state: &mut RaceState,
    protested: &str,
    upheld: bool,
) -> Result<Protest, Error> {
    let protest = state
        .protests
        .remove(protested)
        .ok_or_else(|| Error::new(format!("No open protest against {protested}")))?;
    if upheld {
        if let Some(boat) = state.boats.get_mut(protested) {
            boat.penalties += 1;
            boat.protest_penalties += 1;
        }
    }
    Ok(protest)
}
