use crate::error::Error;
use crate::state::WindFieldConfig;
use std::collections::BTreeMap;
use std::str::FromStr;

pub type Environment = BTreeMap<String, String>;

/// How upheld-protest penalties count in the leaderboard penalty tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtestRanking {
    /// Protest penalties rank the same as rule-engine penalties.
    Counted,
    /// Only rule-engine penalties push a boat down the leaderboard.
    Ignored,
}

impl FromStr for ProtestRanking {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "counted" => Ok(ProtestRanking::Counted),
            "ignored" => Ok(ProtestRanking::Ignored),
            other => Err(Error::new(format!("Unknown protest ranking {other:?}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WindOscillationConfig {
    pub cycle_seconds: f64,
    /// Maximum shift from baseline, either side.
    pub shift_range_deg: f64,
    pub speed_range: f64,
    pub settle_seconds: f64,
}

impl Default for WindOscillationConfig {
    fn default() -> Self {
        Self {
            cycle_seconds: 18.0,
            shift_range_deg: 10.0,
            speed_range: 2.0,
            settle_seconds: 6.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimConfig {
    pub tick_rate_hz: f64,
    /// Upper bound on a single tick's dt, absorbs stalls and suspended hosts.
    pub max_dt: f64,
    pub countdown_seconds: f64,
    pub penalty_cooldown_seconds: f64,
    /// Zero disables the timeout.
    pub race_timeout_minutes: f64,
    pub baseline_wind_deg: f64,
    pub baseline_wind_speed: f64,
    pub fixed_wind: bool,
    pub oscillation: WindOscillationConfig,
    pub wind_field: Option<WindFieldConfig>,
    pub fault_weighted_push: bool,
    pub protest_ranking: ProtestRanking,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 20.0,
            max_dt: 0.25,
            countdown_seconds: 60.0,
            penalty_cooldown_seconds: 5.0,
            race_timeout_minutes: 30.0,
            baseline_wind_deg: 0.0,
            baseline_wind_speed: 12.0,
            fixed_wind: false,
            oscillation: WindOscillationConfig::default(),
            wind_field: None,
            fault_weighted_push: true,
            protest_ranking: ProtestRanking::Counted,
        }
    }
}

fn overlay<T: FromStr>(env: &Environment, key: &str, target: &mut T)
where
    T::Err: std::fmt::Display,
{
    if let Some(value) = env.get(key) {
        match value.trim().parse::<T>() {
            Ok(v) => *target = v,
            Err(e) => log::warn!("Ignoring {key}={value:?}: {e}"),
        }
    }
}

/// Like [`overlay`], but NaN and infinities keep the current value.
fn overlay_finite(env: &Environment, key: &str, target: &mut f64) {
    let mut value = *target;
    overlay(env, key, &mut value);
    if value.is_finite() {
        *target = value;
    } else {
        log::warn!("Ignoring non-finite {key}={value}");
    }
}

impl SimConfig {
    pub fn from_env() -> Self {
        let env: Environment = std::env::vars().collect();
        Self::from_environment(&env)
    }

    pub fn from_environment(env: &Environment) -> Self {
        let mut config = SimConfig::default();
        overlay_finite(env, "TICK_RATE_HZ", &mut config.tick_rate_hz);
        overlay_finite(env, "MAX_DT_SECONDS", &mut config.max_dt);
        overlay_finite(env, "COUNTDOWN_SECONDS", &mut config.countdown_seconds);
        overlay_finite(
            env,
            "PENALTY_COOLDOWN_SECONDS",
            &mut config.penalty_cooldown_seconds,
        );
        overlay_finite(env, "RACE_TIMEOUT_MINUTES", &mut config.race_timeout_minutes);
        overlay_finite(env, "BASELINE_WIND_DEG", &mut config.baseline_wind_deg);
        overlay_finite(env, "BASELINE_WIND_SPEED", &mut config.baseline_wind_speed);
        overlay(env, "FIXED_WIND", &mut config.fixed_wind);
        overlay_finite(
            env,
            "WIND_CYCLE_SECONDS",
            &mut config.oscillation.cycle_seconds,
        );
        overlay_finite(
            env,
            "WIND_SHIFT_RANGE_DEG",
            &mut config.oscillation.shift_range_deg,
        );
        overlay_finite(
            env,
            "WIND_SPEED_RANGE",
            &mut config.oscillation.speed_range,
        );
        overlay_finite(
            env,
            "WIND_SETTLE_SECONDS",
            &mut config.oscillation.settle_seconds,
        );
        overlay(env, "FAULT_WEIGHTED_PUSH", &mut config.fault_weighted_push);
        overlay(env, "PROTEST_RANKING", &mut config.protest_ranking);

        let field_keys = [
            "WIND_FIELD_INTENSITY",
            "WIND_FIELD_BLOBS",
            "WIND_FIELD_BLOB_SIZE",
            "WIND_FIELD_DOMAIN",
            "WIND_FIELD_ADVECTION",
        ];
        if field_keys.iter().any(|k| env.contains_key(*k)) {
            let mut field = WindFieldConfig::default();
            overlay_finite(env, "WIND_FIELD_INTENSITY", &mut field.intensity);
            overlay(env, "WIND_FIELD_BLOBS", &mut field.blob_count);
            overlay_finite(env, "WIND_FIELD_BLOB_SIZE", &mut field.blob_size);
            overlay_finite(env, "WIND_FIELD_DOMAIN", &mut field.domain_size);
            overlay_finite(env, "WIND_FIELD_ADVECTION", &mut field.advection_factor);
            config.wind_field = Some(field);
        }

        if config.tick_rate_hz.is_nan() || config.tick_rate_hz <= 0.0 {
            log::warn!(
                "Invalid tick rate {}, using default",
                config.tick_rate_hz
            );
            config.tick_rate_hz = SimConfig::default().tick_rate_hz;
        }
        config
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.tick_rate_hz)
    }
}
