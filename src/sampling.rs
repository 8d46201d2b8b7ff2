//! Exposure sampling and deduplication.
//!
//! Bounds exposure volume without ever dropping the first outcome seen for a `(name, rule id)`
//! pair. The server controls the behavior through `sdk_configs`:
//!
//! - `sampling_mode`: `on` drops sampled-out and duplicate exposures, `shadow` keeps every
//!   exposure but annotates what `on` would have done, anything else disables sampling.
//! - `special_case_sampling_rate`: rate applied to results without a real rule (default,
//!   disabled or blank rule ids).
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    eval::{rule_ids, EvalResult},
    hashing::hash_u64,
    User,
};

/// How long a dedupe fingerprint is remembered.
const DEDUPE_WINDOW: Duration = Duration::from_secs(60);
/// How long a `(name, rule id)` pair counts as seen.
const FIRST_SEEN_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Sets are cleared early when they grow past this size.
const MAX_KEYS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    On,
    Shadow,
    #[default]
    Off,
}

impl SamplingMode {
    pub fn from_sdk_configs(sdk_configs: &HashMap<String, serde_json::Value>) -> SamplingMode {
        match sdk_configs.get("sampling_mode").and_then(|v| v.as_str()) {
            Some("on") => SamplingMode::On,
            Some("shadow") => SamplingMode::Shadow,
            _ => SamplingMode::Off,
        }
    }
}

/// Decision for one exposure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SamplingStatus {
    pub should_log: bool,
    /// Rate that was applied, if any.
    pub sampling_rate: Option<u64>,
    /// In shadow mode, whether `on` mode would have kept the exposure.
    pub shadow_logged: Option<bool>,
    pub mode: SamplingMode,
}

impl SamplingStatus {
    fn always(mode: SamplingMode) -> SamplingStatus {
        SamplingStatus {
            should_log: true,
            sampling_rate: None,
            shadow_logged: None,
            mode,
        }
    }
}

/// An exposure about to be logged.
#[derive(Debug, Clone, Copy)]
pub struct ExposureSample<'a> {
    pub name: &'a str,
    pub result: &'a EvalResult,
    pub user: &'a User,
    /// For layer parameter exposures: allocated experiment and parameter name.
    pub layer_parameter: Option<(&'a str, &'a str)>,
}

impl ExposureSample<'_> {
    /// Identity of the exposure, used both for dedupe and for the sampling hash.
    fn fingerprint(&self) -> String {
        let mut fingerprint = format!(
            "n:{};r:{};u:{}",
            self.name,
            self.result.rule_id,
            self.user.user_id.as_deref().unwrap_or_default()
        );
        for (id_type, id) in &self.user.custom_ids {
            fingerprint.push_str(&format!(";{id_type}:{id}"));
        }
        if let Some((allocated, parameter)) = self.layer_parameter {
            fingerprint.push_str(&format!(";a:{allocated};p:{parameter}"));
        }
        fingerprint
    }
}

/// Set of keys that forgets everything once its window elapses.
#[derive(Debug)]
struct TimeBoundedSet {
    window: Duration,
    inner: Mutex<(Instant, HashSet<String>)>,
}

impl TimeBoundedSet {
    fn new(window: Duration) -> TimeBoundedSet {
        TimeBoundedSet {
            window,
            inner: Mutex::new((Instant::now(), HashSet::new())),
        }
    }

    /// Returns `true` if `key` was not present.
    fn insert(&self, key: String) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (started, keys) = &mut *guard;
        if started.elapsed() >= self.window || keys.len() >= MAX_KEYS {
            keys.clear();
            *started = Instant::now();
        }
        keys.insert(key)
    }

    fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.1.clear();
        guard.0 = Instant::now();
    }
}

/// Decides which exposures reach the event queue.
#[derive(Debug)]
pub struct SamplingProcessor {
    first_seen: TimeBoundedSet,
    dedupe: TimeBoundedSet,
    /// Environment tier configured on the client.
    environment_tier: Option<String>,
}

impl SamplingProcessor {
    pub fn new(environment_tier: Option<String>) -> SamplingProcessor {
        SamplingProcessor {
            first_seen: TimeBoundedSet::new(FIRST_SEEN_WINDOW),
            dedupe: TimeBoundedSet::new(DEDUPE_WINDOW),
            environment_tier,
        }
    }

    /// Decide whether to log `sample`, in order: overrides, disabled sampling or a
    /// non-production tier, forwarded or analytical specs, first sighting of the rule, then the
    /// dedupe set and rate.
    pub fn decide(
        &self,
        sample: &ExposureSample,
        sdk_configs: &HashMap<String, serde_json::Value>,
    ) -> SamplingStatus {
        let mode = SamplingMode::from_sdk_configs(sdk_configs);

        if sample.result.is_override()
            || mode == SamplingMode::Off
            || !self.is_production(sample.user)
            || sample.result.forward_all_exposures
            || sample.result.has_seen_analytical_gates
        {
            return SamplingStatus::always(mode);
        }

        let rule_key = format!("{}:{}", sample.name, sample.result.rule_id);
        let fingerprint = sample.fingerprint();
        if self.first_seen.insert(rule_key) {
            self.dedupe.insert(fingerprint);
            return SamplingStatus::always(mode);
        }

        let duplicate = !self.dedupe.insert(fingerprint.clone());
        let sampling_rate = sample
            .result
            .sampling_rate
            .or_else(|| special_case_rate(&sample.result.rule_id, sdk_configs));
        let sampled_in = sampling_rate
            .filter(|rate| *rate > 0)
            .map_or(true, |rate| hash_u64(&fingerprint) % rate == 0);
        let keep = !duplicate && sampled_in;

        match mode {
            SamplingMode::On => SamplingStatus {
                should_log: keep,
                sampling_rate,
                shadow_logged: None,
                mode,
            },
            SamplingMode::Shadow => SamplingStatus {
                should_log: true,
                sampling_rate,
                shadow_logged: Some(keep),
                mode,
            },
            SamplingMode::Off => SamplingStatus::always(mode),
        }
    }

    fn is_production(&self, user: &User) -> bool {
        user.get_environment_field("tier")
            .or(self.environment_tier.as_deref())
            .map_or(true, |tier| tier.eq_ignore_ascii_case("production"))
    }

    /// Forget every key.
    pub fn reset(&self) {
        self.first_seen.clear();
        self.dedupe.clear();
    }
}

fn special_case_rate(
    rule_id: &str,
    sdk_configs: &HashMap<String, serde_json::Value>,
) -> Option<u64> {
    let special = rule_id.is_empty()
        || rule_id == rule_ids::DEFAULT
        || rule_id == rule_ids::DISABLED;
    if !special {
        return None;
    }
    sdk_configs
        .get("special_case_sampling_rate")
        .and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sdk_configs(mode: &str) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            ("sampling_mode".to_owned(), json!(mode)),
            ("special_case_sampling_rate".to_owned(), json!(101)),
        ])
    }

    fn result(rule_id: &str, rate: Option<u64>) -> EvalResult {
        EvalResult {
            rule_id: rule_id.to_owned(),
            sampling_rate: rate,
            ..EvalResult::default()
        }
    }

    #[test]
    fn first_exposure_is_never_suppressed() {
        let processor = SamplingProcessor::new(None);
        let configs = sdk_configs("on");
        let result = result("rule", Some(1_000_000));

        for i in 0..100 {
            let user = User::with_user_id(format!("user{i}"));
            let name = format!("gate_{i}");
            let sample = ExposureSample {
                name: &name,
                result: &result,
                user: &user,
                layer_parameter: None,
            };
            assert!(processor.decide(&sample, &configs).should_log);
        }
    }

    #[test]
    fn rate_one_suppresses_identical_repeats() {
        let processor = SamplingProcessor::new(None);
        let configs = sdk_configs("on");
        let result = result("rule", Some(1));
        let user = User::with_user_id("u1");
        let sample = ExposureSample {
            name: "gate",
            result: &result,
            user: &user,
            layer_parameter: None,
        };

        assert!(processor.decide(&sample, &configs).should_log);
        for _ in 0..100 {
            let status = processor.decide(&sample, &configs);
            assert!(!status.should_log);
            assert_eq!(status.sampling_rate, Some(1));
        }

        // A different user is a different fingerprint and rate 1 keeps it.
        let other = User::with_user_id("u2");
        let sample = ExposureSample { user: &other, ..sample };
        assert!(processor.decide(&sample, &configs).should_log);
    }

    #[test]
    fn shadow_mode_keeps_and_annotates() {
        let processor = SamplingProcessor::new(None);
        let configs = sdk_configs("shadow");
        let result = result("rule", Some(1));
        let user = User::with_user_id("u1");
        let sample = ExposureSample {
            name: "gate",
            result: &result,
            user: &user,
            layer_parameter: None,
        };

        assert!(processor.decide(&sample, &configs).should_log);
        let status = processor.decide(&sample, &configs);
        assert!(status.should_log);
        assert_eq!(status.shadow_logged, Some(false));
        assert_eq!(status.mode, SamplingMode::Shadow);
    }

    #[test]
    fn must_log_cases_bypass_sampling() {
        let configs = sdk_configs("on");
        let user = User::with_user_id("u1");

        let processor = SamplingProcessor::new(None);
        let forced = result(rule_ids::OVERRIDE, Some(1));
        let forwarded = EvalResult {
            forward_all_exposures: true,
            ..result("rule", Some(1))
        };
        for result in [&forced, &forwarded] {
            let sample = ExposureSample {
                name: "gate",
                result,
                user: &user,
                layer_parameter: None,
            };
            for _ in 0..3 {
                assert!(processor.decide(&sample, &configs).should_log);
            }
        }

        let staging = SamplingProcessor::new(Some("staging".to_owned()));
        let plain = result("rule", Some(1));
        let sample = ExposureSample {
            name: "gate",
            result: &plain,
            user: &user,
            layer_parameter: None,
        };
        for _ in 0..3 {
            assert!(staging.decide(&sample, &configs).should_log);
        }
    }

    #[test]
    fn off_mode_logs_everything() {
        let processor = SamplingProcessor::new(None);
        let configs = HashMap::new();
        let result = result("rule", Some(1));
        let user = User::with_user_id("u1");
        let sample = ExposureSample {
            name: "gate",
            result: &result,
            user: &user,
            layer_parameter: None,
        };
        for _ in 0..3 {
            let status = processor.decide(&sample, &configs);
            assert!(status.should_log);
            assert_eq!(status.mode, SamplingMode::Off);
        }
    }

    #[test]
    fn special_case_rate_applies_to_default_rule() {
        let configs = sdk_configs("on");
        assert_eq!(special_case_rate(rule_ids::DEFAULT, &configs), Some(101));
        assert_eq!(special_case_rate("", &configs), Some(101));
        assert_eq!(special_case_rate("real_rule", &configs), None);
    }
}
