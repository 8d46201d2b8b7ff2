use std::sync::Arc;

use crate::{
    eval::EvalResult,
    events::{EventLogger, LogEvent},
    sampling::{ExposureSample, SamplingProcessor, SamplingStatus},
    specs::store::SpecStore,
    User,
};

/// Turns evaluation results into exposure events, subject to sampling.
pub(crate) struct ExposureLogger {
    store: Arc<SpecStore>,
    sampling: SamplingProcessor,
    event_logger: Arc<EventLogger>,
}

impl ExposureLogger {
    pub(crate) fn new(
        store: Arc<SpecStore>,
        sampling: SamplingProcessor,
        event_logger: Arc<EventLogger>,
    ) -> ExposureLogger {
        ExposureLogger {
            store,
            sampling,
            event_logger,
        }
    }

    pub(crate) fn log_gate(&self, user: &User, gate_name: &str, result: &EvalResult) {
        if let Some(sampling) = self.decide(user, gate_name, result, None) {
            self.event_logger
                .enqueue(LogEvent::gate_exposure(user, gate_name, result, &sampling));
        }
    }

    pub(crate) fn log_config(&self, user: &User, config_name: &str, result: &EvalResult) {
        if let Some(sampling) = self.decide(user, config_name, result, None) {
            self.event_logger
                .enqueue(LogEvent::config_exposure(user, config_name, result, &sampling));
        }
    }

    pub(crate) fn log_layer_parameter(
        &self,
        user: &User,
        layer_name: &str,
        parameter_name: &str,
        result: &EvalResult,
    ) {
        let allocated = result.config_delegate.as_deref().unwrap_or_default();
        if let Some(sampling) =
            self.decide(user, layer_name, result, Some((allocated, parameter_name)))
        {
            self.event_logger.enqueue(LogEvent::layer_exposure(
                user,
                layer_name,
                parameter_name,
                result,
                &sampling,
            ));
        }
    }

    fn decide(
        &self,
        user: &User,
        name: &str,
        result: &EvalResult,
        layer_parameter: Option<(&str, &str)>,
    ) -> Option<SamplingStatus> {
        let snapshot = self.store.snapshot();
        let sample = ExposureSample {
            name,
            result,
            user,
            layer_parameter,
        };
        let status = self.sampling.decide(&sample, &snapshot.specs.sdk_configs);
        if !status.should_log {
            log::trace!(target: "featuregate", name, rule_id = result.rule_id.as_str(); "exposure sampled out");
            return None;
        }
        Some(status)
    }

    /// Forget sampling state.
    pub(crate) fn reset(&self) {
        self.sampling.reset();
    }
}
