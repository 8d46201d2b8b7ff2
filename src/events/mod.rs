//! Exposure and custom events, and their delivery.
mod event;
mod exposures;
mod logger;
mod queue;

pub use event::{
    LogEvent, CONFIG_EXPOSURE_EVENT, DIAGNOSTICS_EVENT, GATE_EXPOSURE_EVENT, LAYER_EXPOSURE_EVENT,
};
pub(crate) use exposures::ExposureLogger;
pub use logger::{EventLogger, EventLoggerConfig, EventLoggingAdapter, HttpEventLoggingAdapter};
pub use queue::{EventQueue, MAX_BATCH_SIZE, MIN_BATCH_SIZE};
