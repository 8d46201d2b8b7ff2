//! Structured step markers with timing, collected for the `statsig::diagnostics` event.
use std::{collections::VecDeque, sync::Mutex};

use chrono::Utc;
use serde::Serialize;

/// Upper bound of buffered markers. Older markers are dropped first.
const MAX_MARKERS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerAction {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub key: String,
    pub step: String,
    pub action: MarkerAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub timestamp: i64,
}

/// Receives markers as they are recorded, e.g. to forward them to a metrics system.
pub trait OutputLogger: Send + Sync {
    fn on_marker(&self, marker: &Marker);
}

#[derive(Default)]
pub struct Diagnostics {
    markers: Mutex<VecDeque<Marker>>,
    output: Option<Box<dyn OutputLogger>>,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    pub fn with_output(output: Box<dyn OutputLogger>) -> Diagnostics {
        Diagnostics {
            markers: Mutex::default(),
            output: Some(output),
        }
    }

    pub fn mark(&self, key: &str, step: &str, action: MarkerAction, success: bool) {
        self.push(Marker {
            key: key.to_owned(),
            step: step.to_owned(),
            action,
            success: (action == MarkerAction::End).then_some(success),
            status_code: None,
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    pub fn start(&self, key: &str, step: &str) {
        self.push(Marker {
            key: key.to_owned(),
            step: step.to_owned(),
            action: MarkerAction::Start,
            success: None,
            status_code: None,
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    pub fn end_with_status(&self, key: &str, step: &str, success: bool, status_code: Option<u16>) {
        self.push(Marker {
            key: key.to_owned(),
            step: step.to_owned(),
            action: MarkerAction::End,
            success: Some(success),
            status_code,
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    fn push(&self, marker: Marker) {
        if let Some(output) = &self.output {
            output.on_marker(&marker);
        }
        let mut markers = self
            .markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if markers.len() >= MAX_MARKERS {
            markers.pop_front();
        }
        markers.push_back(marker);
    }

    /// Copy of the buffered markers.
    pub fn markers(&self) -> Vec<Marker> {
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Remove and return the buffered markers.
    pub fn drain(&self) -> Vec<Marker> {
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }
}
