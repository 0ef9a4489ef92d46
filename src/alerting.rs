//! Alerting side-channel for operational failures.
//!
//! Every handler boundary reports unexpected errors here in addition to
//! logging them. The default [`TracingAlerter`] emits a structured `error!`
//! event; deployments can plug in their own sink.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::ControllerError;

/// Context attached to an alert (task id, tenant id, ...).
pub type AlertData = BTreeMap<String, Value>;

pub trait Alerter: Send + Sync {
    fn send_alert(&self, err: &ControllerError, data: AlertData);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn send_alert(&self, err: &ControllerError, data: AlertData) {
        let data = serde_json::to_string(&data).unwrap_or_default();
        tracing::error!(error = %err, data = %data, "alert");
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub message: String,
    pub data: AlertData,
}

/// Keeps every alert in memory; useful to assert on in tests.
#[derive(Debug, Default)]
pub struct MemoryAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }
}

impl Alerter for MemoryAlerter {
    fn send_alert(&self, err: &ControllerError, data: AlertData) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(Alert {
                message: err.to_string(),
                data,
            });
        }
    }
}
