//! Operational counters owned by the controller
//!
//! The device runs a single loop, so the counters are plain integers on an
//! owned struct rather than a global collector.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters for one process lifetime
#[derive(Debug, Clone)]
pub struct DeviceMetrics {
    started_at: DateTime<Utc>,
    cycles: u64,
    readings_published: u64,
    sensor_faults: u64,
    iteration_faults: u64,
    commands_handled: u64,
    pings: u64,
    reconnects: u64,
}

/// Point-in-time copy of [`DeviceMetrics`], suitable for logging or publishing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub cycles: u64,
    pub readings_published: u64,
    pub sensor_faults: u64,
    pub iteration_faults: u64,
    pub commands_handled: u64,
    pub pings: u64,
    pub reconnects: u64,
}

impl DeviceMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            cycles: 0,
            readings_published: 0,
            sensor_faults: 0,
            iteration_faults: 0,
            commands_handled: 0,
            pings: 0,
            reconnects: 0,
        }
    }

    pub fn cycle_completed(&mut self) {
        self.cycles += 1;
    }

    pub fn reading_published(&mut self) {
        self.readings_published += 1;
    }

    pub fn sensor_faults_observed(&mut self, count: usize) {
        self.sensor_faults += count as u64;
    }

    pub fn iteration_failed(&mut self) {
        self.iteration_faults += 1;
    }

    pub fn command_handled(&mut self) {
        self.commands_handled += 1;
    }

    pub fn ping_sent(&mut self) {
        self.pings += 1;
    }

    /// The session owns the reconnect counter; this mirrors its latest value
    pub fn set_reconnects(&mut self, reconnects: u32) {
        self.reconnects = u64::from(reconnects);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        MetricsSnapshot {
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds().max(0),
            cycles: self.cycles,
            readings_published: self.readings_published,
            sensor_faults: self.sensor_faults,
            iteration_faults: self.iteration_faults,
            commands_handled: self.commands_handled,
            pings: self.pings,
            reconnects: self.reconnects,
        }
    }
}

impl Default for DeviceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSnapshot {
    /// One-line summary for the broker's log channel
    pub fn summary(&self) -> String {
        format!(
            "uptime={}s cycles={} readings={} sensor_faults={} iteration_faults={} commands={} pings={} reconnects={}",
            self.uptime_secs,
            self.cycles,
            self.readings_published,
            self.sensor_faults,
            self.iteration_faults,
            self.commands_handled,
            self.pings,
            self.reconnects
        )
    }
}
