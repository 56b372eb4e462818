//! Main device loop
//!
//! Each iteration ticks the keepalive (ping + one inbound command), samples
//! every sensor, reports faults and publishes readings, then sleeps. Errors
//! and panics are caught at the iteration boundary and answered with the
//! longer error backoff; only the shutdown signal ends the loop.

use crate::commands::CheckInHandler;
use crate::config::DeviceConfig;
use crate::cycle_span;
use crate::error::{DeviceError, DeviceResult};
use crate::keepalive::KeepaliveScheduler;
use crate::observability::DeviceMetrics;
use crate::protocol::TopicBuilder;
use crate::reporter::TelemetryReporter;
use crate::sensors::SensorPoller;
use crate::session::{DispatchOutcome, Session};
use crate::shutdown::ShutdownSignal;
use crate::transport::{ConnectParams, Connector, DeliveryLevel};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// Loop timing taken from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub sample_interval: Duration,
    pub error_backoff: Duration,
    pub keepalive: Duration,
    pub keepalive_margin: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            sample_interval: config.sample_interval(),
            error_backoff: config.error_backoff(),
            keepalive: config.keepalive(),
            keepalive_margin: Duration::from_secs(config.keepalive_margin_secs),
        }
    }
}

/// Lifecycle of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, not yet connected
    Starting,
    Running,
    /// Interrupt received; the current iteration is finishing
    ShuttingDown,
    Stopped,
}

/// Owns the session, the poller and the counters for the life of the process
pub struct Controller<C: Connector> {
    settings: ControllerSettings,
    identity: String,
    location: Option<String>,
    session: Session<C>,
    keepalive: KeepaliveScheduler,
    poller: SensorPoller,
    metrics: DeviceMetrics,
    shutdown: ShutdownSignal,
    state: ControllerState,
}

impl<C: Connector> Controller<C> {
    pub fn new(
        config: &DeviceConfig,
        connector: C,
        poller: SensorPoller,
        shutdown: ShutdownSignal,
    ) -> Self {
        let settings = ControllerSettings::from_config(config);
        let identity = config.identity();
        let params = ConnectParams::from_config(config, identity.clone());
        let session = Session::new(connector, params).with_shutdown(shutdown.clone());
        let keepalive = KeepaliveScheduler::new(settings.keepalive, settings.keepalive_margin);

        Self {
            settings,
            identity,
            location: config.location.clone(),
            session,
            keepalive,
            poller,
            metrics: DeviceMetrics::new(),
            shutdown,
            state: ControllerState::Starting,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn metrics(&self) -> &DeviceMetrics {
        &self.metrics
    }

    pub fn session(&self) -> &Session<C> {
        &self.session
    }

    /// Connect, register command handlers and announce on the log channel
    pub async fn start(&mut self) -> DeviceResult<()> {
        info!(identity = %self.identity, sensors = self.poller.len(), "Starting telemetry node");

        self.session.connect().await?;

        // The reply carries the location; devices without one answer with their identity
        let reply_as = self
            .location
            .clone()
            .unwrap_or_else(|| self.identity.clone());

        self.session
            .subscribe(
                &TopicBuilder::broadcast_commands(),
                DeliveryLevel::AtLeastOnce,
                CheckInHandler::new(reply_as.clone()),
            )
            .await?;

        if let Some(location) = &self.location {
            self.session
                .subscribe(
                    &TopicBuilder::device_commands(location),
                    DeliveryLevel::AtLeastOnce,
                    CheckInHandler::new(reply_as),
                )
                .await?;
        }

        // The check-in clock starts once the broker knows us
        self.keepalive = KeepaliveScheduler::new(self.settings.keepalive, self.settings.keepalive_margin);

        let announcement = format!(
            "{} online: version {}, {} sensors",
            self.identity,
            env!("CARGO_PKG_VERSION"),
            self.poller.len()
        );
        TelemetryReporter::new(&mut self.session, &self.identity)
            .log(&announcement)
            .await?;

        self.state = ControllerState::Running;
        info!(identity = %self.identity, "Telemetry node running");
        Ok(())
    }

    /// One pass: keepalive tick, sample, report faults, publish readings
    pub async fn run_iteration(&mut self) -> DeviceResult<()> {
        let tick = self.keepalive.tick(&mut self.session).await?;
        if tick.pinged {
            self.metrics.ping_sent();
        }
        if let DispatchOutcome::Handled { topic } = &tick.dispatch {
            debug!(topic = %topic, "Command dispatched");
            self.metrics.command_handled();
        }

        let readings = self.poller.read_all();
        let faults = self.poller.last_faults().to_vec();
        self.metrics.sensor_faults_observed(faults.len());

        let mut reporter = TelemetryReporter::new(&mut self.session, &self.identity);
        for fault in &faults {
            reporter
                .error(&format!("Sensor read error on {}: {}", fault.name, fault.error))
                .await?;
        }
        for reading in &readings {
            reporter.publish_reading(reading).await?;
            self.metrics.reading_published();
        }

        self.metrics.set_reconnects(self.session.reconnect_count());
        self.metrics.cycle_completed();
        Ok(())
    }

    /// Run until shutdown is requested, then disconnect
    pub async fn run(&mut self) -> DeviceResult<()> {
        match self.start().await {
            Ok(()) => {}
            Err(error) if error.is_shutdown() => {
                info!("Shutdown requested before the node came online");
                self.stop().await;
                return Ok(());
            }
            Err(error) => return Err(error),
        }

        let mut cycle: u64 = 0;
        while !self.shutdown.is_requested() {
            cycle += 1;
            let span = cycle_span!(cycle);

            let outcome = AssertUnwindSafe(self.run_iteration().instrument(span))
                .catch_unwind()
                .await;

            let delay = match outcome {
                Ok(Ok(())) => self.settings.sample_interval,
                Ok(Err(error)) if error.is_shutdown() => break,
                Ok(Err(error)) => {
                    self.report_fault(&error).await;
                    self.settings.error_backoff
                }
                Err(panic) => {
                    let error = DeviceError::internal(format!(
                        "iteration panicked: {}",
                        panic_message(panic.as_ref())
                    ));
                    self.report_fault(&error).await;
                    self.settings.error_backoff
                }
            };

            if !self.shutdown.sleep(delay).await {
                break;
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Log, count and (best-effort) publish an iteration fault
    async fn report_fault(&mut self, fault: &DeviceError) {
        error!(error = %fault, backoff_secs = self.settings.error_backoff.as_secs(), "Iteration failed");
        self.metrics.iteration_failed();

        if let Err(publish_error) = TelemetryReporter::new(&mut self.session, &self.identity)
            .error(&fault.to_diagnostic())
            .await
        {
            warn!(error = %publish_error, "Could not report iteration fault");
        }
    }

    async fn stop(&mut self) {
        self.state = ControllerState::ShuttingDown;
        self.metrics.set_reconnects(self.session.reconnect_count());
        let snapshot = self.metrics.snapshot();
        let health = self.session.health();
        info!(metrics = ?snapshot, link = ?health, "Telemetry node stopping");

        if self.session.is_connected() {
            let link_uptime = health.uptime.map(|uptime| uptime.as_secs()).unwrap_or(0);
            let line = format!(
                "{} offline: {} link_uptime={}s",
                self.identity,
                snapshot.summary(),
                link_uptime
            );
            if let Err(error) = TelemetryReporter::new(&mut self.session, &self.identity)
                .log(&line)
                .await
            {
                debug!(error = %error, "Offline announcement not sent");
            }
        }

        self.session.disconnect().await;
        self.state = ControllerState::Stopped;
        info!("Telemetry node stopped");
    }
}

/// Best-effort text of a panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
