//! Cooperative scheduling of device polls, message pumps and the dispatcher.
//!
//! Each [`ScheduledUnit`] runs in its own [`DeviceMonitor`] task:
//!
//! ```text
//! loop while running:
//!     start = now
//!     unit.tick()
//!     sleep(interval - (now - start), floor 0)
//! ```
//!
//! Units share no state with each other. Stopping is cooperative: the
//! `running` flag is checked once per iteration, so a unit finishes the tick it
//! is in before its task exits. On a current-thread runtime the units
//! interleave only at their sleeps.

use crate::device::Device;
use crate::error::DeviceBackendError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Something that is run periodically.
pub trait ScheduledUnit: Send {
    fn name(&self) -> &str;

    /// Target period between the starts of two ticks.
    fn interval(&self) -> Duration;

    fn tick(&mut self) -> Result<(), DeviceBackendError>;
}

/// Polls one device.
pub struct DevicePoller {
    name: String,
    device: Arc<Device>,
    interval: Duration,
}

impl DevicePoller {
    /// `None` when the device has no poll interval.
    pub fn for_device(device: Arc<Device>) -> Option<Self> {
        let interval = device.poll_interval()?;
        Some(Self {
            name: format!("poll:{}", device.name()),
            device,
            interval,
        })
    }
}

impl ScheduledUnit for DevicePoller {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&mut self) -> Result<(), DeviceBackendError> {
        self.device.poll()
    }
}

/// Runs a closure periodically. Used for the OS message pump of callback devices.
pub struct MessagePump {
    name: String,
    interval: Duration,
    step: Box<dyn FnMut() -> Result<(), DeviceBackendError> + Send>,
}

impl MessagePump {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        step: impl FnMut() -> Result<(), DeviceBackendError> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            step: Box::new(step),
        }
    }
}

impl ScheduledUnit for MessagePump {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&mut self) -> Result<(), DeviceBackendError> {
        (self.step)()
    }
}

/// Handle to one running monitor task.
pub struct MonitorHandle {
    name: String,
    running: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.join.is_finished()
    }

    /// Ask the task to stop after its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop and wait for the task to exit.
    pub async fn join(self) {
        self.stop();
        if let Err(e) = self.join.await {
            log::warn!("monitor '{}' ended abnormally: {}", self.name, e);
        }
    }
}

/// Task body driving one [`ScheduledUnit`].
pub struct DeviceMonitor;

impl DeviceMonitor {
    /// Spawn `unit` on the current tokio runtime.
    pub fn spawn(mut unit: Box<dyn ScheduledUnit>) -> MonitorHandle {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let name = unit.name().to_string();
        let join = tokio::spawn(async move {
            log::debug!("monitor '{}' started ({:?})", unit.name(), unit.interval());
            while flag.load(Ordering::Acquire) {
                let start = Instant::now();
                if let Err(e) = unit.tick() {
                    log::warn!("{}", e);
                }
                let sleep_for = unit.interval().saturating_sub(start.elapsed());
                if sleep_for.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(sleep_for).await;
                }
            }
            log::debug!("monitor '{}' stopped", unit.name());
        });
        MonitorHandle { name, running, join }
    }
}

/// The set of running monitors.
#[derive(Default)]
pub struct Scheduler {
    monitors: Vec<MonitorHandle>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, unit: Box<dyn ScheduledUnit>) {
        self.monitors.push(DeviceMonitor::spawn(unit));
    }

    /// Schedule a device's poller and message pump, whichever it has.
    pub fn add_device(&mut self, device: &Arc<Device>) {
        if let Some(poller) = DevicePoller::for_device(device.clone()) {
            self.add(Box::new(poller));
        }
        if let Some(pump) = device.message_pump() {
            self.add(pump);
        }
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.monitors.iter().map(|m| m.name().to_string()).collect()
    }

    /// Signal every monitor, then wait for all of them.
    pub async fn stop_all(&mut self) {
        for m in &self.monitors {
            m.stop();
        }
        for m in self.monitors.drain(..) {
            m.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn pump_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut scheduler = Scheduler::new();
        scheduler.add(Box::new(MessagePump::new("count", Duration::from_millis(2), move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })));

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.stop_all().await;
        let seen = ticks.load(Ordering::Relaxed);
        assert!(seen >= 2, "only {} ticks", seen);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ticks.load(Ordering::Relaxed), seen);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn failing_tick_does_not_stop_unit() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut scheduler = Scheduler::new();
        scheduler.add(Box::new(MessagePump::new("flaky", Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Err(DeviceBackendError::Poll {
                device: "flaky".into(),
                message: "boom".into(),
            })
        })));
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop_all().await;
        assert!(ticks.load(Ordering::Relaxed) >= 2);
    }
}
