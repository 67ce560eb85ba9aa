//! Fan-out dispatcher.
//!
//! Runs one unit of work per device. Units either run strictly in index order
//! (device auto-creation) or as tasks on the shared worker pool. Every unit is
//! bounded by the dispatch timeout; a unit that exceeds it is reported as a
//! timeout for its device and the others keep running.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use dynmapper_core::ServiceConfiguration;

use crate::context::DeviceOutcome;
use crate::error::ProcessingError;

/// Unit of work for one device.
pub type DeviceUnit = BoxFuture<'static, DeviceOutcome>;

/// How the units of one message are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One after another in device index order.
    Sequential,
    /// Concurrently on the worker pool.
    Parallel,
}

/// Bounded executor for device units, shared across tenants.
#[derive(Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    unit_timeout: Duration,
}

impl Dispatcher {
    pub fn new(worker_pool_size: usize, unit_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            unit_timeout,
        }
    }

    pub fn from_config(config: &ServiceConfiguration) -> Self {
        Self::new(config.worker_pool_size, config.dispatch_timeout())
    }

    pub fn unit_timeout(&self) -> Duration {
        self.unit_timeout
    }

    /// Free worker slots.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run all units and return their outcomes in index order.
    pub async fn dispatch(&self, mode: DispatchMode, units: Vec<DeviceUnit>) -> Vec<DeviceOutcome> {
        match mode {
            DispatchMode::Sequential => self.run_sequential(units).await,
            DispatchMode::Parallel => self.run_parallel(units).await,
        }
    }

    async fn run_sequential(&self, units: Vec<DeviceUnit>) -> Vec<DeviceOutcome> {
        let mut outcomes = Vec::with_capacity(units.len());
        for (index, unit) in units.into_iter().enumerate() {
            let outcome = match tokio::time::timeout(self.unit_timeout, unit).await {
                Ok(outcome) => outcome,
                Err(_) => self.timed_out(index),
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run_parallel(&self, units: Vec<DeviceUnit>) -> Vec<DeviceOutcome> {
        let handles: Vec<_> = units
            .into_iter()
            .map(|unit| {
                let permits = self.permits.clone();
                let unit_timeout = self.unit_timeout;
                tokio::spawn(async move {
                    tokio::time::timeout(unit_timeout, async move {
                        // the semaphore is never closed
                        let _permit = permits.acquire_owned().await.ok();
                        unit.await
                    })
                    .await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => self.timed_out(index),
                Err(e) => DeviceOutcome::failed(
                    index,
                    Vec::new(),
                    ProcessingError::TaskFailed {
                        device_index: index,
                        reason: e.to_string(),
                    },
                ),
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    fn timed_out(&self, index: usize) -> DeviceOutcome {
        tracing::warn!("Device unit {} timed out after {:?}", index, self.unit_timeout);
        DeviceOutcome::failed(
            index,
            Vec::new(),
            ProcessingError::Timeout {
                device_index: index,
                timeout_ms: self.unit_timeout.as_millis() as u64,
            },
        )
    }
}
