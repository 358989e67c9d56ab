//! Single-flight access to devices.
//!
//! Every request for an address runs `open -> start -> read -> stop/close`
//! while holding that address's lock, so two sessions never talk to the same
//! device at once. Requests for different addresses run in parallel on
//! tokio's blocking pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::acquisition::SampleMatrix;
use crate::bitalino::{Bitalino, ChannelSet, SamplingRate};
use crate::config::{ArbiterConfig, ConnectionConfig};
use crate::errors::{DriverError, ErrorKind, Result};
use crate::retry::RetryState;
use crate::simulator::SimulatedConnector;
use crate::transport::{Connector, SystemConnector};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Address -> exclusive lock, created on first use and dropped again once
/// nobody holds or waits for it.
#[derive(Clone, Default)]
pub struct DeviceLockTable {
    locks: Arc<Mutex<LockMap>>,
}

impl DeviceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `address`. Waiters are served in order.
    pub async fn lock(&self, address: &str) -> DeviceLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        debug!("device lock taken: {}", address);
        DeviceLease {
            address: address.to_string(),
            guard: Some(guard),
            lock,
            locks: self.locks.clone(),
        }
    }

    /// Number of addresses currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one address; released on drop.
pub struct DeviceLease {
    address: String,
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<AsyncMutex<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl DeviceLease {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn release(self) {}
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // Only the table and this lease still point at the lock: no waiters.
        if Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.address)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock))
        {
            locks.remove(&self.address);
        }
        debug!("device lock released: {}", self.address);
    }
}

/// What to acquire and from where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    pub address: String,
    pub sampling_rate: u16,
    pub n_samples: usize,
    #[serde(default = "all_channels")]
    pub channels: Vec<u8>,
}

fn all_channels() -> Vec<u8> {
    ChannelSet::all().as_slice().to_vec()
}

impl AcquisitionRequest {
    /// All six analog channels.
    pub fn new(address: impl Into<String>, sampling_rate: u16, n_samples: usize) -> Self {
        Self {
            address: address.into(),
            sampling_rate,
            n_samples,
            channels: all_channels(),
        }
    }

    /// `sampling_rate × seconds` samples.
    pub fn for_duration(address: impl Into<String>, sampling_rate: u16, seconds: f64) -> Self {
        let n_samples = (sampling_rate as f64 * seconds.max(0.0)).round() as usize;
        Self::new(address, sampling_rate, n_samples)
    }

    pub fn with_channels(mut self, channels: impl Into<Vec<u8>>) -> Self {
        self.channels = channels.into();
        self
    }

    fn validate(&self) -> Result<(SamplingRate, ChannelSet)> {
        let rate = SamplingRate::try_from(self.sampling_rate)?;
        let channels = ChannelSet::new(&self.channels)?;
        if self.n_samples == 0 {
            return Err(DriverError::Configuration(
                "number of samples must be positive".into(),
            ));
        }
        Ok((rate, channels))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Acquisition {
    pub address: String,
    pub sampling_rate: SamplingRate,
    pub channels: ChannelSet,
    pub matrix: SampleMatrix,
    /// Attempts used, counting the successful one.
    pub attempts: u32,
}

/// Final failure of a request, after retries.
#[derive(Debug, Error)]
#[error("{address}: {kind:?} after {attempts} attempt(s): {source}")]
pub struct AcquisitionError {
    pub address: String,
    pub kind: ErrorKind,
    pub attempts: u32,
    #[source]
    pub source: DriverError,
}

impl AcquisitionError {
    fn new(address: &str, attempts: u32, source: DriverError) -> Self {
        Self {
            address: address.to_string(),
            kind: source.kind(),
            attempts,
            source,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: ArbiterConfig,
    connection: ConnectionConfig,
    locks: DeviceLockTable,
}

/// Serializes device sessions per address and retries transient failures.
///
/// Cheap to clone; clones share the lock table.
#[derive(Clone)]
pub struct Arbiter {
    inner: Arc<Inner>,
}

impl Arbiter {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ArbiterConfig,
        connection: ConnectionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                connection,
                locks: DeviceLockTable::new(),
            }),
        }
    }

    /// Hardware or simulated connector, depending on `config.use_simulator`.
    pub fn from_config(config: ArbiterConfig, connection: ConnectionConfig) -> Self {
        let connector: Arc<dyn Connector> = if config.use_simulator {
            info!("arbiter using simulated devices");
            Arc::new(SimulatedConnector::new(config.simulator_realtime))
        } else {
            Arc::new(SystemConnector::new(&connection))
        };
        Self::new(connector, config, connection)
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.inner.config
    }

    pub fn locks(&self) -> &DeviceLockTable {
        &self.inner.locks
    }

    /// Run one acquisition under the device lock.
    pub async fn acquire(
        &self,
        request: AcquisitionRequest,
    ) -> std::result::Result<Acquisition, AcquisitionError> {
        let address = request.address.clone();
        self.run_locked(&address, move |inner| inner.acquire_blocking(&request))
            .await
    }

    /// Set the battery threshold and read the battery level, under the lock.
    pub async fn battery(
        &self,
        address: &str,
        threshold: u8,
    ) -> std::result::Result<Option<u8>, AcquisitionError> {
        let owned = address.to_string();
        self.run_locked(address, move |inner| inner.battery_blocking(&owned, threshold))
            .await
    }

    async fn run_locked<T, F>(
        &self,
        address: &str,
        job: F,
    ) -> std::result::Result<T, AcquisitionError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> std::result::Result<T, AcquisitionError> + Send + 'static,
    {
        let lease = self.inner.locks.lock(address).await;
        let inner = self.inner.clone();
        // The lease travels with the job: a caller that goes away cannot
        // free the device while the blocking I/O is still running.
        let handle = tokio::task::spawn_blocking(move || {
            let result = job(&inner);
            lease.release();
            result
        });
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(AcquisitionError::new(
                address,
                0,
                DriverError::Task(e.to_string()),
            )),
        }
    }
}

impl Inner {
    /// Retry `attempt` while it fails transiently and attempts remain.
    fn with_retries<T>(
        &self,
        address: &str,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> std::result::Result<(T, u32), AcquisitionError> {
        let mut retry = RetryState::new(self.config.max_attempts);
        loop {
            let n = retry.begin_attempt();
            match attempt() {
                Ok(value) => return Ok((value, n)),
                Err(err) => {
                    retry.record_failure(err.kind());
                    if !(err.is_transient() && retry.has_remaining()) {
                        warn!("{} failed on attempt {}/{}: {}", address, n, retry.max_attempts(), err);
                        return Err(AcquisitionError::new(address, n, err));
                    }
                    let delay = retry.next_delay(self.config.retry_backoff);
                    warn!(
                        "{} attempt {}/{} failed, retrying in {:?}: {}",
                        address,
                        n,
                        retry.max_attempts(),
                        delay,
                        err
                    );
                    thread::sleep(delay);
                }
            }
        }
    }

    fn acquire_blocking(
        &self,
        request: &AcquisitionRequest,
    ) -> std::result::Result<Acquisition, AcquisitionError> {
        let (rate, channels) = request
            .validate()
            .map_err(|e| AcquisitionError::new(&request.address, 0, e))?;

        info!(
            "acquiring {} samples from {} at {} on {:?}",
            request.n_samples,
            request.address,
            rate,
            channels.as_slice()
        );
        let (matrix, attempts) = self.with_retries(&request.address, || {
            let mut device = Bitalino::open(
                self.connector.as_ref(),
                &request.address,
                request.sampling_rate,
                &self.connection,
            )?;
            let result = device
                .start(channels.as_slice())
                .and_then(|_| device.read(request.n_samples, self.config.read_timeout));
            device.stop();
            device.close();
            result
        })?;

        Ok(Acquisition {
            address: request.address.clone(),
            sampling_rate: rate,
            channels,
            matrix,
            attempts,
        })
    }

    fn battery_blocking(
        &self,
        address: &str,
        threshold: u8,
    ) -> std::result::Result<Option<u8>, AcquisitionError> {
        let (level, _) = self.with_retries(address, || {
            let mut device = Bitalino::open(
                self.connector.as_ref(),
                address,
                SamplingRate::default().hz(),
                &self.connection,
            )?;
            let level = device.battery(threshold);
            device.close();
            level
        })?;
        Ok(level)
    }
}
