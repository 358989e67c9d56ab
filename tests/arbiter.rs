use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;

use bitalino_acq::{
    AcquisitionRequest, Arbiter, ArbiterConfig, Backoff, ConnectionConfig, Connector, DriverError,
    ErrorKind, SimulatedTransport, Transport, TransportError, TransportErrorKind, TransportKind,
};

#[derive(Clone, Copy)]
enum Behavior {
    Healthy,
    /// The first `n` connects fail with `kind`.
    FailConnects(usize, TransportErrorKind),
    /// Connects fine but never sends a byte.
    Silent,
}

#[derive(Default)]
struct Probe {
    connects: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    spans: Mutex<Vec<(String, Instant, Instant)>>,
}

impl Probe {
    fn spans_for(&self, address: &str) -> Vec<(Instant, Instant)> {
        let mut spans: Vec<_> = self
            .spans
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _, _)| a == address)
            .map(|(_, enter, exit)| (*enter, *exit))
            .collect();
        spans.sort();
        spans
    }
}

struct InstrumentedConnector {
    probe: Arc<Probe>,
    behavior: Behavior,
}

impl InstrumentedConnector {
    fn new(behavior: Behavior) -> (Arc<Self>, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let connector = Arc::new(Self {
            probe: probe.clone(),
            behavior,
        });
        (connector, probe)
    }
}

impl Connector for InstrumentedConnector {
    fn connect(&self, address: &str) -> Result<Box<dyn Transport>, DriverError> {
        let n = self.probe.connects.fetch_add(1, Ordering::SeqCst);
        if let Behavior::FailConnects(failures, kind) = self.behavior {
            if n < failures {
                return Err(DriverError::connection(
                    address,
                    TransportError::new(kind, "injected failure"),
                ));
            }
        }

        let live = self.probe.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(InstrumentedTransport {
            inner: SimulatedTransport::new().realtime(true),
            silent: matches!(self.behavior, Behavior::Silent),
            probe: self.probe.clone(),
            address: address.to_string(),
            entered: Instant::now(),
            closed: false,
        }))
    }
}

struct InstrumentedTransport {
    inner: SimulatedTransport,
    silent: bool,
    probe: Arc<Probe>,
    address: String,
    entered: Instant,
    closed: bool,
}

impl InstrumentedTransport {
    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.probe.live.fetch_sub(1, Ordering::SeqCst);
        self.probe
            .spans
            .lock()
            .unwrap()
            .push((self.address.clone(), self.entered, Instant::now()));
    }
}

impl Transport for InstrumentedTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.silent {
            std::thread::sleep(Duration::from_millis(1));
            return Ok(0);
        }
        self.inner.read(buf)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.inner.write(bytes)
    }

    fn close(&mut self) {
        self.inner.close();
        self.finish();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }
}

impl Drop for InstrumentedTransport {
    fn drop(&mut self) {
        self.finish();
    }
}

fn arbiter(connector: Arc<InstrumentedConnector>) -> Arbiter {
    let config = ArbiterConfig {
        max_attempts: 3,
        retry_backoff: Backoff::Linear(Duration::from_millis(10)),
        read_timeout: Duration::from_millis(500),
        ..ArbiterConfig::default()
    };
    let connection = ConnectionConfig {
        command_delay: Duration::ZERO,
        ..ConnectionConfig::default()
    };
    Arbiter::new(connector, config, connection)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_address_never_overlaps() {
    let (connector, probe) = InstrumentedConnector::new(Behavior::Healthy);
    let arbiter = arbiter(connector);

    let requests = (0..4).map(|_| {
        let arbiter = arbiter.clone();
        async move {
            arbiter
                .acquire(AcquisitionRequest::new("98:D3:51:FE:6F:A3", 100, 5).with_channels([0, 1]))
                .await
        }
    });
    for result in join_all(requests).await {
        assert_eq!(result.unwrap().matrix.shape(), (7, 5));
    }

    let spans = probe.spans_for("98:D3:51:FE:6F:A3");
    assert_eq!(spans.len(), 4);
    for pair in spans.windows(2) {
        assert!(pair[1].0 >= pair[0].1, "sessions overlapped: {pair:?}");
    }
    assert_eq!(probe.max_live.load(Ordering::SeqCst), 1);
    assert!(arbiter.locks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_addresses_run_in_parallel() {
    let (connector, probe) = InstrumentedConnector::new(Behavior::Healthy);
    let arbiter = arbiter(connector);

    let requests = ["/dev/ttyUSB0", "/dev/ttyUSB1"].map(|address| {
        let arbiter = arbiter.clone();
        async move {
            arbiter
                .acquire(AcquisitionRequest::new(address, 100, 20).with_channels([0]))
                .await
        }
    });
    for result in join_all(requests).await {
        assert!(result.is_ok());
    }

    assert_eq!(probe.max_live.load(Ordering::SeqCst), 2);
    assert!(arbiter.locks().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failure_is_retried() {
    let (connector, probe) = InstrumentedConnector::new(Behavior::FailConnects(1, TransportErrorKind::Reset));
    let arbiter = arbiter(connector);

    let acquisition = arbiter
        .acquire(AcquisitionRequest::new("/dev/ttyUSB0", 1000, 10))
        .await
        .unwrap();
    assert_eq!(acquisition.attempts, 2);
    assert_eq!(probe.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_device_is_not_retried() {
    let (connector, probe) = InstrumentedConnector::new(Behavior::FailConnects(5, TransportErrorKind::Busy));
    let arbiter = arbiter(connector);

    let err = arbiter
        .acquire(AcquisitionRequest::new("/dev/ttyUSB0", 1000, 10))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::DeviceBusy);
    assert_eq!(err.status_code(), 409);
    assert_eq!(err.attempts, 1);
    assert_eq!(probe.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_rate_never_connects() {
    let (connector, probe) = InstrumentedConnector::new(Behavior::Healthy);
    let arbiter = arbiter(connector);

    let err = arbiter
        .acquire(AcquisitionRequest::new("/dev/ttyUSB0", 7, 10))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);
    assert_eq!(probe.connects.load(Ordering::SeqCst), 0);
    assert!(arbiter.locks().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_device_times_out_after_all_attempts() {
    let (connector, probe) = InstrumentedConnector::new(Behavior::Silent);
    let config = ArbiterConfig {
        read_timeout: Duration::from_millis(50),
        retry_backoff: Backoff::Fixed(Duration::from_millis(5)),
        ..ArbiterConfig::default()
    };
    let connection = ConnectionConfig {
        command_delay: Duration::ZERO,
        ..ConnectionConfig::default()
    };
    let arbiter = Arbiter::new(connector, config, connection);

    let err = arbiter
        .acquire(AcquisitionRequest::new("/dev/ttyUSB0", 1000, 10))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(err.status_code(), 504);
    assert_eq!(err.attempts, 3);
    assert!(matches!(err.source, DriverError::Timeout(_)));

    assert_eq!(probe.connects.load(Ordering::SeqCst), 3);
    assert_eq!(probe.live.load(Ordering::SeqCst), 0);
    assert_eq!(probe.spans_for("/dev/ttyUSB0").len(), 3);
    assert!(arbiter.locks().is_empty());
}
