#![allow(dead_code)]

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;
use vehicle_lookup::{
    LookupConfig, ManualClock, Plate, RateLimitPolicy, RegistryError, VehicleCategory,
    VehicleDetails, VehicleLookup, VehicleRegistry,
};

pub const START_MILLIS: u64 = 1_700_000_000_000;

/// How the stub registry answers.
#[derive(Debug, Clone)]
pub enum Behaviour {
    Succeed,
    /// Succeed after sleeping.
    Slow(Duration),
    Fail(RegistryError),
    /// Never answer.
    Hang,
    Panic,
}

/// Scripted registry that counts calls.
#[derive(Debug)]
pub struct StubRegistry {
    calls: AtomicUsize,
    behaviour: Mutex<Behaviour>,
}

impl StubRegistry {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), behaviour: Mutex::new(behaviour) })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(Behaviour::Succeed)
    }

    pub fn failing() -> Arc<Self> {
        Self::new(Behaviour::Fail(RegistryError::Http { status: 503 }))
    }

    pub fn set(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VehicleRegistry for StubRegistry {
    async fn fetch(&self, plate: &Plate) -> Result<VehicleDetails, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.behaviour.lock().unwrap().clone();
        match behaviour {
            Behaviour::Succeed => Ok(details_for(plate)),
            Behaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(details_for(plate))
            }
            Behaviour::Fail(err) => Err(err),
            Behaviour::Hang => futures::future::pending().await,
            Behaviour::Panic => panic!("registry exploded"),
        }
    }
}

pub fn details_for(plate: &Plate) -> VehicleDetails {
    VehicleDetails {
        make: Some("FIAT".into()),
        model: Some(format!("UNO {}", plate.as_str())),
        manufacture_year: Some(2012),
        model_year: Some(2013),
        category: Some(VehicleCategory::Car),
        color: Some("PRATA".into()),
        chassis: Some("9BD15802AC6712345".into()),
        registration_number: Some("00123456789".into()),
    }
}

/// Test-tier config with the given quota per minute.
pub fn config(max_per_window: u32) -> LookupConfig {
    let mut config = LookupConfig::for_environment(vehicle_lookup::Environment::Test);
    config.rate_limit = RateLimitPolicy::new(max_per_window, Duration::from_secs(60)).unwrap();
    config
}

/// Service on a manual clock.
pub fn service(
    registry: Arc<StubRegistry>,
    config: LookupConfig,
) -> (VehicleLookup, ManualClock) {
    let clock = ManualClock::starting_at(START_MILLIS);
    let lookup =
        VehicleLookup::builder(registry).config(config).clock(Arc::new(clock.clone())).build();
    (lookup, clock)
}

/// Captured fmt-subscriber output.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route this thread's events into a buffer until the guard drops.
/// Pair with single-threaded runtimes.
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (capture, tracing::subscriber::set_default(subscriber))
}
