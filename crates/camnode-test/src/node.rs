//! TestNode: a command router wired to fake drivers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use camnode_lib::bus::Publisher;
use camnode_lib::camera::{Camera, FrameSource};
use camnode_lib::capture::{CapturePipeline, CaptureSettings};
use camnode_lib::config_store::{keys, ConfigStore, NAMESPACE};
use camnode_lib::hardware::{Actuators, Sensors, SystemProbe};
use camnode_lib::publisher::StatusPublisher;
use camnode_lib::router::{CommandRouter, Devices};
use camnode_lib::store::{KvStore, MemoryKvStore};
use camnode_lib::upload::{UploadSettings, Uploader};
use camnode_telemetry::MetricsRegistry;

use crate::fakes::{FakeCamera, FixedProbe, FixedSensors, RecordingActuators, RecordingBus};

/// Router harness.
///
/// Holds every fake so tests can inspect what the router did. Capture runs
/// with no settle delay and short timeouts.
pub struct TestNode {
    pub camera: Arc<FakeCamera>,
    pub bus: Arc<RecordingBus>,
    pub actuators: Arc<RecordingActuators>,
    pub sensors: Arc<FixedSensors>,
    pub store: Arc<dyn KvStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub frames: FrameSource,
    pub capture: CaptureSettings,
    pub upload: UploadSettings,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_camera(FakeCamera::new())
    }

    pub fn with_camera(camera: FakeCamera) -> Self {
        Self::build(camera, Arc::new(MemoryKvStore::new()))
    }

    /// A node whose config store is `store`.
    pub fn with_store(store: Arc<dyn KvStore>) -> Self {
        Self::build(FakeCamera::new(), store)
    }

    fn build(camera: FakeCamera, store: Arc<dyn KvStore>) -> Self {
        let camera = Arc::new(camera);
        let frames = FrameSource::new(Arc::clone(&camera) as Arc<dyn Camera>);
        Self {
            camera,
            bus: Arc::new(RecordingBus::new()),
            actuators: Arc::new(RecordingActuators::new()),
            sensors: Arc::new(FixedSensors::default()),
            store,
            metrics: Arc::new(MetricsRegistry::new()),
            frames,
            capture: CaptureSettings {
                settle_delay: Duration::ZERO,
                checkout_wait: Duration::from_millis(500),
                ..CaptureSettings::default()
            },
            upload: UploadSettings {
                connect_timeout: Duration::from_secs(2),
                response_timeout: Duration::from_secs(2),
            },
        }
    }

    /// Persist an upload URL before the router is built.
    pub fn with_upload_url(self, url: &str) -> Self {
        self.store
            .put(NAMESPACE, &[(keys::UPLOAD_URL, url.into())])
            .expect("memory store write");
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.upload.response_timeout = timeout;
        self
    }

    pub fn with_checkout_wait(mut self, wait: Duration) -> Self {
        self.capture.checkout_wait = wait;
        self
    }

    pub fn devices(&self) -> Devices {
        Devices {
            camera: Arc::clone(&self.camera) as Arc<dyn Camera>,
            actuators: Arc::clone(&self.actuators) as Arc<dyn Actuators>,
            sensors: Arc::clone(&self.sensors) as Arc<dyn Sensors>,
            probe: Arc::new(FixedProbe::default()) as Arc<dyn SystemProbe>,
        }
    }

    /// A capture pipeline over this node's frame source.
    pub fn pipeline(&self) -> CapturePipeline {
        let uploader = Uploader::new(self.upload).expect("http client");
        CapturePipeline::new(
            self.frames.clone(),
            uploader,
            self.capture,
            Arc::clone(&self.metrics),
        )
    }

    /// Load the config and build a router, as a boot would.
    pub fn router(&self) -> CommandRouter {
        let config = ConfigStore::load(Arc::clone(&self.store));
        let devices = self.devices();
        let publisher = StatusPublisher::new(
            Arc::clone(&self.bus) as Arc<dyn Publisher>,
            &config.config().mqtt_client_id,
            Arc::clone(&devices.camera),
            Arc::clone(&devices.probe),
            Arc::clone(&self.metrics),
        );
        CommandRouter::new(
            config,
            &devices,
            self.pipeline(),
            publisher,
            Arc::clone(&self.metrics),
        )
    }

    /// Results published so far.
    pub fn results(&self) -> Vec<Value> {
        self.bus.results()
    }

    /// The only result published so far.
    pub fn single_result(&self) -> Value {
        let results = self.results();
        assert_eq!(results.len(), 1, "expected one result, got {results:?}");
        results.into_iter().next().unwrap_or(Value::Null)
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}
