//! TestStream: the stream server on a loopback port.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use camnode_lib::camera::{Camera, FrameSource};
use camnode_lib::stream::StreamServer;
use camnode_telemetry::MetricsRegistry;

use crate::fakes::FakeCamera;

/// Errors from TestStream operations.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A running stream server with an HTTP client pointed at it.
pub struct TestStream {
    pub camera: Arc<FakeCamera>,
    pub server: Arc<StreamServer>,
    pub metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
    client: reqwest::Client,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TestStream {
    pub async fn start(camera: FakeCamera, max_viewers: usize) -> Result<Self, TestError> {
        let camera = Arc::new(camera);
        let metrics = Arc::new(MetricsRegistry::new());
        let frames = FrameSource::new(Arc::clone(&camera) as Arc<dyn Camera>);
        let server = StreamServer::new(frames, max_viewers, Arc::clone(&metrics));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&server).serve(listener, shutdown_rx));

        Ok(Self {
            camera,
            server,
            metrics,
            addr,
            client: reqwest::Client::new(),
            shutdown,
            task: Some(task),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response, TestError> {
        Ok(self.client.get(self.url(path)).send().await?)
    }

    pub async fn post(&self, path: &str) -> Result<reqwest::Response, TestError> {
        Ok(self.client.post(self.url(path)).send().await?)
    }

    /// Stop accepting connections and wait for the accept loop to end.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TestStream {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
