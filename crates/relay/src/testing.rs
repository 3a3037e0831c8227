use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;

use crate::config::{Compression, Config};
use crate::exporter::{ExportError, Exporter};
use crate::impressions::{ImpressionsBatch, ImpressionsMode, KeyImpression, SdkMetadata};

/// One call to an in-memory exporter.
#[derive(Debug, Clone)]
pub struct Exported {
    pub metadata: SdkMetadata,
    pub mode: ImpressionsMode,
    pub batches: Vec<ImpressionsBatch>,
}

#[derive(Clone, Default)]
pub struct RecordingExporter {
    pub exports: Arc<Mutex<Vec<Exported>>>,
}

impl RecordingExporter {
    pub fn snapshot(&self) -> Vec<Exported> {
        self.exports.lock().unwrap().clone()
    }

    pub fn record_count(&self) -> usize {
        self.snapshot()
            .iter()
            .flat_map(|e| &e.batches)
            .map(ImpressionsBatch::len)
            .sum()
    }

    /// Poll until at least `min_expected` exports arrived or `timeout` elapsed.
    pub async fn wait_for(&self, min_expected: usize, timeout: Duration) -> Vec<Exported> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.snapshot();
            if current.len() >= min_expected || tokio::time::Instant::now() >= deadline {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Exporter for RecordingExporter {
    async fn export(
        &self,
        metadata: &SdkMetadata,
        mode: ImpressionsMode,
        batches: &[ImpressionsBatch],
    ) -> Result<(), ExportError> {
        self.exports.lock().unwrap().push(Exported {
            metadata: metadata.clone(),
            mode,
            batches: batches.to_vec(),
        });
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FailingExporter {
    pub attempts: Arc<Mutex<usize>>,
}

impl Exporter for FailingExporter {
    async fn export(
        &self,
        _metadata: &SdkMetadata,
        _mode: ImpressionsMode,
        _batches: &[ImpressionsBatch],
    ) -> Result<(), ExportError> {
        *self.attempts.lock().unwrap() += 1;
        Err(ExportError::Rejected {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        })
    }
}

/// Panics on its first call, then records like `RecordingExporter`.
#[derive(Clone, Default)]
pub struct PanicOnceExporter {
    panicked: Arc<AtomicBool>,
    pub inner: RecordingExporter,
}

impl Exporter for PanicOnceExporter {
    async fn export(
        &self,
        metadata: &SdkMetadata,
        mode: ImpressionsMode,
        batches: &[ImpressionsBatch],
    ) -> Result<(), ExportError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("exporter blew up");
        }
        self.inner.export(metadata, mode, batches).await
    }
}

/// Waits before recording, to keep a flush in flight.
#[derive(Clone, Default)]
pub struct SlowExporter {
    pub inner: RecordingExporter,
}

impl Exporter for SlowExporter {
    async fn export(
        &self,
        metadata: &SdkMetadata,
        mode: ImpressionsMode,
        batches: &[ImpressionsBatch],
    ) -> Result<(), ExportError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.inner.export(metadata, mode, batches).await
    }
}

pub fn impression(key: &str, treatment: &str) -> KeyImpression {
    KeyImpression {
        key_name: key.to_owned(),
        treatment: treatment.to_owned(),
        time: 1234567890,
        change_number: 9876543210,
        label: format!("label_{key}"),
        bucketing_key: format!("bucket_{key}"),
    }
}

pub fn batch(test_name: &str, keys: &[&str]) -> ImpressionsBatch {
    ImpressionsBatch {
        test_name: test_name.to_owned(),
        key_impressions: keys.iter().map(|k| impression(k, "on")).collect(),
    }
}

/// The two-record payload SDKs send in the common case.
pub fn sample_payload() -> Vec<u8> {
    let batches = vec![ImpressionsBatch {
        test_name: "some_test".into(),
        key_impressions: vec![impression("some_key_1", "on"), impression("some_key_2", "off")],
    }];
    serde_json::to_vec(&batches).unwrap()
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Bind to port 0 and return the OS-assigned port.
/// The listener is dropped, freeing the port for the caller to rebind.
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn dummy_config(events_url: &str) -> Config {
    Config {
        sdk_url: url::Url::parse(events_url).unwrap(),
        events_url: url::Url::parse(events_url).unwrap(),
        listener_port: 0,
        api_key: None,
        impressions_threshold: 200,
        impressions_workers: 2,
        flush_interval: Duration::from_millis(200),
        queue_capacity: 64,
        export_timeout: Duration::from_millis(500),
        compression: Compression::None,
    }
}

/// A request captured by [`Collector`]. Header names are lower-case.
#[derive(Debug, Clone)]
pub struct CollectedRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl CollectedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn batches(&self) -> Vec<ImpressionsBatch> {
        serde_json::from_slice(&self.body).unwrap()
    }
}

type CollectorStore = Arc<Mutex<Vec<CollectedRequest>>>;

/// Stand-in for the upstream events API: records every request it receives
/// and answers with a configurable status.
pub struct Collector {
    pub base_url: String,
    store: CollectorStore,
    status: Arc<AtomicU16>,
}

impl Collector {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/api", listener.local_addr().unwrap());
        let store: CollectorStore = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(AtomicU16::new(StatusCode::OK.as_u16()));

        let (store_clone, status_clone) = (store.clone(), status.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let store = store_clone.clone();
                let status = status_clone.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| capture(req, store.clone(), status.clone()));
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            base_url,
            store,
            status,
        }
    }

    pub fn respond_with(&self, status: StatusCode) {
        self.status.store(status.as_u16(), Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CollectedRequest> {
        self.store.lock().unwrap().clone()
    }

    /// Poll until at least `min_expected` requests arrived or `timeout` elapsed.
    pub async fn wait_for(&self, min_expected: usize, timeout: Duration) -> Vec<CollectedRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.requests();
            if current.len() >= min_expected || tokio::time::Instant::now() >= deadline {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn capture(
    req: Request<hyper::body::Incoming>,
    store: CollectorStore,
    status: Arc<AtomicU16>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_owned();
    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned())))
        .collect();
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    store.lock().unwrap().push(CollectedRequest {
        path,
        headers,
        body,
    });

    let status = StatusCode::from_u16(status.load(Ordering::SeqCst)).unwrap();
    Ok(Response::builder()
        .status(status)
        .body(Full::default())
        .unwrap())
}
