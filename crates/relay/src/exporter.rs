use std::future::Future;
use std::io::Write;

use flate2::write::GzEncoder;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::config::{Compression, Config};
use crate::impressions::{ImpressionsBatch, ImpressionsMode, SdkMetadata};

const IMPRESSIONS_PATH: &str = "testImpressions/bulk";

pub const SDK_VERSION_HEADER: &str = "SplitSDKVersion";
pub const MACHINE_IP_HEADER: &str = "SplitSDKMachineIP";
pub const MACHINE_NAME_HEADER: &str = "SplitSDKMachineName";
pub const IMPRESSIONS_MODE_HEADER: &str = "SplitSDKImpressionsMode";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("invalid impressions endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("upstream rejected impressions: {status}")]
    Rejected { status: reqwest::StatusCode },

    #[error("failed to serialize impressions: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("gzip compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Sends one flush worth of batches upstream.
///
/// All batches passed to a single call share the same client identity.
pub trait Exporter: Send + Sync + 'static {
    fn export(
        &self,
        metadata: &SdkMetadata,
        mode: ImpressionsMode,
        batches: &[ImpressionsBatch],
    ) -> impl Future<Output = Result<(), ExportError>> + Send;
}

pub struct HttpExporter {
    client: Client,
    url: Url,
    compression: Compression,
    api_key: Option<String>,
}

impl HttpExporter {
    pub fn new(config: &Config) -> Result<Self, ExportError> {
        let client = Client::builder()
            .timeout(config.export_timeout)
            .build()
            .map_err(ExportError::ClientBuild)?;

        Ok(Self {
            client,
            url: impressions_url(&config.events_url)?,
            compression: config.compression,
            api_key: config.api_key.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Exporter for HttpExporter {
    async fn export(
        &self,
        metadata: &SdkMetadata,
        mode: ImpressionsMode,
        batches: &[ImpressionsBatch],
    ) -> Result<(), ExportError> {
        let body = serde_json::to_vec(batches)?;
        let body = match self.compression {
            Compression::Gzip => compress_gzip(&body)?,
            Compression::None => body,
        };

        let mut req = self
            .client
            .post(self.url.clone())
            .header("content-type", "application/json")
            .header(SDK_VERSION_HEADER, &metadata.version)
            .header(MACHINE_IP_HEADER, &metadata.machine_ip)
            .header(MACHINE_NAME_HEADER, &metadata.machine_name);

        if let Some(mode) = mode.header_value() {
            req = req.header(IMPRESSIONS_MODE_HEADER, mode);
        }

        if self.compression == Compression::Gzip {
            req = req.header("content-encoding", "gzip");
        }

        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let resp = req.body(body).send().await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ExportError::Rejected {
                status: resp.status(),
            })
        }
    }
}

/// `{events_url}/testImpressions/bulk`, keeping any path prefix on the base.
fn impressions_url(base: &Url) -> Result<Url, url::ParseError> {
    let base = base.as_str().trim_end_matches('/');
    Url::parse(&format!("{base}/{IMPRESSIONS_PATH}"))
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}
