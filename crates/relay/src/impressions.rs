use std::fmt;

use serde::{Deserialize, Serialize};

/// One flag evaluation for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyImpression {
    pub key_name: String,
    pub treatment: String,
    pub time: i64,
    pub change_number: i64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub bucketing_key: String,
}

/// Impressions for a single test, in the order the SDK recorded them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionsBatch {
    pub test_name: String,
    pub key_impressions: Vec<KeyImpression>,
}

impl ImpressionsBatch {
    pub fn len(&self) -> usize {
        self.key_impressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_impressions.is_empty()
    }
}

/// Identity of the SDK instance that reported a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SdkMetadata {
    pub version: String,
    pub machine_ip: String,
    pub machine_name: String,
}

impl SdkMetadata {
    pub fn new(version: &str, machine_ip: &str, machine_name: &str) -> Self {
        Self {
            version: version.to_owned(),
            machine_ip: machine_ip.to_owned(),
            machine_name: machine_name.to_owned(),
        }
    }
}

/// Collection mode requested by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImpressionsMode {
    Debug,
    Optimized,
    Unspecified,
}

impl ImpressionsMode {
    /// Case-insensitive. Anything unrecognised is `Unspecified`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("debug") {
            ImpressionsMode::Debug
        } else if raw.eq_ignore_ascii_case("optimized") {
            ImpressionsMode::Optimized
        } else {
            ImpressionsMode::Unspecified
        }
    }

    /// Value for the `SplitSDKImpressionsMode` header, `None` when the header
    /// must be left out.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            ImpressionsMode::Debug => Some("debug"),
            ImpressionsMode::Optimized => Some("optimized"),
            ImpressionsMode::Unspecified => None,
        }
    }
}

impl fmt::Display for ImpressionsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_value().unwrap_or("unspecified"))
    }
}

/// Unit of work handed from ingestion to the worker pool.
#[derive(Debug, Clone)]
pub struct ImpressionsJob {
    pub metadata: SdkMetadata,
    pub mode: ImpressionsMode,
    pub batches: Vec<ImpressionsBatch>,
}

impl ImpressionsJob {
    pub fn record_count(&self) -> usize {
        count_records(&self.batches)
    }
}

pub fn count_records(batches: &[ImpressionsBatch]) -> usize {
    batches.iter().map(ImpressionsBatch::len).sum()
}
