pub mod cache;
pub mod config;
pub mod counter;
pub mod exporter;
pub mod flush_trigger;
pub mod impressions;
pub mod ingest;
pub mod listener;
pub mod workers;

#[cfg(test)]
mod testing;

pub use counter::FillCounter;
pub use exporter::{Exporter, HttpExporter};
pub use impressions::{ImpressionsBatch, ImpressionsMode, KeyImpression, SdkMetadata};
pub use ingest::{IngestError, Ingestor};
pub use workers::{PipelineConfig, WorkerPool};
