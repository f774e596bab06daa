//! External capability contracts.
//!
//! The engine stays agnostic to concrete media backends: encoding,
//! inference, and blob storage are reached only through these traits.
//! Provider selection happens once, at run start, by handing the pipeline
//! a [`Capabilities`] bundle; step bodies never branch on providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A bounded time-range slice of a source audio item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// 0-based position in the source; canonical ordering.
    pub index: usize,
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    /// Materialized sub-resource holding this chunk's audio, if the
    /// encoder produced one. Cleaned up after transcription.
    pub resource: Option<String>,
}

impl Chunk {
    /// Chunk length in seconds.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Output of encoding a source to one format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeOutput {
    /// Reference to the encoded artifact.
    pub output_ref: String,
    /// Encoded size in bytes.
    pub size: u64,
    /// Duration in seconds.
    pub duration: f64,
}

/// A transcription result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
}

/// Audio handed to a transcriber: raw bytes or a resolvable reference.
#[derive(Debug, Clone)]
pub enum AudioSource {
    Bytes(Vec<u8>),
    Reference(String),
}

/// Audio encoding backend.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Encode `source` to the given format and bitrate.
    async fn encode(
        &self,
        source: &str,
        format: &str,
        bitrate: u32,
    ) -> anyhow::Result<EncodeOutput>;

    /// Split `source` into fixed-length windows of `chunk_secs` with
    /// `overlap_secs` shared between consecutive windows. Chunks come back
    /// in index order with retrievable sub-resource references.
    async fn split(
        &self,
        source: &str,
        chunk_secs: f64,
        overlap_secs: f64,
    ) -> anyhow::Result<Vec<Chunk>>;

    /// Delete the temporary sub-resources behind the given chunks.
    async fn discard(&self, chunks: &[Chunk]) -> anyhow::Result<()>;
}

/// Speech-to-text backend.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: AudioSource, language: &str) -> anyhow::Result<Transcript>;
}

/// Text-to-speech backend.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> anyhow::Result<Vec<u8>>;
}

/// Opaque blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob, or `None` if the key is absent.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Store a blob.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> anyhow::Result<()>;
}

/// The capability bundle a pipeline run is started with.
///
/// Interchangeable backends are selected here, by configuration, never by
/// branching inside step bodies.
#[derive(Clone)]
pub struct Capabilities {
    pub encoder: Arc<dyn Encoder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub blobs: Arc<dyn BlobStore>,
}
