//! End-to-end tests for the fixed media pipelines over mock capabilities.

use async_trait::async_trait;
use mediaflow::{
    AudioSource, BlobStore, Capabilities, Chunk, EncodeFormat, EncodeJob, EncodeOutput, Encoder,
    MemoryStepStore, PipelineError, ProcessingJob, StepStore, Synthesizer, TranscribeJob,
    Transcriber, Transcript, encode_pipeline, processing_pipeline, transcribe_pipeline,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Encoder over a pretend source of fixed length.
struct MockEncoder {
    total_secs: f64,
    encodes: AtomicU32,
    discarded: AtomicBool,
    fail_discard: bool,
    degenerate_split: bool,
}

impl MockEncoder {
    fn new(total_secs: f64) -> Self {
        Self {
            total_secs,
            encodes: AtomicU32::new(0),
            discarded: AtomicBool::new(false),
            fail_discard: false,
            degenerate_split: false,
        }
    }
}

#[async_trait]
impl Encoder for MockEncoder {
    async fn encode(&self, source: &str, format: &str, bitrate: u32) -> anyhow::Result<EncodeOutput> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        Ok(EncodeOutput {
            output_ref: format!("{source}.{format}"),
            size: bitrate as u64 * 1000,
            duration: self.total_secs,
        })
    }

    async fn split(
        &self,
        source: &str,
        chunk_secs: f64,
        overlap_secs: f64,
    ) -> anyhow::Result<Vec<Chunk>> {
        if self.degenerate_split {
            return Ok(vec![Chunk {
                index: 0,
                start: 0.0,
                end: 0.0,
                resource: None,
            }]);
        }
        let mut chunks = Vec::new();
        let mut start = 0.0;
        let mut index = 0;
        loop {
            let end = (start + chunk_secs).min(self.total_secs);
            chunks.push(Chunk {
                index,
                start,
                end,
                resource: Some(format!("{source}.chunk{index}")),
            });
            if end >= self.total_secs {
                break;
            }
            start = end - overlap_secs;
            index += 1;
        }
        Ok(chunks)
    }

    async fn discard(&self, _chunks: &[Chunk]) -> anyhow::Result<()> {
        if self.fail_discard {
            anyhow::bail!("temp storage unreachable");
        }
        self.discarded.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Transcriber with canned text per resource reference.
struct MockTranscriber {
    texts: HashMap<String, String>,
    fail_on: Option<String>,
    calls: AtomicU32,
}

impl MockTranscriber {
    fn new(texts: &[(&str, &str)]) -> Self {
        Self {
            texts: texts
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fail_on: None,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, audio: AudioSource, _language: &str) -> anyhow::Result<Transcript> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        // Stagger completions so earlier chunks finish later.
        tokio::time::sleep(Duration::from_millis(10 - (call as u64 % 10))).await;

        let key = match &audio {
            AudioSource::Reference(r) => r.clone(),
            AudioSource::Bytes(_) => "<bytes>".to_string(),
        };
        if self.fail_on.as_deref() == Some(key.as_str()) {
            anyhow::bail!("inference backend rejected '{key}'");
        }
        match self.texts.get(&key) {
            Some(text) => Ok(Transcript { text: text.clone() }),
            None => anyhow::bail!("no audio at '{key}'"),
        }
    }
}

struct MockSynthesizer;

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> anyhow::Result<Vec<u8>> {
        Ok(format!("pcm/{voice}/{text}").into_bytes())
    }
}

#[derive(Default)]
struct MemoryBlobs {
    blobs: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().await.get(key).map(|(b, _)| b.clone()))
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> anyhow::Result<()> {
        self.blobs
            .lock()
            .await
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(())
    }
}

fn caps(encoder: Arc<MockEncoder>, transcriber: MockTranscriber) -> (Capabilities, Arc<MemoryBlobs>) {
    let blobs = Arc::new(MemoryBlobs::default());
    (
        Capabilities {
            encoder,
            transcriber: Arc::new(transcriber),
            synthesizer: Arc::new(MockSynthesizer),
            blobs: blobs.clone(),
        },
        blobs,
    )
}

fn processing_job() -> ProcessingJob {
    ProcessingJob {
        episode_id: "ep1".to_string(),
        source: "src.wav".to_string(),
        formats: vec![EncodeFormat {
            format: "mp3".to_string(),
            bitrate: 128,
        }],
        chunk_secs: 30.0,
        overlap_secs: 2.0,
        language: "en".to_string(),
        task_id: Some("task-1".to_string()),
    }
}

#[tokio::test]
async fn combined_pipeline_produces_merged_transcript() {
    // A 58s source splits into (0..30) and (28..58) with 2s of overlap.
    let transcriber = MockTranscriber::new(&[
        ("src.wav.chunk0", "a b c d e"),
        ("src.wav.chunk1", "d e f g h"),
    ]);
    let encoder = Arc::new(MockEncoder::new(58.0));
    let (caps, blobs) = caps(encoder.clone(), transcriber);
    let store = Arc::new(MemoryStepStore::new());

    let pipeline = processing_pipeline(&caps, store.clone(), Arc::new(mediaflow::NoopProgress));
    let outcome = pipeline.run(processing_job()).await.unwrap();

    // 2s of a 30s chunk rounds down to zero trimmed words, so the
    // duplicated boundary words survive the merge heuristic.
    assert_eq!(outcome.text, "a b c d e d e f g h");
    assert_eq!(outcome.word_count, 10);
    assert_eq!(outcome.outputs.len(), 1);
    assert_eq!(outcome.outputs[0].output_ref, "src.wav.mp3");
    assert_eq!(outcome.transcript_key, "episodes/ep1/transcript.txt");

    let stored = blobs.get("episodes/ep1/transcript.txt").await.unwrap().unwrap();
    assert_eq!(stored, outcome.text.as_bytes());
    assert!(blobs.get("episodes/ep1/encodings.json").await.unwrap().is_some());

    let run = store.load_run("process-ep1").await.unwrap().unwrap();
    assert_eq!(run.task_id.as_deref(), Some("task-1"));
    assert!(encoder.discarded.load(Ordering::SeqCst));
}

#[tokio::test]
async fn combined_pipeline_survives_cleanup_failure() {
    let transcriber = MockTranscriber::new(&[
        ("src.wav.chunk0", "a b c d e"),
        ("src.wav.chunk1", "d e f g h"),
    ]);
    let mut encoder = MockEncoder::new(58.0);
    encoder.fail_discard = true;
    let (caps, _) = caps(Arc::new(encoder), transcriber);

    let pipeline = processing_pipeline(
        &caps,
        Arc::new(MemoryStepStore::new()),
        Arc::new(mediaflow::NoopProgress),
    );

    // Cleanup is best-effort; the run still completes.
    let outcome = pipeline.run(processing_job()).await.unwrap();
    assert_eq!(outcome.word_count, 10);
}

#[tokio::test(start_paused = true)]
async fn chunk_worker_failure_fails_run() {
    let mut transcriber = MockTranscriber::new(&[("src.wav.chunk0", "a b c d e")]);
    transcriber.fail_on = Some("src.wav.chunk1".to_string());
    let (caps, _) = caps(Arc::new(MockEncoder::new(58.0)), transcriber);

    let pipeline = processing_pipeline(
        &caps,
        Arc::new(MemoryStepStore::new()),
        Arc::new(mediaflow::NoopProgress),
    );

    let err = pipeline.run(processing_job()).await.unwrap_err();
    match err {
        PipelineError::RetriesExhausted { step, .. } => assert_eq!(step, "transcribe_chunks"),
        other => panic!("expected RetriesExhausted, got {other}"),
    }
}

#[tokio::test]
async fn combined_pipeline_rejects_bad_overlap() {
    let (caps, _) = caps(Arc::new(MockEncoder::new(58.0)), MockTranscriber::new(&[]));
    let pipeline = processing_pipeline(
        &caps,
        Arc::new(MemoryStepStore::new()),
        Arc::new(mediaflow::NoopProgress),
    );

    let mut job = processing_job();
    job.overlap_secs = 30.0; // not shorter than the chunk
    let err = pipeline.run(job).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput { step: "initialize", .. }));
}

#[tokio::test]
async fn combined_pipeline_rejects_zero_length_chunks() {
    let mut encoder = MockEncoder::new(58.0);
    encoder.degenerate_split = true;
    let (caps, _) = caps(Arc::new(encoder), MockTranscriber::new(&[]));
    let pipeline = processing_pipeline(
        &caps,
        Arc::new(MemoryStepStore::new()),
        Arc::new(mediaflow::NoopProgress),
    );

    let err = pipeline.run(processing_job()).await.unwrap_err();
    assert!(matches!(err, PipelineError::StepFailed { step: "split_chunks", .. }));
}

#[tokio::test]
async fn encode_pipeline_encodes_every_format_in_order() {
    let encoder = Arc::new(MockEncoder::new(60.0));
    let (caps, blobs) = caps(encoder.clone(), MockTranscriber::new(&[]));
    let store = Arc::new(MemoryStepStore::new());

    let pipeline = encode_pipeline(&caps, store, Arc::new(mediaflow::NoopProgress));
    let job = EncodeJob {
        episode_id: "ep2".to_string(),
        source: "src.wav".to_string(),
        formats: vec![
            EncodeFormat {
                format: "mp3".to_string(),
                bitrate: 128,
            },
            EncodeFormat {
                format: "aac".to_string(),
                bitrate: 96,
            },
        ],
        task_id: None,
    };

    let outcome = pipeline.run(job.clone()).await.unwrap();
    assert_eq!(outcome.outputs.len(), 2);
    assert_eq!(outcome.outputs[0].output_ref, "src.wav.mp3");
    assert_eq!(outcome.outputs[1].output_ref, "src.wav.aac");
    assert!(blobs.get(&outcome.manifest_key).await.unwrap().is_some());

    // A second run of the same job is served from memoized state.
    let again = pipeline.run(job).await.unwrap();
    assert_eq!(again.outputs.len(), 2);
    assert_eq!(encoder.encodes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn encode_pipeline_rejects_empty_formats() {
    let (caps, _) = caps(Arc::new(MockEncoder::new(60.0)), MockTranscriber::new(&[]));
    let pipeline = encode_pipeline(
        &caps,
        Arc::new(MemoryStepStore::new()),
        Arc::new(mediaflow::NoopProgress),
    );

    let err = pipeline
        .run(EncodeJob {
            episode_id: "ep3".to_string(),
            source: "src.wav".to_string(),
            formats: vec![],
            task_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput { step: "initialize", .. }));
}

#[tokio::test]
async fn transcribe_pipeline_prefers_blob_bytes() {
    let transcriber = MockTranscriber::new(&[("<bytes>", "the full episode transcript")]);
    let (caps, blobs) = caps(Arc::new(MockEncoder::new(60.0)), transcriber);
    blobs
        .put("src.wav", b"riff-data", "audio/wav")
        .await
        .unwrap();

    let pipeline = transcribe_pipeline(
        &caps,
        Arc::new(MemoryStepStore::new()),
        Arc::new(mediaflow::NoopProgress),
    );
    let outcome = pipeline
        .run(TranscribeJob {
            episode_id: "ep4".to_string(),
            source: "src.wav".to_string(),
            language: "en".to_string(),
            task_id: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.text, "the full episode transcript");
    assert_eq!(outcome.word_count, 4);
    assert!(blobs.get("episodes/ep4/transcript.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn transcribe_pipeline_falls_back_to_reference() {
    let transcriber = MockTranscriber::new(&[("https://cdn/ep5.wav", "remote audio words")]);
    let (caps, _) = caps(Arc::new(MockEncoder::new(60.0)), transcriber);

    let pipeline = transcribe_pipeline(
        &caps,
        Arc::new(MemoryStepStore::new()),
        Arc::new(mediaflow::NoopProgress),
    );
    let outcome = pipeline
        .run(TranscribeJob {
            episode_id: "ep5".to_string(),
            source: "https://cdn/ep5.wav".to_string(),
            language: "en".to_string(),
            task_id: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.word_count, 3);
}

#[tokio::test]
async fn synthesizer_contract_round_trips() {
    let synth = MockSynthesizer;
    let audio = synth.synthesize("hello there", "ava").await.unwrap();
    assert_eq!(audio, b"pcm/ava/hello there");
}
