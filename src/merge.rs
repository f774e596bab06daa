//! Overlap-aware transcript merge.
//!
//! Chunks are cut from the source with a configured time overlap so words
//! at boundaries are not lost, which means consecutive transcripts repeat
//! words proportional to that overlap. The merge trims an estimated word
//! count from the head of each chunk after the first. This is a word-count
//! heuristic, not semantic alignment: small overlaps can round down to zero
//! skipped words, and minor duplication or loss at boundaries is accepted.

use serde::{Deserialize, Serialize};

/// One transcribed chunk with its source time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribedChunk {
    /// 0-based position in the source; canonical ordering.
    pub index: usize,
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    /// Transcript of this chunk alone.
    pub text: String,
}

impl TranscribedChunk {
    /// Chunk length in seconds.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Final combined transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub text: String,
    /// Non-empty whitespace-separated tokens in `text`.
    pub word_count: usize,
}

/// Merge ordered transcribed chunks into one continuous transcript.
///
/// The first chunk is kept verbatim. For each later chunk the actual
/// temporal overlap with its predecessor is
/// `min(previous.end - current.start, overlap_secs)` clamped at zero; the
/// same fraction of the chunk's duration is dropped from its leading words
/// before the remainder is appended.
pub fn merge(chunks: &[TranscribedChunk], overlap_secs: f64) -> MergedResult {
    let mut words: Vec<&str> = Vec::new();

    for (i, chunk) in chunks.iter().enumerate() {
        let chunk_words: Vec<&str> = chunk.text.split_whitespace().collect();

        let skip = if i == 0 {
            0
        } else {
            let actual = (chunks[i - 1].end - chunk.start).min(overlap_secs).max(0.0);
            let duration = chunk.duration();
            if duration > 0.0 && actual > 0.0 {
                let ratio = actual / duration;
                // Overlap can exceed the chunk's duration; keep a
                // non-negative remainder rather than underflowing.
                ((chunk_words.len() as f64 * ratio).floor() as usize).min(chunk_words.len())
            } else {
                0
            }
        };

        words.extend(&chunk_words[skip..]);
    }

    let word_count = words.len();
    MergedResult {
        text: words.join(" "),
        word_count,
    }
}
