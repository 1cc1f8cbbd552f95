//! Media localization: transcript, translation, per-segment speech and remux.
//!
//! The building blocks are usable on their own. [`pipeline::PipelineOrchestrator`] wires them
//! into the full flow.

pub mod error;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod rate_limiter;
pub mod retry;
pub mod tools;
pub mod transcript;
pub mod translate;
pub mod tts;

#[cfg(test)]
pub(crate) mod testing;

pub use error::LocalizeError;
pub use pipeline::{PipelineConfig, PipelineOrchestrator, PipelineOutput, PipelineRequest, PipelineStatus, Stage, StatusTable};
pub use progress::{ProgressKind, ProgressSummary, ProgressTracker, SegmentMapping};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::RetryPolicy;
pub use transcript::{Transcript, TranscriptEntry};
pub use translate::{ChunkedTranslator, TranslatorConfig};
pub use tts::{SegmentTtsExecutor, TtsConfig};
