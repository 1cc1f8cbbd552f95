//! Seams to external collaborators: speech and language APIs, the credit ledger and the
//! background separator. HTTP implementations live in the submodules.

pub mod deepl;
pub mod openai;

use crate::error::LocalizeError;
use crate::transcript::Transcript;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use deepl::DeepLTranslator;
pub use openai::{OpenAiClient, OpenAiConfig};

#[async_trait]
pub trait Transcriber: Send + Sync {
	/// Timed transcript of `audio`. `language` is a hint, `None` lets the provider detect it.
	async fn transcribe(&self, audio: &Path, language: Option<&str>) -> Result<Transcript, LocalizeError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
	fn name(&self) -> &'static str;

	/// Translates SRT text, which must come back as SRT with the same entry numbers.
	async fn translate(&self, text: &str, target_language: &str) -> Result<String, LocalizeError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
	pub voice: String,
	pub model: String,
	/// Playback speed multiplier, 1.0 is natural.
	pub speed: f32,
}

impl Default for VoiceParams {
	fn default() -> Self {
		Self {
			voice: "alloy".to_string(),
			model: "tts-1".to_string(),
			speed: 1.0,
		}
	}
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
	/// Raw encoded audio for `text`.
	async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Bytes, LocalizeError>;
}

/// Reserves and settles credits for a request. Amounts are in the ledger's own unit.
#[async_trait]
pub trait CreditLedger: Send + Sync {
	async fn lock(&self, owner: &str, amount: u64) -> Result<(), LocalizeError>;

	async fn deduct(&self, owner: &str, amount: u64) -> Result<(), LocalizeError>;

	async fn unlock(&self, owner: &str, amount: u64) -> Result<(), LocalizeError>;
}

/// Removes the voice from a mix, leaving the background.
#[async_trait]
pub trait BackgroundSeparator: Send + Sync {
	async fn separate(&self, audio: &Path, work_dir: &Path) -> Result<PathBuf, LocalizeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslatorBackend {
	OpenAi,
	DeepL,
}

impl fmt::Display for TranslatorBackend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::OpenAi => write!(f, "openai"),
			Self::DeepL => write!(f, "deepl"),
		}
	}
}

impl FromStr for TranslatorBackend {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"openai" | "gpt" => Ok(Self::OpenAi),
			"deepl" => Ok(Self::DeepL),
			other => Err(format!("unknown translator backend '{other}' (expected openai or deepl)")),
		}
	}
}

/// Maps a non-success HTTP response to [`LocalizeError::Provider`].
pub(crate) async fn check_response(provider: &'static str, response: reqwest::Response) -> Result<reqwest::Response, LocalizeError> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}
	let body = response.text().await.unwrap_or_default();
	Err(LocalizeError::Provider {
		provider,
		status: status.as_u16(),
		body,
	})
}
