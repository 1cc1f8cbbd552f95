use super::{check_response, SpeechSynthesizer, Transcriber, Translator, VoiceParams};
use crate::error::LocalizeError;
use crate::transcript::{Transcript, TranscriptEntry};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

const PROVIDER: &str = "openai";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
	pub api_key: String,
	pub base_url: String,
	pub transcription_model: String,
	pub chat_model: String,
	pub request_timeout: Duration,
	/// `response_format` asked of the speech endpoint, also used as the file extension.
	pub speech_format: String,
}

impl OpenAiConfig {
	pub fn new(api_key: impl Into<String>) -> Self {
		Self {
			api_key: api_key.into(),
			base_url: "https://api.openai.com/v1".to_string(),
			transcription_model: "whisper-1".to_string(),
			chat_model: "gpt-4o-mini".to_string(),
			request_timeout: Duration::from_secs(120),
			speech_format: "mp3".to_string(),
		}
	}
}

/// One client for the transcription, chat and speech endpoints of an OpenAI-compatible API.
pub struct OpenAiClient {
	client: reqwest::Client,
	config: OpenAiConfig,
}

#[derive(Deserialize)]
struct VerboseTranscription {
	language: Option<String>,
	#[serde(default)]
	segments: Vec<TranscriptionSegment>,
}

#[derive(Deserialize)]
struct TranscriptionSegment {
	start: f64,
	end: f64,
	text: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
	model: &'a str,
	messages: Vec<ChatMessage<'a>>,
	temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
	role: &'a str,
	content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
	choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
	message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
	content: Option<String>,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
	model: &'a str,
	input: &'a str,
	voice: &'a str,
	speed: f32,
	response_format: &'a str,
}

fn translation_prompt(target_language: &str) -> String {
	format!(
		"You translate SRT subtitles into {target_language}. Reply with SRT only. Keep every entry number and timestamp exactly as given, \
		 translate only the text lines, and never merge, split, add or drop entries."
	)
}

impl OpenAiClient {
	///
	/// # Errors
	/// Returns error if the HTTP client cannot be built
	pub fn new(config: OpenAiConfig) -> Result<Self, LocalizeError> {
		let client = reqwest::Client::builder().timeout(config.request_timeout).build()?;
		Ok(Self { client, config })
	}

	fn url(&self, path: &str) -> String {
		format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
	}

	#[must_use]
	pub fn speech_format(&self) -> &str {
		&self.config.speech_format
	}
}

#[async_trait]
impl Transcriber for OpenAiClient {
	#[instrument(skip(self), fields(model = %self.config.transcription_model))]
	async fn transcribe(&self, audio: &Path, language: Option<&str>) -> Result<Transcript, LocalizeError> {
		if !audio.exists() {
			return Err(LocalizeError::InputMissing(audio.to_path_buf()));
		}
		let bytes = tokio::fs::read(audio).await?;
		let file_name = audio.file_name().map_or_else(|| "audio.wav".to_string(), |n| n.to_string_lossy().into_owned());

		let mut form = Form::new()
			.text("model", self.config.transcription_model.clone())
			.text("response_format", "verbose_json")
			.part("file", Part::bytes(bytes).file_name(file_name));
		if let Some(language) = language {
			form = form.text("language", language.to_string());
		}

		let response = self.client.post(self.url("audio/transcriptions")).bearer_auth(&self.config.api_key).multipart(form).send().await?;
		let parsed: VerboseTranscription = check_response(PROVIDER, response).await?.json().await?;

		let entries: Vec<TranscriptEntry> = parsed
			.segments
			.into_iter()
			.filter(|s| !s.text.trim().is_empty())
			.enumerate()
			.map(|(i, s)| TranscriptEntry::new(i + 1, s.start, s.end, s.text.trim()))
			.collect();
		debug!(entries = entries.len(), language = ?parsed.language, "Transcription received");

		Ok(Transcript::new(parsed.language, entries))
	}
}

#[async_trait]
impl Translator for OpenAiClient {
	fn name(&self) -> &'static str {
		PROVIDER
	}

	async fn translate(&self, text: &str, target_language: &str) -> Result<String, LocalizeError> {
		let system = translation_prompt(target_language);
		let request = ChatRequest {
			model: &self.config.chat_model,
			messages: vec![ChatMessage { role: "system", content: &system }, ChatMessage { role: "user", content: text }],
			temperature: 0.2,
		};

		let response = self.client.post(self.url("chat/completions")).bearer_auth(&self.config.api_key).json(&request).send().await?;
		let parsed: ChatResponse = check_response(PROVIDER, response).await?.json().await?;

		parsed.choices.into_iter().find_map(|choice| choice.message.content).ok_or_else(|| LocalizeError::Provider {
			provider: PROVIDER,
			status: 200,
			body: "chat completion had no content".to_string(),
		})
	}
}

#[async_trait]
impl SpeechSynthesizer for OpenAiClient {
	async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Bytes, LocalizeError> {
		let request = SpeechRequest {
			model: &voice.model,
			input: text,
			voice: &voice.voice,
			speed: voice.speed,
			response_format: &self.config.speech_format,
		};

		let response = self.client.post(self.url("audio/speech")).bearer_auth(&self.config.api_key).json(&request).send().await?;
		Ok(check_response(PROVIDER, response).await?.bytes().await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_url_joins_without_double_slash() {
		let mut config = OpenAiConfig::new("sk-test");
		config.base_url = "http://localhost:8080/v1/".to_string();
		let client = OpenAiClient::new(config).unwrap();
		assert_eq!(client.url("audio/speech"), "http://localhost:8080/v1/audio/speech");
	}

	#[test]
	fn test_verbose_transcription_shape() {
		let raw = r#"{"language":"english","text":"Hi there.","segments":[{"id":0,"start":0.0,"end":1.2,"text":" Hi"},{"id":1,"start":1.2,"end":2.0,"text":"  "},{"id":2,"start":2.0,"end":3.1,"text":" there."}]}"#;
		let parsed: VerboseTranscription = serde_json::from_str(raw).unwrap();
		assert_eq!(parsed.segments.len(), 3);
		assert_eq!(parsed.language.as_deref(), Some("english"));
	}

	#[test]
	fn test_prompt_names_target_language() {
		assert!(translation_prompt("Spanish").contains("into Spanish"));
	}

	#[tokio::test]
	async fn test_transcribe_missing_file() {
		let client = OpenAiClient::new(OpenAiConfig::new("sk-test")).unwrap();
		let err = client.transcribe(Path::new("/definitely/not/here.wav"), None).await.unwrap_err();
		assert!(matches!(err, LocalizeError::InputMissing(_)));
	}
}
