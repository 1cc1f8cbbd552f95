use super::{check_response, Translator};
use crate::error::LocalizeError;
use crate::transcript::{parse_srt, to_srt, TranscriptEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROVIDER: &str = "deepl";

/// DeepL translates plain text, so SRT input is unpacked into one text per entry and
/// re-packed around the translations with the original numbering and timing.
pub struct DeepLTranslator {
	client: reqwest::Client,
	api_key: String,
	base_url: String,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
	text: Vec<&'a str>,
	target_lang: String,
	preserve_formatting: bool,
}

#[derive(Deserialize)]
struct TranslateResponse {
	translations: Vec<Translation>,
}

#[derive(Deserialize)]
struct Translation {
	text: String,
}

impl DeepLTranslator {
	///
	/// # Errors
	/// Returns error if the HTTP client cannot be built
	pub fn new(api_key: impl Into<String>, request_timeout: Duration) -> Result<Self, LocalizeError> {
		let api_key = api_key.into();
		// Free-tier keys end in ":fx" and live on a separate host.
		let base_url = if api_key.ends_with(":fx") { "https://api-free.deepl.com/v2" } else { "https://api.deepl.com/v2" };
		Ok(Self {
			client: reqwest::Client::builder().timeout(request_timeout).build()?,
			api_key,
			base_url: base_url.to_string(),
		})
	}
}

/// DeepL expects upper-case codes such as `ES` or `PT-BR`.
fn target_code(language: &str) -> String {
	language.trim().replace('_', "-").to_ascii_uppercase()
}

#[async_trait]
impl Translator for DeepLTranslator {
	fn name(&self) -> &'static str {
		PROVIDER
	}

	async fn translate(&self, text: &str, target_language: &str) -> Result<String, LocalizeError> {
		let entries = parse_srt(text)?;
		let request = TranslateRequest {
			text: entries.iter().map(|e| e.text.as_str()).collect(),
			target_lang: target_code(target_language),
			preserve_formatting: true,
		};

		let response = self
			.client
			.post(format!("{}/translate", self.base_url.trim_end_matches('/')))
			.header("Authorization", format!("DeepL-Auth-Key {}", self.api_key))
			.json(&request)
			.send()
			.await?;
		let parsed: TranslateResponse = check_response(PROVIDER, response).await?.json().await?;

		if parsed.translations.len() != entries.len() {
			return Err(LocalizeError::Provider {
				provider: PROVIDER,
				status: 200,
				body: format!("expected {} translations, got {}", entries.len(), parsed.translations.len()),
			});
		}

		let translated: Vec<TranscriptEntry> = entries.into_iter().zip(parsed.translations).map(|(entry, t)| TranscriptEntry { text: t.text, ..entry }).collect();
		Ok(to_srt(&translated))
	}
}
