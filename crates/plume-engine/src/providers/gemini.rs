use plume_contracts::credentials::GEMINI_API_KEY;
use plume_contracts::models::BackendFamily;
use plume_contracts::request::{parse_size_or_default, GenerateOptions, GeneratedImage};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{api_base, decode_image, finish_image, validate_prompt, BackendContext, ImageBackend, Invoker};
use crate::error::{GenerationError, Result};
use crate::retry::CancelToken;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const MAX_PROMPT_CHARS: usize = 8192;

struct ImageBytes {
    bytes: Vec<u8>,
    mime_type: Option<String>,
}

/// Gemini image models over the public generateContent REST endpoint, keyed
/// by an API key query parameter.
pub struct GeminiClient {
    model: String,
    api_base: String,
    api_key: String,
    invoker: Invoker,
}

impl GeminiClient {
    pub fn new(context: &BackendContext) -> Result<Self> {
        context.ensure_complete()?;
        Ok(Self {
            model: context.model.id.clone(),
            api_base: api_base(context.endpoint.as_deref(), DEFAULT_API_BASE),
            api_key: context.require(GEMINI_API_KEY)?,
            invoker: Invoker::new(
                context,
                format!("check {GEMINI_API_KEY}; `export {GEMINI_API_KEY}=...` with a key that has image generation access"),
            )?,
        })
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(prompt: &str, options: &GenerateOptions) -> Value {
        let mut generation_config = Map::new();
        generation_config.insert("responseModalities".to_string(), json!(["IMAGE"]));
        if let Some(aspect_ratio) = options.aspect_ratio() {
            generation_config.insert(
                "imageConfig".to_string(),
                json!({ "aspectRatio": aspect_ratio }),
            );
        }
        json!({
            "contents": [{
                "parts": [{ "text": prompt }],
            }],
            "generationConfig": generation_config,
        })
    }

    fn extract_image(response_payload: &Value) -> Result<(ImageBytes, Option<String>)> {
        let parts = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|candidate| candidate.get("content"))
            .filter_map(|content| content.get("parts"))
            .filter_map(Value::as_array)
            .flatten();

        let mut image = None;
        let mut texts = Vec::new();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                texts.push(text.trim().to_string());
                continue;
            }
            if image.is_some() {
                continue;
            }
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            image = Some(ImageBytes {
                bytes: decode_image("gemini", data)?,
                mime_type,
            });
        }

        let Some(image) = image else {
            if let Some(reason) = response_payload
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
            {
                return Err(GenerationError::Backend {
                    backend: "gemini".to_string(),
                    message: format!("prompt blocked: {reason}"),
                });
            }
            return Err(GenerationError::EmptyResponse {
                backend: "gemini".to_string(),
            });
        };
        let text = texts.into_iter().filter(|text| !text.is_empty()).collect::<Vec<String>>();
        Ok((image, (!text.is_empty()).then(|| text.join("\n"))))
    }
}

impl ImageBackend for GeminiClient {
    fn family(&self) -> BackendFamily {
        BackendFamily::Gemini
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn transport(&self) -> &'static str {
        "rest"
    }

    fn generate_image(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<GeneratedImage> {
        self.invoker.ensure_open()?;
        let prompt = validate_prompt("gemini", prompt, MAX_PROMPT_CHARS)?;
        let dims = parse_size_or_default(&options.size);
        let endpoint = self.endpoint();
        let payload = Self::build_payload(prompt, options);

        let (image, text) = self.invoker.call(cancel, |attempt| {
            debug!(model = %self.model, attempt = attempt.number, "gemini generateContent");
            let request = self
                .invoker
                .http()
                .post(&endpoint)
                .query(&[("key", self.api_key.as_str())])
                .json(&payload);
            let response_payload = self.invoker.send_json(request, &endpoint)?;
            Self::extract_image(&response_payload)
        })?;
        let mut extras = Vec::new();
        if let Some(text) = text {
            extras.push(("text", text));
        }
        if let Some(aspect_ratio) = options.aspect_ratio() {
            extras.push(("aspect_ratio", aspect_ratio.to_string()));
        }
        Ok(finish_image(
            self,
            prompt,
            image.bytes,
            image.mime_type.as_deref(),
            dims,
            extras,
        ))
    }

    fn close(&self) {
        self.invoker.close();
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use plume_contracts::request::ImageFormat;
    use plume_contracts::ClientConfig;

    use super::*;
    use crate::error::ErrorClass;
    use crate::providers::testing::{context, png_base64, PNG_BYTES};

    fn client(server: &MockServer) -> Result<GeminiClient> {
        let mut config = ClientConfig::default();
        config.endpoints.gemini = Some(server.url("/v1beta"));
        let (context, _sleeper) = context("gemini-flash", &[(GEMINI_API_KEY, "g-key")], config);
        GeminiClient::new(&context)
    }

    #[test]
    fn size_parsing_falls_back_per_dimension() {
        assert_eq!(parse_size_or_default("800x600"), (800, 600));
        assert_eq!(parse_size_or_default("garbage"), (1024, 1024));
        assert_eq!(parse_size_or_default(""), (1024, 1024));
        assert_eq!(parse_size_or_default("0x600"), (1024, 600));
    }

    #[test]
    fn payload_requests_image_modality() {
        let options = GenerateOptions {
            aspect_ratio: Some("16:9".to_string()),
            ..GenerateOptions::default()
        };
        let payload = GeminiClient::build_payload("a red fox", &options);
        assert_eq!(payload["contents"][0]["parts"][0]["text"], "a red fox");
        assert_eq!(payload["generationConfig"]["responseModalities"][0], "IMAGE");
        assert_eq!(payload["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");
        let plain = GeminiClient::build_payload("a red fox", &GenerateOptions::default());
        assert!(plain["generationConfig"].get("imageConfig").is_none());
    }

    #[test]
    fn generates_image_from_inline_data() -> Result<()> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-2.5-flash-image:generateContent")
                .query_param("key", "g-key");
            then.status(200).json_body(serde_json::json!({
                "candidates": [{
                    "content": { "parts": [
                        { "text": "Here is your fox." },
                        { "inlineData": { "mimeType": "image/png", "data": png_base64() } }
                    ]}
                }]
            }));
        });

        let client = client(&server)?;
        let options = GenerateOptions {
            size: "800x600".to_string(),
            ..GenerateOptions::default()
        };
        let image = client.generate_image("a red fox", &options, &CancelToken::new())?;
        mock.assert();
        assert_eq!(image.data, PNG_BYTES);
        assert_eq!(image.format, ImageFormat::Png);
        assert_eq!((image.width, image.height), (800, 600));
        assert_eq!(image.metadata("model"), Some("gemini-2.5-flash-image"));
        assert_eq!(image.metadata("prompt"), Some("a red fox"));
        assert_eq!(image.metadata("text"), Some("Here is your fox."));
        Ok(())
    }

    #[test]
    fn empty_prompt_never_reaches_the_network() -> Result<()> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(200);
        });
        let err = client(&server)?
            .generate_image("  ", &GenerateOptions::default(), &CancelToken::new())
            .err();
        assert!(matches!(err, Some(GenerationError::Validation { .. })));
        mock.assert_hits(0);
        Ok(())
    }

    #[test]
    fn forbidden_response_names_the_api_key() -> Result<()> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(403).body(r#"{"error":{"status":"PERMISSION_DENIED"}}"#);
        });
        let err = client(&server)?
            .generate_image("a red fox", &GenerateOptions::default(), &CancelToken::new())
            .err();
        mock.assert_hits(1);
        assert_eq!(err.as_ref().map(GenerationError::class), Some(ErrorClass::Authentication));
        let text = err.map(|err| err.to_string()).unwrap_or_default();
        assert!(text.contains("GEMINI_API_KEY"), "{text}");
        Ok(())
    }

    #[test]
    fn response_without_image_counts_as_a_breaker_failure() -> Result<()> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(200).json_body(serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": "no can do" }] } }]
            }));
        });
        let mut config = ClientConfig::default();
        config.endpoints.gemini = Some(server.url("/v1beta"));
        let (context, sleeper) = context("gemini-flash", &[(GEMINI_API_KEY, "g-key")], config);
        let err = GeminiClient::new(&context)?
            .generate_image("a red fox", &GenerateOptions::default(), &CancelToken::new())
            .err();
        mock.assert_hits(1);
        assert!(sleeper.waits().is_empty());
        assert!(matches!(
            err.as_ref().map(GenerationError::root),
            Some(GenerationError::EmptyResponse { .. })
        ));
        assert_eq!(context.breaker.counts().total_failures, 1);
        Ok(())
    }

    #[test]
    fn base_url_can_come_from_the_environment() -> Result<()> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/env-base/models/gemini-2.5-flash-image:generateContent");
            then.status(200).json_body(serde_json::json!({
                "candidates": [{ "content": { "parts": [
                    { "inlineData": { "mimeType": "image/webp", "data": png_base64() } }
                ]}}]
            }));
        });
        let env_base = server.url("/env-base");
        let (context, _sleeper) = context(
            "gemini-flash",
            &[(GEMINI_API_KEY, "g-key"), (crate::providers::GEMINI_API_BASE, env_base.as_str())],
            ClientConfig::default(),
        );
        let image = GeminiClient::new(&context)?.generate_image(
            "a red fox",
            &GenerateOptions::default(),
            &CancelToken::new(),
        )?;
        mock.assert();
        assert_eq!(image.format, ImageFormat::Webp);
        Ok(())
    }

    #[test]
    fn closed_client_rejects_calls() -> Result<()> {
        let server = MockServer::start();
        let client = client(&server)?;
        client.close();
        client.close();
        let err = client
            .generate_image("a red fox", &GenerateOptions::default(), &CancelToken::new())
            .err();
        assert!(matches!(err, Some(GenerationError::Closed { .. })));
        Ok(())
    }
}
