use plume_contracts::credentials::{
    GOOGLE_APPLICATION_CREDENTIALS, GOOGLE_CLOUD_LOCATION, GOOGLE_CLOUD_PROJECT, VERTEX_API_KEY,
};
use plume_contracts::models::BackendFamily;
use plume_contracts::request::{parse_size_or_default, GenerateOptions, GeneratedImage};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{api_base, decode_image, finish_image, validate_prompt, BackendContext, ImageBackend, Invoker};
use crate::auth::{ServiceAccountKey, ServiceAccountTokenSource};
use crate::error::{GenerationError, Result};
use crate::retry::CancelToken;

const MAX_PROMPT_CHARS: usize = 4096;
const MAX_SEED: i64 = 2_147_483_647;

pub enum VertexTransport {
    /// Raw HTTP with the key in `x-goog-api-key`.
    ApiKey(String),
    /// OAuth bearer tokens minted from a service-account key file.
    ServiceAccount(ServiceAccountTokenSource),
}

impl VertexTransport {
    fn name(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api-key",
            Self::ServiceAccount(_) => "service-account",
        }
    }
}

/// Imagen models behind the Vertex AI predict endpoint.
pub struct VertexClient {
    model: String,
    project: String,
    location: String,
    api_base: String,
    transport: VertexTransport,
    invoker: Invoker,
}

impl VertexClient {
    /// Uses the API key when one is configured and falls back to the
    /// service-account key file otherwise.
    pub fn new(context: &BackendContext) -> Result<Self> {
        context.ensure_complete()?;
        let project = context.require(GOOGLE_CLOUD_PROJECT)?;
        let location = context.require(GOOGLE_CLOUD_LOCATION)?;
        let invoker = Invoker::new(
            context,
            format!(
                "check {VERTEX_API_KEY} or the service account in {GOOGLE_APPLICATION_CREDENTIALS} has Vertex AI access to project {project}"
            ),
        )?;
        let transport = match context.credential(VERTEX_API_KEY) {
            Some(api_key) => VertexTransport::ApiKey(api_key.to_string()),
            None => {
                let key = ServiceAccountKey::from_file(context.require(GOOGLE_APPLICATION_CREDENTIALS)?)?;
                VertexTransport::ServiceAccount(ServiceAccountTokenSource::new(key, invoker.http().clone()))
            }
        };
        Ok(Self {
            model: context.model.id.clone(),
            api_base: api_base(context.endpoint.as_deref(), &regional_base(&location)),
            project,
            location,
            transport,
            invoker,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:predict",
            self.api_base, self.project, self.location, self.model
        )
    }

    fn build_payload(prompt: &str, options: &GenerateOptions, aspect_ratio: &str) -> Result<Value> {
        let mut parameters = Map::new();
        parameters.insert("sampleCount".to_string(), json!(1));
        parameters.insert("aspectRatio".to_string(), json!(aspect_ratio));
        if let Some(negative_prompt) = options.negative_prompt() {
            parameters.insert("negativePrompt".to_string(), json!(negative_prompt));
        }
        if let Some(seed) = options.seed {
            if !(0..=MAX_SEED).contains(&seed) {
                return Err(GenerationError::validation(
                    "vertex",
                    format!("seed must be between 0 and {MAX_SEED} (got {seed})"),
                ));
            }
            parameters.insert("seed".to_string(), json!(seed));
            // Imagen only honours a seed when watermarking is off.
            parameters.insert("addWatermark".to_string(), json!(false));
        }
        Ok(json!({
            "instances": [{ "prompt": prompt }],
            "parameters": parameters,
        }))
    }

    fn extract_prediction(response_payload: &Value) -> Result<(Vec<u8>, Option<String>)> {
        let predictions = response_payload
            .get("predictions")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for prediction in predictions {
            let Some(encoded) = prediction
                .get("bytesBase64Encoded")
                .or_else(|| prediction.get("bytes_base64_encoded"))
                .and_then(Value::as_str)
                .filter(|encoded| !encoded.is_empty())
            else {
                continue;
            };
            let mime_type = prediction
                .get("mimeType")
                .or_else(|| prediction.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok((decode_image("vertex", encoded)?, mime_type));
        }
        if let Some(reason) = predictions
            .iter()
            .find_map(|prediction| prediction.get("raiFilteredReason").and_then(Value::as_str))
        {
            return Err(GenerationError::Backend {
                backend: "vertex".to_string(),
                message: format!("image filtered: {reason}"),
            });
        }
        Err(GenerationError::EmptyResponse {
            backend: "vertex".to_string(),
        })
    }
}

impl ImageBackend for VertexClient {
    fn family(&self) -> BackendFamily {
        BackendFamily::Vertex
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn transport(&self) -> &'static str {
        self.transport.name()
    }

    fn generate_image(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<GeneratedImage> {
        self.invoker.ensure_open()?;
        let prompt = validate_prompt("vertex", prompt, MAX_PROMPT_CHARS)?;
        let dims = parse_size_or_default(&options.size);
        let aspect_ratio = aspect_ratio_bucket(dims.0, dims.1);
        let payload = Self::build_payload(prompt, options, aspect_ratio)?;
        let endpoint = self.endpoint();

        let (bytes, mime_type) = self.invoker.call(cancel, |attempt| {
            debug!(
                model = %self.model,
                transport = self.transport.name(),
                attempt = attempt.number,
                "vertex predict"
            );
            let request = self.invoker.http().post(&endpoint).json(&payload);
            let request = match &self.transport {
                VertexTransport::ApiKey(api_key) => request.header("x-goog-api-key", api_key),
                VertexTransport::ServiceAccount(tokens) => request.bearer_auth(tokens.token()?),
            };
            let response_payload = self.invoker.send_json(request, &endpoint)?;
            Self::extract_prediction(&response_payload)
        })?;
        Ok(finish_image(
            self,
            prompt,
            bytes,
            mime_type.as_deref(),
            dims,
            [
                ("project", self.project.clone()),
                ("location", self.location.clone()),
                ("aspect_ratio", aspect_ratio.to_string()),
            ],
        ))
    }

    fn close(&self) {
        self.invoker.close();
    }
}

/// Nearest supported Imagen aspect ratio for a pixel size.
pub fn aspect_ratio_bucket(width: u32, height: u32) -> &'static str {
    if width == height || width == 0 || height == 0 {
        return "1:1";
    }
    let (long, short) = if width > height {
        (width, height)
    } else {
        (height, width)
    };
    let ratio = f64::from(long) / f64::from(short);
    let landscape = width > height;
    if (1.7..=1.9).contains(&ratio) {
        if landscape { "16:9" } else { "9:16" }
    } else if (1.4..=1.6).contains(&ratio) {
        if landscape { "3:2" } else { "2:3" }
    } else if landscape {
        "4:3"
    } else {
        "3:4"
    }
}

fn regional_base(location: &str) -> String {
    let location = location.trim();
    if location.is_empty() || location.eq_ignore_ascii_case("global") {
        "https://aiplatform.googleapis.com".to_string()
    } else {
        format!("https://{location}-aiplatform.googleapis.com")
    }
}
