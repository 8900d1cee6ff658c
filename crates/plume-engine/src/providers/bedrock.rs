use std::collections::BTreeMap;

use plume_contracts::credentials::{
    AWS_ACCESS_KEY_ID, AWS_BEARER_TOKEN_BEDROCK, AWS_REGION, AWS_SECRET_ACCESS_KEY,
    AWS_SESSION_TOKEN,
};
use plume_contracts::models::BackendFamily;
use plume_contracts::request::{parse_size, GenerateOptions, GeneratedImage, DEFAULT_DIMENSION};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{api_base, decode_image, finish_image, validate_prompt, BackendContext, ImageBackend, Invoker};
use crate::auth::{aws_percent_encode, SigV4Signer, SigV4Timestamp};
use crate::error::{GenerationError, Result};
use crate::retry::CancelToken;

const MAX_PROMPT_CHARS: usize = 1024;
const MAX_NEGATIVE_PROMPT_CHARS: usize = 1024;
const MIN_DIMENSION: u32 = 512;
const MAX_DIMENSION: u32 = 2048;
const DIMENSION_STEP: u32 = 64;
const MAX_SEED: i64 = 858_993_459;
const CFG_SCALE: f64 = 7.0;
const PREMIUM_STYLES: [&str; 4] = ["premium", "high", "ultra", "photorealistic"];

pub enum BedrockTransport {
    /// Bedrock API key sent as a bearer token.
    BearerToken(String),
    /// Static IAM credentials, each request signed with SigV4.
    SignedRequest(SigV4Signer),
}

impl BedrockTransport {
    fn name(&self) -> &'static str {
        match self {
            Self::BearerToken(_) => "bearer-token",
            Self::SignedRequest(_) => "sigv4",
        }
    }
}

/// Amazon image models (Nova Canvas, Titan) through the Bedrock runtime
/// InvokeModel endpoint.
pub struct BedrockClient {
    model: String,
    region: String,
    endpoint: String,
    transport: BedrockTransport,
    invoker: Invoker,
}

impl BedrockClient {
    /// Prefers a bearer token; otherwise needs an access key pair.
    pub fn new(context: &BackendContext) -> Result<Self> {
        context.ensure_complete()?;
        let region = context.require(AWS_REGION)?;
        let transport = if let Some(token) = context.credential(AWS_BEARER_TOKEN_BEDROCK) {
            BedrockTransport::BearerToken(token.to_string())
        } else {
            BedrockTransport::SignedRequest(SigV4Signer::new(
                context.require(AWS_ACCESS_KEY_ID)?,
                context.require(AWS_SECRET_ACCESS_KEY)?,
                context.credential(AWS_SESSION_TOKEN).map(str::to_string),
                region.clone(),
                "bedrock",
            )?)
        };

        let base = api_base(
            context.endpoint.as_deref(),
            &format!("https://bedrock-runtime.{region}.amazonaws.com"),
        );
        let endpoint = format!(
            "{base}/model/{}/invoke",
            aws_percent_encode(&context.model.id, true)
        );
        let auth_hint = match &transport {
            BedrockTransport::BearerToken(_) => format!(
                "check {AWS_BEARER_TOKEN_BEDROCK} is valid and has model access in {region}"
            ),
            BedrockTransport::SignedRequest(_) => format!(
                "check {AWS_ACCESS_KEY_ID}/{AWS_SECRET_ACCESS_KEY} and that model access is enabled in {region}"
            ),
        };
        Ok(Self {
            model: context.model.id.clone(),
            invoker: Invoker::new(context, auth_hint)?,
            region,
            endpoint,
            transport,
        })
    }

    fn build_payload(prompt: &str, options: &GenerateOptions) -> Result<(Value, BedrockParams)> {
        let params = BedrockParams::from_options(options)?;
        let mut text_params = Map::new();
        text_params.insert("text".to_string(), json!(prompt));
        if let Some(negative) = options.negative_prompt() {
            let count = negative.chars().count();
            if count > MAX_NEGATIVE_PROMPT_CHARS {
                return Err(GenerationError::validation(
                    "bedrock",
                    format!("negative prompt must be at most {MAX_NEGATIVE_PROMPT_CHARS} characters (got {count})"),
                ));
            }
            text_params.insert("negativeText".to_string(), json!(negative));
        }

        let mut generation = Map::new();
        generation.insert("numberOfImages".to_string(), json!(1));
        generation.insert("quality".to_string(), json!(params.quality));
        generation.insert("height".to_string(), json!(params.height));
        generation.insert("width".to_string(), json!(params.width));
        generation.insert("cfgScale".to_string(), json!(CFG_SCALE));
        if let Some(seed) = params.seed {
            generation.insert("seed".to_string(), json!(seed));
        }

        let payload = json!({
            "taskType": "TEXT_IMAGE",
            "textToImageParams": text_params,
            "imageGenerationConfig": generation,
        });
        Ok((payload, params))
    }

    fn extract_image(response_payload: &Value) -> Result<Vec<u8>> {
        if let Some(error) = response_payload
            .get("error")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|error| !error.is_empty())
        {
            return Err(GenerationError::Backend {
                backend: "bedrock".to_string(),
                message: error.to_string(),
            });
        }
        let encoded = response_payload
            .get("images")
            .and_then(Value::as_array)
            .and_then(|images| images.iter().filter_map(Value::as_str).find(|image| !image.is_empty()))
            .ok_or_else(|| GenerationError::EmptyResponse {
                backend: "bedrock".to_string(),
            })?;
        decode_image("bedrock", encoded)
    }

    fn request(
        &self,
        body: &[u8],
        attempt: u32,
        max_attempts: u32,
    ) -> Result<reqwest::blocking::RequestBuilder> {
        let sdk_request = format!("attempt={attempt}; max={max_attempts}");
        let request = self
            .invoker
            .http()
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .header("amz-sdk-request", &sdk_request)
            .body(body.to_vec());
        match &self.transport {
            BedrockTransport::BearerToken(token) => Ok(request.bearer_auth(token)),
            BedrockTransport::SignedRequest(signer) => {
                let headers = BTreeMap::from([
                    ("content-type".to_string(), "application/json".to_string()),
                    ("accept".to_string(), "application/json".to_string()),
                ]);
                let signed = signer.sign("POST", &self.endpoint, &headers, body, SigV4Timestamp::now())?;
                Ok(signed.apply(request))
            }
        }
    }
}

/// Validated numeric parameters for a text-to-image request.
#[derive(Debug, Clone, PartialEq)]
struct BedrockParams {
    width: u32,
    height: u32,
    seed: Option<i64>,
    quality: &'static str,
}

impl BedrockParams {
    fn from_options(options: &GenerateOptions) -> Result<Self> {
        let (width, height) = if options.size.trim().is_empty() {
            (DEFAULT_DIMENSION, DEFAULT_DIMENSION)
        } else {
            parse_size(&options.size).ok_or_else(|| {
                GenerationError::validation(
                    "bedrock",
                    format!("size must look like WIDTHxHEIGHT (got {:?})", options.size),
                )
            })?
        };
        validate_dimension("width", width)?;
        validate_dimension("height", height)?;

        if let Some(seed) = options.seed {
            if !(0..=MAX_SEED).contains(&seed) {
                return Err(GenerationError::validation(
                    "bedrock",
                    format!("seed must be between 0 and {MAX_SEED} (got {seed})"),
                ));
            }
        }

        Ok(Self {
            width,
            height,
            seed: options.seed,
            quality: quality_for_style(options.style()),
        })
    }
}

fn validate_dimension(label: &str, value: u32) -> Result<()> {
    if (MIN_DIMENSION..=MAX_DIMENSION).contains(&value) && value % DIMENSION_STEP == 0 {
        return Ok(());
    }
    Err(GenerationError::validation(
        "bedrock",
        format!("{label} must be {MIN_DIMENSION}-{MAX_DIMENSION}, multiple of {DIMENSION_STEP} (got {value})"),
    ))
}

fn quality_for_style(style: Option<&str>) -> &'static str {
    let Some(style) = style else {
        return "standard";
    };
    if PREMIUM_STYLES
        .iter()
        .any(|premium| style.trim().eq_ignore_ascii_case(premium))
    {
        "premium"
    } else {
        "standard"
    }
}

impl ImageBackend for BedrockClient {
    fn family(&self) -> BackendFamily {
        BackendFamily::Bedrock
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
        let prompt = validate_prompt("bedrock", prompt, MAX_PROMPT_CHARS)?;
        let (payload, params) = Self::build_payload(prompt, options)?;
        let body = serde_json::to_vec(&payload)
            .map_err(|err| GenerationError::decode("bedrock", format!("request encoding failed: {err}")))?;

        let bytes = self.invoker.call(cancel, |attempt| {
            debug!(
                model = %self.model,
                region = %self.region,
                transport = self.transport.name(),
                attempt = attempt.number,
                "bedrock invoke"
            );
            let request = self.request(&body, attempt.number, attempt.max)?;
            let response_payload = self.invoker.send_json(request, &self.endpoint)?;
            Self::extract_image(&response_payload)
        })?;
        let mut extras = vec![
            ("region", self.region.clone()),
            ("quality", params.quality.to_string()),
        ];
        if let Some(seed) = params.seed {
            extras.push(("seed", seed.to_string()));
        }
        Ok(finish_image(
            self,
            prompt,
            bytes,
            None,
            (params.width, params.height),
            extras,
        ))
    }

    fn close(&self) {
        self.invoker.close();
    }
}
