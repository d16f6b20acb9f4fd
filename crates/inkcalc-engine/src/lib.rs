use std::collections::BTreeMap;
use std::env;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use inkcalc_contracts::answers::{
    bindings_to_prompt_json, parse_answers, AnswerEntry, ParseOutcome, ParseStage,
    VariableBindings,
};
use inkcalc_contracts::events::{AnalysisEvent, EventWriter};
use inkcalc_contracts::normalize::normalize_response_text;
use inkcalc_contracts::prompt::{render_analysis_prompt, ANALYSIS_PROMPT_NAME};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Longest side, per axis, of the image sent to the model.
pub const MAX_IMAGE_SIDE: u32 = 512;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
// Request URLs end up in error chains; the key must stay out of them.
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub image_bytes: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    pub provider_response: Map<String, Value>,
}

/// "Given a prompt and an image, return free-form text."
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn CompletionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: CompletionProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CompletionProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Replies with fixed text; runs the pipeline without a network call.
pub struct DryrunProvider {
    reply: String,
}

impl DryrunProvider {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

impl CompletionProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        Ok(CompletionResponse {
            text: self.reply.clone(),
            model: "dryrun".to_string(),
            provider_response: map_object(json!({
                "status": "ok",
                "prompt_chars": request.prompt.chars().count(),
                "image": format!("{}x{}", request.width, request.height),
            })),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    /// `None` leaves the HTTP client without a request timeout.
    pub request_timeout: Option<Duration>,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            request_timeout: None,
        }
    }

    /// Reads `GEMINI_API_KEY` (or `GOOGLE_API_KEY`), `GEMINI_API_BASE` and
    /// `INKCALC_MODEL`. Blank values count as unset.
    pub fn from_env() -> Result<Self> {
        let Some(api_key) = non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
        else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let mut config = Self::new(api_key);
        if let Some(api_base) = non_empty_env("GEMINI_API_BASE") {
            config.api_base = api_base.trim_end_matches('/').to_string();
        }
        if let Some(model) = non_empty_env("INKCALC_MODEL") {
            config.model = model;
        }
        Ok(config)
    }
}

pub struct GeminiProvider {
    config: GeminiConfig,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        let trimmed = self.config.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.config.api_base, model_path)
    }

    fn build_payload(request: &CompletionRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": request.prompt },
                    {
                        "inlineData": {
                            "mimeType": request.mime_type,
                            "data": BASE64.encode(&request.image_bytes),
                        }
                    },
                ],
            }],
        })
    }

    fn extract_text(response_payload: &Value) -> Result<String> {
        let parts = response_payload
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let text = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<String>();
        if !text.trim().is_empty() {
            return Ok(text);
        }
        if let Some(reason) = response_payload
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
        {
            bail!("Gemini blocked the prompt ({reason})");
        }
        let finish = response_payload
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .unwrap_or("none");
        bail!("Gemini returned no text (finish reason: {finish})");
    }
}

impl CompletionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let endpoint = self.endpoint();
        let response = self
            .http
            .post(&endpoint)
            .header(API_KEY_HEADER, self.config.api_key.as_str())
            .json(&Self::build_payload(request))
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        let text = Self::extract_text(&response_payload)?;
        Ok(CompletionResponse {
            text,
            model: response_payload
                .get("modelVersion")
                .and_then(Value::as_str)
                .unwrap_or(self.config.model.as_str())
                .to_string(),
            provider_response: map_object(json!({
                "candidates": response_payload
                    .get("candidates")
                    .and_then(Value::as_array)
                    .map(|rows| rows.len())
                    .unwrap_or(0),
                "usage_metadata": response_payload.get("usageMetadata").cloned().unwrap_or(Value::Null),
            })),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Answers { stage: ParseStage },
    Unparseable { literal_error: String, json_error: String },
    RequestFailed { error: String },
}

impl AnalysisOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Answers { .. } => "answers",
            Self::Unparseable { .. } => "unparseable",
            Self::RequestFailed { .. } => "request_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub outcome: AnalysisOutcome,
    pub entries: Vec<AnswerEntry>,
    pub raw_text: Option<String>,
    pub normalized_text: Option<String>,
    pub warnings: Vec<String>,
}

impl AnalysisReport {
    fn request_failed(err: &anyhow::Error) -> Self {
        Self {
            outcome: AnalysisOutcome::RequestFailed {
                error: format!("{err:#}"),
            },
            entries: Vec::new(),
            raw_text: None,
            normalized_text: None,
            warnings: Vec::new(),
        }
    }
}

/// Sends an expression image to a completion provider and turns the reply
/// into answer entries.
pub struct ExpressionAnalyzer {
    provider: Arc<dyn CompletionProvider>,
    events: Option<EventWriter>,
}

impl ExpressionAnalyzer {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            provider,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Best effort: every failure ends up as an empty list.
    pub fn analyze(&self, image: &DynamicImage, bindings: &VariableBindings) -> Vec<AnswerEntry> {
        self.analyze_detailed(image, bindings).entries
    }

    pub fn analyze_detailed(
        &self,
        image: &DynamicImage,
        bindings: &VariableBindings,
    ) -> AnalysisReport {
        let report = match self.build_request(image, bindings) {
            Ok(request) => self.run(request),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to prepare analysis request");
                AnalysisReport::request_failed(&err)
            }
        };
        self.emit_finished(&report);
        report
    }

    fn build_request(
        &self,
        image: &DynamicImage,
        bindings: &VariableBindings,
    ) -> Result<CompletionRequest> {
        let constrained = constrain_image(image, MAX_IMAGE_SIDE);
        let image_bytes = encode_png(&constrained)?;
        let prompt = render_analysis_prompt(&bindings_to_prompt_json(bindings));
        Ok(CompletionRequest {
            prompt,
            image_bytes,
            mime_type: "image/png".to_string(),
            width: constrained.width(),
            height: constrained.height(),
        })
    }

    fn run(&self, request: CompletionRequest) -> AnalysisReport {
        self.emit(AnalysisEvent::Started {
            provider: self.provider.name().to_string(),
            prompt: ANALYSIS_PROMPT_NAME.to_string(),
            image_width: request.width,
            image_height: request.height,
            image_sha256: sha256_hex(&request.image_bytes),
        });

        let response = match self.provider.complete(&request) {
            Ok(response) => response,
            Err(err) => {
                warn!(provider = self.provider.name(), error = %format!("{err:#}"), "completion request failed");
                return AnalysisReport::request_failed(&err);
            }
        };
        debug!(text = %response.text, "raw model reply");
        self.emit(AnalysisEvent::ModelReplied {
            model: response.model.clone(),
            chars: response.text.chars().count(),
            provider_response: response.provider_response.clone(),
        });

        let normalized = normalize_response_text(&response.text);
        debug!(text = %normalized, "normalized model reply");

        match parse_answers(&normalized) {
            ParseOutcome::Parsed {
                stage,
                entries,
                warnings,
            } => {
                for warning in &warnings {
                    warn!(%warning, "answer entry coerced");
                }
                info!(stage = stage.as_str(), entries = entries.len(), "parsed model reply");
                AnalysisReport {
                    outcome: AnalysisOutcome::Answers { stage },
                    entries,
                    raw_text: Some(response.text),
                    normalized_text: Some(normalized),
                    warnings,
                }
            }
            ParseOutcome::Unparseable {
                literal_error,
                json_error,
            } => {
                warn!(error = %literal_error, "literal parse failed");
                warn!(error = %json_error, "JSON parse failed");
                self.emit(AnalysisEvent::ParseFailed {
                    literal_error: literal_error.clone(),
                    json_error: json_error.clone(),
                });
                AnalysisReport {
                    outcome: AnalysisOutcome::Unparseable {
                        literal_error,
                        json_error,
                    },
                    entries: Vec::new(),
                    raw_text: Some(response.text),
                    normalized_text: Some(normalized),
                    warnings: Vec::new(),
                }
            }
        }
    }

    fn emit_finished(&self, report: &AnalysisReport) {
        let (stage, error) = match &report.outcome {
            AnalysisOutcome::Answers { stage } => (Some(*stage), None),
            AnalysisOutcome::RequestFailed { error } => (None, Some(error.clone())),
            AnalysisOutcome::Unparseable { .. } => (None, None),
        };
        self.emit(AnalysisEvent::Finished {
            outcome: report.outcome.label().to_string(),
            entries: report.entries.len(),
            stage,
            error,
            warnings: report.warnings.clone(),
        });
    }

    fn emit(&self, event: AnalysisEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(&event) {
            warn!(event = event.kind(), error = %format!("{err:#}"), "failed to write event");
        }
    }
}

/// Shrinks each axis to at most `max_side`, independently. Never upscales.
pub fn constrain_image(image: &DynamicImage, max_side: u32) -> DynamicImage {
    let width = image.width().min(max_side);
    let height = image.height().min(max_side);
    if width == image.width() && height == image.height() {
        return image.clone();
    }
    image.resize_exact(width, height, FilterType::CatmullRom)
}

pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("failed to open image {}", path.display()))
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(bytes)
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{provider} returned invalid JSON payload"))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
