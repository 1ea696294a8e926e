//! Remote model provider: one hosted-model call per map kind, gated by the
//! validator, with per-kind retries and a local fallback.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageFormat, ImageReader};
use mapsmith_contracts::events::now_utc_iso;
use mapsmith_contracts::models::ModelRegistry;
use mapsmith_contracts::{
    GenerationAttempt, GenerationMeta, MapAsset, MapKind, MapPack, ProviderConfig, ProviderKind,
};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::diagnostics::{error_chain_text, sanitize_payload, sanitize_text};
use crate::error::MapError;
use crate::validator::MapValidator;
use crate::worker::{usable_asset, LocalWorkerProvider};
use crate::{fit_within, kinds_label, MapProvider, MapRequest, LOCAL_FALLBACK_MODEL};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(180);

const INPUT_FILENAME: &str = "input.png";
const UPSTREAM_MESSAGE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct ModelCall<'a> {
    pub model: &'a str,
    pub kind: MapKind,
    pub instruction: &'a str,
    /// PNG encoding of the downscaled input.
    pub input_png: &'a [u8],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub usage: Option<Value>,
    pub cost: Option<f64>,
    pub request_id: Option<String>,
}

/// Hosted image-to-image model. Failures carry an HTTP-like status so the
/// provider can tell client faults from transient ones.
pub trait ImageModelClient: Send + Sync {
    fn transform(&self, call: &ModelCall<'_>) -> Result<ModelReply, MapError>;
}

#[derive(Debug, Clone)]
pub struct GeminiImageClient {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiImageClient {
    pub fn new(api_base: &str, api_key: Option<String>, timeout: Duration) -> Self {
        let api_base = api_base.trim().trim_end_matches('/');
        Self {
            api_base: if api_base.is_empty() {
                DEFAULT_GEMINI_API_BASE.to_string()
            } else {
                api_base.to_string()
            },
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            timeout,
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }
}

impl ImageModelClient for GeminiImageClient {
    fn transform(&self, call: &ModelCall<'_>) -> Result<ModelReply, MapError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(MapError::UpstreamRequestFailure {
                status: Some(401),
                message: "no API key configured (set GEMINI_API_KEY or GOOGLE_API_KEY)"
                    .to_string(),
            });
        };
        let endpoint = self.endpoint_for_model(call.model);
        let payload = build_payload(call);

        tracing::debug!(
            model = call.model,
            kind = call.kind.as_str(),
            "requesting map from hosted model"
        );
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .map_err(|raw| {
                let timed_out = raw.is_timeout();
                let err = anyhow::Error::new(raw.without_url())
                    .context(format!("Gemini request failed ({endpoint})"));
                let mut message = error_chain_text(&err, UPSTREAM_MESSAGE_CHARS);
                if timed_out {
                    message = format!("timed out after {}s: {message}", self.timeout.as_secs());
                }
                MapError::UpstreamRequestFailure {
                    status: None,
                    message,
                }
            })?;

        let status = response.status();
        let code = status.as_u16();
        let body = response.text().map_err(|err| MapError::UpstreamRequestFailure {
            status: Some(code),
            message: format!("response body read failed: {err}"),
        })?;
        if !status.is_success() {
            return Err(MapError::UpstreamRequestFailure {
                status: Some(code),
                message: upstream_error_message(&body),
            });
        }
        let parsed: Value =
            serde_json::from_str(&body).map_err(|err| MapError::UpstreamRequestFailure {
                status: Some(code),
                message: format!("Gemini returned invalid JSON payload: {err}"),
            })?;
        extract_reply(&parsed).map_err(|message| MapError::UpstreamRequestFailure {
            status: Some(code),
            message,
        })
    }
}

fn build_payload(call: &ModelCall<'_>) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                {
                    "inlineData": {
                        "mimeType": "image/png",
                        "data": BASE64.encode(call.input_png),
                    }
                },
                { "text": call.instruction },
            ],
        }],
        "generationConfig": {
            "responseModalities": ["IMAGE"],
            "candidateCount": 1,
        },
    })
}

fn extract_reply(payload: &Value) -> Result<ModelReply, String> {
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut finish_reason = None;
    for candidate in &candidates {
        if finish_reason.is_none() {
            finish_reason = candidate
                .get("finishReason")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .map_err(|err| format!("Gemini image base64 decode failed: {err}"))?;
            return Ok(ModelReply {
                bytes,
                mime_type: inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                usage: payload.get("usageMetadata").cloned(),
                cost: None,
                request_id: payload
                    .get("responseId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }
    Err(match finish_reason {
        Some(reason) => format!("Gemini returned no image (finishReason {reason})"),
        None => "Gemini returned no image".to_string(),
    })
}

fn upstream_error_message(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return sanitize_text(body, UPSTREAM_MESSAGE_CHARS);
    };
    let sanitized = sanitize_payload(&parsed);
    let message = sanitized
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| sanitized.to_string());
    sanitize_text(&message, UPSTREAM_MESSAGE_CHARS)
}

pub fn instruction_for(kind: MapKind, width: u32, height: u32) -> String {
    let body = match kind {
        MapKind::Depth => {
            "Produce a grayscale depth map of this photo. White is nearest to the camera, \
             black is farthest. Smooth gradients, no text, no color."
        }
        MapKind::Normals => {
            "Produce a tangent-space surface normal map of this photo, encoded as RGB \
             (red = X, green = Y, blue = Z facing the viewer)."
        }
        MapKind::Edges => {
            "Produce an edge map of this photo: thin white lines on a pure black background \
             tracing the main contours. No shading."
        }
        MapKind::Segmentation => {
            "Produce a binary segmentation mask of this photo: white = main subject, \
             black = background. Only pure black and pure white."
        }
        MapKind::FaceMask => {
            "Produce a binary mask of all human faces in this photo: white = face, \
             black = everything else. Only pure black and pure white."
        }
        MapKind::HandsMask => {
            "Produce a binary mask of all human hands in this photo: white = hand, \
             black = everything else. Only pure black and pure white."
        }
    };
    format!("{body} Output exactly {width}x{height} pixels, same framing as the input.")
}

/// Generates maps through a hosted model, falling back to the local worker
/// for kinds the model never produced acceptably.
pub struct RemoteModelProvider {
    client: Arc<dyn ImageModelClient>,
    local: Arc<LocalWorkerProvider>,
    validator: MapValidator,
    registry: ModelRegistry,
    retry_backoff: Duration,
}

impl RemoteModelProvider {
    pub fn new(
        client: Arc<dyn ImageModelClient>,
        local: Arc<LocalWorkerProvider>,
        validator: MapValidator,
        registry: ModelRegistry,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            client,
            local,
            validator,
            registry,
            retry_backoff,
        }
    }

    /// Downscales the source to the worker's budget and writes `input.png`.
    fn prepare_input(&self, request: &MapRequest<'_>) -> Result<(u32, u32, Vec<u8>), MapError> {
        let source = decode_upright(request.image.bytes())?;
        let (width, height) = source.dimensions();
        let (fit_width, fit_height) = fit_within(width, height, self.local.max_dimension());
        let input = if (fit_width, fit_height) == (width, height) {
            source
        } else {
            source.resize_exact(fit_width, fit_height, FilterType::Triangle)
        };
        let input = DynamicImage::ImageRgb8(input.to_rgb8());
        let png = encode_png(&input)?;
        write_file(&request.output_dir.join(INPUT_FILENAME), &png)?;
        Ok((fit_width, fit_height, png))
    }

    fn attempt_kind(
        &self,
        kind: MapKind,
        config: &ProviderConfig,
        input_png: &[u8],
        expected: (u32, u32),
        output_dir: &Path,
        meta: &mut GenerationMeta,
    ) -> Result<MapAsset, MapError> {
        let instruction = instruction_for(kind, expected.0, expected.1);
        let reply = self.client.transform(&ModelCall {
            model: &config.model_id,
            kind,
            instruction: &instruction,
            input_png,
        })?;

        if let Some(usage) = reply.usage.as_ref() {
            meta.absorb_usage(usage);
        }
        let cost = reply.cost.or_else(|| {
            self.registry
                .get(&config.model_id)
                .and_then(|model| model.cost_per_image_usd)
        });
        if let Some(cost) = cost {
            meta.add_cost(cost);
        }
        if let Some(request_id) = reply.request_id {
            meta.request_id = Some(request_id);
        }

        let accepted = self.validator.accept(kind, &reply.bytes, expected)?;
        let filename = kind.filename();
        write_file(&output_dir.join(&filename), &encode_png(&accepted.image)?)?;
        Ok(MapAsset {
            kind,
            filename,
            width: expected.0,
            height: expected.1,
            generated_at: now_utc_iso(),
            model_used: config.model_id.clone(),
        })
    }

    fn apply_fallback(
        &self,
        request: &MapRequest<'_>,
        source_path: &Path,
        kinds: &[MapKind],
        expected: (u32, u32),
        pack: &mut MapPack,
    ) -> Result<(), MapError> {
        tracing::info!(
            kinds = %kinds_label(kinds),
            "falling back to local worker"
        );
        let result = match self.local.run_worker(source_path, request.output_dir, kinds) {
            Ok(result) => result,
            Err(err) => {
                for kind in kinds {
                    pack.generation_meta.record(
                        GenerationAttempt::failed(*kind, ProviderKind::Local, err.to_string())
                            .via_fallback(),
                    );
                }
                return Err(MapError::AllKindsExhausted {
                    kind: kinds[0],
                    last_error: err.to_string(),
                });
            }
        };

        for kind in kinds {
            let asset = usable_asset(&result, *kind, request.output_dir).and_then(|asset| {
                if (asset.width, asset.height) == expected {
                    Ok(asset)
                } else {
                    Err(format!(
                        "fallback {kind} map is {}x{}, pack is {}x{}",
                        asset.width, asset.height, expected.0, expected.1
                    ))
                }
            });
            match asset {
                Ok(mut asset) => {
                    asset.model_used = LOCAL_FALLBACK_MODEL.to_string();
                    pack.upsert_asset(asset);
                    pack.generation_meta.record(
                        GenerationAttempt::succeeded(*kind, ProviderKind::Local).via_fallback(),
                    );
                }
                Err(reason) => {
                    pack.generation_meta.record(
                        GenerationAttempt::failed(*kind, ProviderKind::Local, reason.clone())
                            .via_fallback(),
                    );
                    return Err(MapError::AllKindsExhausted {
                        kind: *kind,
                        last_error: reason,
                    });
                }
            }
        }
        Ok(())
    }
}

impl MapProvider for RemoteModelProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    fn generate(&self, request: &MapRequest<'_>) -> Result<MapPack, MapError> {
        let config = request.config;
        let source_path = request
            .output_dir
            .join(format!("source.{}", request.image.extension()));
        write_file(&source_path, request.image.bytes())?;
        let (width, height, input_png) = self.prepare_input(request)?;
        let expected = (width, height);

        let created_at = now_utc_iso();
        let mut pack = MapPack {
            source_hash: request.fingerprint.to_string(),
            source_width: width,
            source_height: height,
            created_at: created_at.clone(),
            provider: ProviderKind::Remote,
            generation_meta: GenerationMeta::new(
                ProviderKind::Remote,
                config.model_id.clone(),
                created_at,
            ),
            maps: Vec::new(),
            input_filename: INPUT_FILENAME.to_string(),
        };

        let mut needs_fallback = Vec::new();
        for kind in self.local.enabled_kinds().iter().copied() {
            let mut last_error: Option<MapError> = None;
            let mut accepted = false;
            for attempt in 0..=config.max_retries {
                if attempt > 0 && !self.retry_backoff.is_zero() {
                    thread::sleep(self.retry_backoff * u32::from(attempt));
                }
                match self.attempt_kind(
                    kind,
                    config,
                    &input_png,
                    expected,
                    request.output_dir,
                    &mut pack.generation_meta,
                ) {
                    Ok(asset) => {
                        pack.upsert_asset(asset);
                        pack.generation_meta
                            .record(GenerationAttempt::succeeded(kind, ProviderKind::Remote));
                        accepted = true;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            kind = kind.as_str(),
                            attempt = attempt + 1,
                            error = %err,
                            "remote map attempt rejected"
                        );
                        pack.generation_meta.record(GenerationAttempt::failed(
                            kind,
                            ProviderKind::Remote,
                            err.to_string(),
                        ));
                        let retryable = err.is_retryable();
                        last_error = Some(err);
                        if !retryable {
                            break;
                        }
                    }
                }
            }
            if accepted {
                continue;
            }
            if config.allow_fallback {
                needs_fallback.push(kind);
                continue;
            }
            return Err(MapError::AllKindsExhausted {
                kind,
                last_error: last_error
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "no attempts were made".to_string()),
            });
        }

        if !needs_fallback.is_empty() {
            self.apply_fallback(request, &source_path, &needs_fallback, expected, &mut pack)?;
        }
        Ok(pack)
    }
}

/// Applies the EXIF orientation so sizes agree with the worker's upright read.
fn decode_upright(bytes: &[u8]) -> Result<DynamicImage, MapError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(undecodable)?
        .into_decoder()
        .map_err(undecodable)?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder).map_err(undecodable)?;
    image.apply_orientation(orientation);
    Ok(image)
}

fn undecodable(err: impl std::fmt::Display) -> MapError {
    MapError::InvalidInput(format!("source image could not be decoded: {err}"))
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, MapError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| MapError::CacheStoreFailure(format!("PNG encode failed: {err}")))?;
    Ok(bytes)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), MapError> {
    std::fs::write(path, bytes).map_err(|err| {
        MapError::CacheStoreFailure(format!("failed to write {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use image::{GrayImage, Luma};
    use mapsmith_contracts::ProviderConfig;

    use super::*;
    use crate::fingerprint::ImagePayload;
    use crate::worker::tests::{png_payload, CannedWorker};

    type Script = Box<dyn Fn(&ModelCall<'_>, usize) -> Result<ModelReply, MapError> + Send + Sync>;

    struct ScriptedModel {
        calls: AtomicUsize,
        instructions: Mutex<Vec<String>>,
        script: Script,
    }

    impl ScriptedModel {
        fn new(script: Script) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                instructions: Mutex::new(Vec::new()),
                script,
            }
        }
    }

    impl ImageModelClient for ScriptedModel {
        fn transform(&self, call: &ModelCall<'_>) -> Result<ModelReply, MapError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.instructions.lock() {
                seen.push(call.instruction.to_string());
            }
            (self.script)(call, index)
        }
    }

    fn png(image: GrayImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        let _ = DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png);
        bytes
    }

    fn checkerboard(width: u32, height: u32) -> Vec<u8> {
        png(GrayImage::from_fn(width, height, |x, y| {
            Luma([if (x / 2 + y / 2) % 2 == 0 { 0 } else { 255 }])
        }))
    }

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        png(GrayImage::from_fn(width, height, |x, _| {
            Luma([(x * 255 / (width - 1).max(1)) as u8])
        }))
    }

    fn flat_gray(width: u32, height: u32) -> Vec<u8> {
        png(GrayImage::from_pixel(width, height, Luma([128])))
    }

    fn reply(bytes: Vec<u8>) -> ModelReply {
        ModelReply {
            bytes,
            mime_type: Some("image/png".to_string()),
            ..ModelReply::default()
        }
    }

    fn provider(
        model: Arc<ScriptedModel>,
        worker: Arc<CannedWorker>,
        kinds: Vec<MapKind>,
    ) -> RemoteModelProvider {
        RemoteModelProvider::new(
            model,
            Arc::new(LocalWorkerProvider::new(worker, kinds, 1.0)),
            MapValidator::default(),
            ModelRegistry::new(None),
            Duration::ZERO,
        )
    }

    fn run(
        provider: &RemoteModelProvider,
        image: &ImagePayload,
        dir: &Path,
        config: &ProviderConfig,
    ) -> Result<MapPack, MapError> {
        let fingerprint = image.fingerprint();
        provider.generate(&MapRequest {
            fingerprint: &fingerprint,
            image,
            output_dir: dir,
            config,
        })
    }

    fn remote_config(allow_fallback: bool, max_retries: u8) -> ProviderConfig {
        ProviderConfig {
            provider: ProviderKind::Remote,
            allow_fallback,
            max_retries,
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn failing_depth_falls_back_to_local_worker() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let model = Arc::new(ScriptedModel::new(Box::new(|_, _| Ok(reply(flat_gray(6, 4))))));
        let worker = Arc::new(CannedWorker::new(6, 4));
        let provider = provider(model.clone(), worker.clone(), vec![MapKind::Depth]);
        let pack = run(&provider, &png_payload()?, temp.path(), &remote_config(true, 0))?;

        let depth = pack.asset(MapKind::Depth).ok_or_else(|| anyhow::anyhow!("no depth"))?;
        assert_eq!(depth.model_used, LOCAL_FALLBACK_MODEL);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);

        let attempts = &pack.generation_meta.attempts;
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].provider, ProviderKind::Remote);
        assert!(!attempts[0].ok);
        assert!(attempts[0]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("depth map rejected")));
        assert_eq!(attempts[1].provider, ProviderKind::Local);
        assert!(attempts[1].ok);
        assert_eq!(attempts[1].used_fallback, Some(true));
        Ok(())
    }

    #[test]
    fn fallback_is_limited_to_failed_kinds() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let model = Arc::new(ScriptedModel::new(Box::new(|call, _| match call.kind {
            MapKind::Segmentation => Ok(reply(checkerboard(6, 4))),
            _ => Ok(reply(flat_gray(6, 4))),
        })));
        let worker = Arc::new(CannedWorker::new(6, 4));
        let provider = provider(
            model,
            worker.clone(),
            vec![MapKind::Depth, MapKind::Segmentation],
        );
        let pack = run(&provider, &png_payload()?, temp.path(), &remote_config(true, 1))?;

        let seen = worker.seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kinds, vec![MapKind::Depth]);
        let segmentation = pack
            .asset(MapKind::Segmentation)
            .ok_or_else(|| anyhow::anyhow!("no segmentation"))?;
        assert_eq!(segmentation.model_used, pack.generation_meta.model_id);
        assert!(temp.path().join("segmentation.png").is_file());
        assert_eq!(pack.maps.len(), 2);
        Ok(())
    }

    #[test]
    fn exhausted_kind_without_fallback_fails_the_pack() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let model = Arc::new(ScriptedModel::new(Box::new(|_, _| Ok(reply(flat_gray(6, 4))))));
        let worker = Arc::new(CannedWorker::new(6, 4));
        let provider = provider(model.clone(), worker.clone(), vec![MapKind::FaceMask]);
        let err = run(&provider, &png_payload()?, temp.path(), &remote_config(false, 2)).err();

        let Some(MapError::AllKindsExhausted { kind, last_error }) = err else {
            panic!("expected AllKindsExhausted, got {err:?}");
        };
        assert_eq!(kind, MapKind::FaceMask);
        assert!(last_error.contains("faceMask map rejected"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
        assert!(!temp.path().join("faceMask.png").exists());
        Ok(())
    }

    #[test]
    fn near_miss_output_is_repaired_and_accepted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let model = Arc::new(ScriptedModel::new(Box::new(|_, _| {
            Ok(reply(checkerboard(12, 8)))
        })));
        let worker = Arc::new(CannedWorker::new(6, 4));
        let provider = provider(model, worker.clone(), vec![MapKind::HandsMask]);
        let pack = run(&provider, &png_payload()?, temp.path(), &remote_config(false, 0))?;

        let hands = pack
            .asset(MapKind::HandsMask)
            .ok_or_else(|| anyhow::anyhow!("no hands mask"))?;
        assert_eq!((hands.width, hands.height), (6, 4));
        let saved = image::open(temp.path().join(&hands.filename))?;
        assert_eq!(saved.dimensions(), (6, 4));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn retry_succeeds_after_a_transient_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let model = Arc::new(ScriptedModel::new(Box::new(|_, index| {
            if index == 0 {
                return Err(MapError::UpstreamRequestFailure {
                    status: Some(503),
                    message: "overloaded".to_string(),
                });
            }
            Ok(reply(gradient(6, 4)))
        })));
        let worker = Arc::new(CannedWorker::new(6, 4));
        let provider = provider(model.clone(), worker, vec![MapKind::Depth]);
        let pack = run(&provider, &png_payload()?, temp.path(), &remote_config(false, 1))?;

        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        let attempts = &pack.generation_meta.attempts;
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].ok);
        assert!(attempts[1].ok);
        assert_eq!(attempts[1].used_fallback, None);
        Ok(())
    }

    #[test]
    fn client_faults_are_not_retried() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let model = Arc::new(ScriptedModel::new(Box::new(|_, _| {
            Err(MapError::UpstreamRequestFailure {
                status: Some(400),
                message: "bad request".to_string(),
            })
        })));
        let worker = Arc::new(CannedWorker::new(6, 4));
        let provider = provider(model.clone(), worker.clone(), vec![MapKind::Edges]);
        let pack = run(&provider, &png_payload()?, temp.path(), &remote_config(true, 5))?;

        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        let edges = pack.asset(MapKind::Edges).ok_or_else(|| anyhow::anyhow!("no edges"))?;
        assert_eq!(edges.model_used, LOCAL_FALLBACK_MODEL);
        Ok(())
    }

    #[test]
    fn usage_and_cost_accumulate_across_calls() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let model = Arc::new(ScriptedModel::new(Box::new(|call, index| {
            let bytes = match call.kind {
                MapKind::Depth => gradient(6, 4),
                _ => checkerboard(6, 4),
            };
            Ok(ModelReply {
                usage: Some(json!({"promptTokenCount": 10, "totalTokenCount": 25})),
                request_id: Some(format!("req-{index}")),
                ..reply(bytes)
            })
        })));
        let worker = Arc::new(CannedWorker::new(6, 4));
        let provider = provider(
            model.clone(),
            worker,
            vec![MapKind::Depth, MapKind::Segmentation],
        );
        let pack = run(&provider, &png_payload()?, temp.path(), &remote_config(false, 0))?;

        let meta = &pack.generation_meta;
        assert_eq!(meta.usage, Some(json!({"promptTokenCount": 20, "totalTokenCount": 50})));
        let cost = meta.cost.ok_or_else(|| anyhow::anyhow!("no cost"))?;
        assert!((cost - 0.078).abs() < 1e-9);
        assert_eq!(meta.request_id.as_deref(), Some("req-1"));

        let instructions = model
            .instructions
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert!(instructions.iter().all(|text| text.contains("6x4")));
        Ok(())
    }

    #[test]
    fn large_inputs_are_downscaled_like_the_worker() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = image::RgbImage::from_fn(1200, 800, |x, _| image::Rgb([(x % 256) as u8, 0, 0]));
        let mut bytes = Vec::new();
        source.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        let image = ImagePayload::from_bytes(bytes)?;

        let model = Arc::new(ScriptedModel::new(Box::new(|_, _| {
            Ok(reply(checkerboard(1000, 666)))
        })));
        let worker = Arc::new(CannedWorker::new(1000, 666));
        let provider = provider(model, worker, vec![MapKind::Segmentation]);
        let pack = run(&provider, &image, temp.path(), &remote_config(false, 0))?;

        assert_eq!((pack.source_width, pack.source_height), (1000, 666));
        let input = image::open(temp.path().join(&pack.input_filename))?;
        assert_eq!(input.dimensions(), (1000, 666));
        assert!(temp.path().join("source.png").is_file());
        Ok(())
    }

    #[test]
    fn fallback_with_mismatched_size_is_exhausted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let model = Arc::new(ScriptedModel::new(Box::new(|_, _| Ok(reply(flat_gray(6, 4))))));
        let worker = Arc::new(CannedWorker::new(5, 4));
        let provider = provider(model, worker, vec![MapKind::Depth]);
        let err = run(&provider, &png_payload()?, temp.path(), &remote_config(true, 0)).err();
        assert!(matches!(
            err,
            Some(MapError::AllKindsExhausted {
                kind: MapKind::Depth,
                ..
            })
        ));
        Ok(())
    }

    // 6x4 pixels with EXIF orientation 6 (rotate 90 clockwise).
    fn rotated_jpeg() -> anyhow::Result<Vec<u8>> {
        let source = image::RgbImage::from_fn(6, 4, |x, y| image::Rgb([x as u8 * 40, y as u8 * 60, 90]));
        let mut jpeg = Vec::new();
        source.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)?;

        let mut exif = b"Exif\0\0MM\0\x2a\0\0\0\x08".to_vec();
        exif.extend_from_slice(&[0x00, 0x01]);
        exif.extend_from_slice(&[0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
        exif.extend_from_slice(&[0x00, 0x06, 0x00, 0x00]);
        exif.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        let length = u16::try_from(exif.len() + 2)?;

        let mut bytes = jpeg[..2].to_vec();
        bytes.extend_from_slice(&[0xFF, 0xE1]);
        bytes.extend_from_slice(&length.to_be_bytes());
        bytes.extend_from_slice(&exif);
        bytes.extend_from_slice(&jpeg[2..]);
        Ok(bytes)
    }

    #[test]
    fn exif_rotation_is_applied_before_sizing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = ImagePayload::from_bytes(rotated_jpeg()?)?;
        let model = Arc::new(ScriptedModel::new(Box::new(|_, _| {
            Err(MapError::UpstreamRequestFailure {
                status: Some(503),
                message: "overloaded".to_string(),
            })
        })));
        let worker = Arc::new(CannedWorker::new(4, 6));
        let provider = provider(model, worker.clone(), vec![MapKind::Depth]);
        let pack = run(&provider, &image, temp.path(), &remote_config(true, 0))?;

        assert_eq!((pack.source_width, pack.source_height), (4, 6));
        let input = image::open(temp.path().join(&pack.input_filename))?;
        assert_eq!(input.dimensions(), (4, 6));
        let depth = pack.asset(MapKind::Depth).ok_or_else(|| anyhow::anyhow!("no depth"))?;
        assert_eq!(depth.model_used, LOCAL_FALLBACK_MODEL);
        assert_eq!((depth.width, depth.height), (4, 6));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn gemini_reply_extraction() -> anyhow::Result<()> {
        let payload = json!({
            "responseId": "abc",
            "usageMetadata": {"totalTokenCount": 7},
            "candidates": [{
                "content": {"parts": [
                    {"text": "here you go"},
                    {"inlineData": {"mimeType": "image/png", "data": BASE64.encode([1u8, 2, 3])}}
                ]}
            }]
        });
        let reply = extract_reply(&payload).map_err(anyhow::Error::msg)?;
        assert_eq!(reply.bytes, vec![1, 2, 3]);
        assert_eq!(reply.mime_type.as_deref(), Some("image/png"));
        assert_eq!(reply.request_id.as_deref(), Some("abc"));
        assert_eq!(reply.usage, Some(json!({"totalTokenCount": 7})));

        let refused = json!({"candidates": [{"finishReason": "SAFETY", "content": {"parts": []}}]});
        assert_eq!(
            extract_reply(&refused).err().as_deref(),
            Some("Gemini returned no image (finishReason SAFETY)")
        );
        Ok(())
    }

    #[test]
    fn gemini_payload_carries_image_and_instruction() {
        let call = ModelCall {
            model: "gemini-2.5-flash-image",
            kind: MapKind::Edges,
            instruction: "draw edges",
            input_png: &[9, 9],
        };
        let payload = build_payload(&call);
        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], json!("image/png"));
        assert_eq!(parts[0]["inlineData"]["data"], json!(BASE64.encode([9u8, 9])));
        assert_eq!(parts[1]["text"], json!("draw edges"));
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["IMAGE"])
        );
    }

    #[test]
    fn upstream_error_bodies_are_redacted() {
        let blob = "QUJD".repeat(100);
        let body = json!({"error": {"code": 400, "message": format!("bad image data:image/png;base64,{blob}")}})
            .to_string();
        assert_eq!(
            upstream_error_message(&body),
            "bad image data:image/png;base64,<omitted>"
        );
        assert_eq!(upstream_error_message("\u{1b}[31mgateway\u{1b}[0m"), "gateway");
    }

    #[test]
    fn missing_api_key_is_a_client_fault() {
        let client = GeminiImageClient::new("", None, DEFAULT_REMOTE_TIMEOUT);
        let err = client
            .transform(&ModelCall {
                model: "gemini-2.5-flash-image",
                kind: MapKind::Depth,
                instruction: "x",
                input_png: &[],
            })
            .err();
        let Some(err @ MapError::UpstreamRequestFailure { status: Some(401), .. }) = err else {
            panic!("expected a 401 upstream failure, got {err:?}");
        };
        assert!(!err.is_retryable());
        assert_eq!(
            client.endpoint_for_model("gemini-2.5-flash-image"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
    }

    #[test]
    fn instructions_name_the_output_size() {
        for kind in MapKind::ALL {
            let text = instruction_for(kind, 640, 480);
            assert!(text.contains("640x480"), "{kind}: {text}");
        }
        assert!(instruction_for(MapKind::FaceMask, 1, 1).contains("white = face"));
    }
}
