//! Local worker provider.
//!
//! Wire contract with the worker process:
//!
//! ```text
//! <worker> --input <path> --output-dir <dir> --maps <kind,kind,...> --max-dimension <int>
//! ```
//!
//! The worker writes one PNG per produced kind into the output directory.
//! Its stdout may contain anything, but the last non-empty line must be a
//! JSON object, either
//! `{"maps": [MapAsset...], "sourceWidth": n, "sourceHeight": n, "inputFilename": "..."}`
//! or `{"error": "..."}`. Stderr is diagnostic only. Kinds the worker could not
//! produce are left out of `maps`.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use mapsmith_contracts::events::now_utc_iso;
use mapsmith_contracts::{
    GenerationAttempt, GenerationMeta, MapAsset, MapKind, MapPack, ProviderKind,
};
use serde::Deserialize;
use serde_json::Value;

use crate::diagnostics::{excerpt_tail, sanitize_text};
use crate::error::MapError;
use crate::{kinds_label, max_dimension_for, MapProvider, MapRequest};

pub const LOCAL_MODEL_ID: &str = "local-worker";

const STDERR_EXCERPT_CHARS: usize = 600;
const PROTOCOL_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub kinds: Vec<MapKind>,
    pub max_dimension: u32,
}

impl WorkerInvocation {
    pub fn args(&self) -> Vec<String> {
        vec![
            "--input".to_string(),
            self.input.to_string_lossy().to_string(),
            "--output-dir".to_string(),
            self.output_dir.to_string_lossy().to_string(),
            "--maps".to_string(),
            kinds_label(&self.kinds),
            "--max-dimension".to_string(),
            self.max_dimension.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait WorkerRunner: Send + Sync {
    fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerOutput, MapError>;
}

#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: String,
    base_args: Vec<String>,
}

impl ProcessWorker {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Splits a shell-style command line such as `python3 scripts/generate_maps.py`.
    pub fn from_command_line(command_line: &str) -> Result<Self, MapError> {
        let mut words = shell_words::split(command_line).map_err(|err| {
            MapError::InvalidInput(format!("worker command line is malformed: {err}"))
        })?;
        if words.is_empty() {
            return Err(MapError::InvalidInput(
                "worker command line is empty".to_string(),
            ));
        }
        let program = words.remove(0);
        Ok(Self::new(program, words))
    }
}

impl WorkerRunner for ProcessWorker {
    fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerOutput, MapError> {
        tracing::debug!(
            program = %self.program,
            kinds = %kinds_label(&invocation.kinds),
            max_dimension = invocation.max_dimension,
            "spawning map worker"
        );
        let output = Command::new(&self.program)
            .args(&self.base_args)
            .args(invocation.args())
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                MapError::WorkerSpawnFailure(format!("{}: {err}", self.program))
            })?;
        Ok(WorkerOutput {
            exit_code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    #[serde(default)]
    pub maps: Vec<MapAsset>,
    pub source_width: u32,
    pub source_height: u32,
    pub input_filename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Completed(WorkerResult),
    Failed(String),
}

/// Parses the trailing result line of the worker's stdout.
pub fn parse_worker_reply(stdout: &str) -> Result<WorkerReply, MapError> {
    let Some(line) = stdout.lines().rev().map(str::trim).find(|line| !line.is_empty()) else {
        return Err(MapError::WorkerOutputParseFailure(
            "worker printed nothing on stdout".to_string(),
        ));
    };
    let parsed: Value = serde_json::from_str(line).map_err(|err| {
        MapError::WorkerOutputParseFailure(format!(
            "last stdout line is not JSON ({err}): {}",
            sanitize_text(line, PROTOCOL_EXCERPT_CHARS)
        ))
    })?;
    let Some(object) = parsed.as_object() else {
        return Err(MapError::WorkerOutputParseFailure(
            "last stdout line is not a JSON object".to_string(),
        ));
    };
    if let Some(error) = object.get("error") {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Ok(WorkerReply::Failed(sanitize_text(
            &message,
            STDERR_EXCERPT_CHARS,
        )));
    }
    let result: WorkerResult = serde_json::from_value(parsed).map_err(|err| {
        MapError::WorkerOutputParseFailure(format!("result JSON has the wrong shape: {err}"))
    })?;
    for asset in &result.maps {
        ensure_plain_filename(&asset.filename)?;
    }
    ensure_plain_filename(&result.input_filename)?;
    Ok(WorkerReply::Completed(result))
}

fn ensure_plain_filename(name: &str) -> Result<(), MapError> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    if plain {
        return Ok(());
    }
    Err(MapError::WorkerOutputParseFailure(format!(
        "worker reported a non-local filename '{}'",
        sanitize_text(name, PROTOCOL_EXCERPT_CHARS)
    )))
}

pub struct LocalWorkerProvider {
    runner: Arc<dyn WorkerRunner>,
    enabled: Vec<MapKind>,
    max_megapixels: f64,
}

impl LocalWorkerProvider {
    pub fn new(runner: Arc<dyn WorkerRunner>, enabled: Vec<MapKind>, max_megapixels: f64) -> Self {
        Self {
            runner,
            enabled,
            max_megapixels,
        }
    }

    pub fn enabled_kinds(&self) -> &[MapKind] {
        &self.enabled
    }

    pub fn max_dimension(&self) -> u32 {
        max_dimension_for(self.max_megapixels)
    }

    /// One worker run for `kinds`. Failures are returned as-is; nothing is
    /// retried here.
    pub fn run_worker(
        &self,
        input: &Path,
        output_dir: &Path,
        kinds: &[MapKind],
    ) -> Result<WorkerResult, MapError> {
        let invocation = WorkerInvocation {
            input: input.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            kinds: kinds.to_vec(),
            max_dimension: self.max_dimension(),
        };
        let output = self.runner.run(&invocation)?;
        let reply = parse_worker_reply(&output.stdout);

        if !output.success {
            let mut excerpt = excerpt_tail(&output.stderr, STDERR_EXCERPT_CHARS);
            if excerpt.is_empty() {
                excerpt = match &reply {
                    Ok(WorkerReply::Failed(message)) => message.clone(),
                    _ => "no diagnostic output".to_string(),
                };
            }
            return Err(MapError::WorkerNonZeroExit {
                code: output.exit_code,
                excerpt,
            });
        }

        if !output.stderr.trim().is_empty() {
            tracing::debug!(
                stderr = %excerpt_tail(&output.stderr, STDERR_EXCERPT_CHARS),
                "map worker diagnostics"
            );
        }

        match reply? {
            WorkerReply::Completed(result) => Ok(result),
            WorkerReply::Failed(message) => Err(MapError::WorkerReportedFailure(message)),
        }
    }
}

impl MapProvider for LocalWorkerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn generate(&self, request: &MapRequest<'_>) -> Result<MapPack, MapError> {
        let input_path = request
            .output_dir
            .join(format!("source.{}", request.image.extension()));
        std::fs::write(&input_path, request.image.bytes()).map_err(|err| {
            MapError::CacheStoreFailure(format!("failed to write {}: {err}", input_path.display()))
        })?;

        let result = self.run_worker(&input_path, request.output_dir, &self.enabled)?;
        let created_at = now_utc_iso();
        let mut pack = MapPack {
            source_hash: request.fingerprint.to_string(),
            source_width: result.source_width,
            source_height: result.source_height,
            created_at: created_at.clone(),
            provider: ProviderKind::Local,
            generation_meta: GenerationMeta::new(ProviderKind::Local, LOCAL_MODEL_ID, created_at),
            maps: Vec::new(),
            input_filename: result.input_filename.clone(),
        };

        for kind in &self.enabled {
            match usable_asset(&result, *kind, request.output_dir) {
                Ok(asset) => {
                    pack.upsert_asset(asset);
                    pack.generation_meta
                        .record(GenerationAttempt::succeeded(*kind, ProviderKind::Local));
                }
                Err(reason) => {
                    tracing::warn!(kind = kind.as_str(), %reason, "local worker skipped map");
                    pack.generation_meta.record(GenerationAttempt::failed(
                        *kind,
                        ProviderKind::Local,
                        reason,
                    ));
                }
            }
        }

        Ok(pack)
    }
}

/// The worker's asset for `kind`, if it reported one that exists on disk and
/// matches the pack's source size.
pub(crate) fn usable_asset(
    result: &WorkerResult,
    kind: MapKind,
    output_dir: &Path,
) -> Result<MapAsset, String> {
    let Some(asset) = result.maps.iter().rev().find(|asset| asset.kind == kind) else {
        return Err(format!("worker did not produce a {kind} map"));
    };
    if !output_dir.join(&asset.filename).is_file() {
        return Err(format!(
            "worker reported {} but the file was not written",
            asset.filename
        ));
    }
    if (asset.width, asset.height) != (result.source_width, result.source_height) {
        return Err(format!(
            "worker {kind} map is {}x{}, source is {}x{}",
            asset.width, asset.height, result.source_width, result.source_height
        ));
    }
    Ok(asset.clone())
}
