use mapsmith_contracts::MapKind;

/// Everything that can go wrong while producing or accepting a map pack.
///
/// `Clone` so one generation outcome can be handed to every caller that was
/// waiting on the same in-flight key.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("could not decode map image: {0}")]
    DecodeFailure(String),

    #[error(
        "map is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}"
    )]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("{kind} map rejected: {measurement} was {measured:.3}, required {requirement}")]
    HeuristicValidationFailure {
        kind: MapKind,
        measurement: &'static str,
        measured: f64,
        requirement: String,
    },

    #[error("failed to start map worker: {0}")]
    WorkerSpawnFailure(String),

    #[error("map worker exited with {}: {excerpt}", exit_label(.code))]
    WorkerNonZeroExit { code: Option<i32>, excerpt: String },

    #[error("map worker output could not be parsed: {0}")]
    WorkerOutputParseFailure(String),

    #[error("map worker reported an error: {0}")]
    WorkerReportedFailure(String),

    #[error("upstream model request failed{}: {message}", status_label(.status))]
    UpstreamRequestFailure { status: Option<u16>, message: String },

    #[error("no acceptable {kind} map after all attempts: {last_error}")]
    AllKindsExhausted { kind: MapKind, last_error: String },

    #[error("map cache write failed: {0}")]
    CacheStoreFailure(String),
}

impl MapError {
    /// Stable name used in event logs and the attempts audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            MapError::InvalidInput(_) => "InvalidInput",
            MapError::DecodeFailure(_) => "DecodeFailure",
            MapError::DimensionMismatch { .. } => "DimensionMismatch",
            MapError::HeuristicValidationFailure { .. } => "HeuristicValidationFailure",
            MapError::WorkerSpawnFailure(_) => "WorkerSpawnFailure",
            MapError::WorkerNonZeroExit { .. } => "WorkerNonZeroExit",
            MapError::WorkerOutputParseFailure(_) => "WorkerOutputParseFailure",
            MapError::WorkerReportedFailure(_) => "WorkerReportedFailure",
            MapError::UpstreamRequestFailure { .. } => "UpstreamRequestFailure",
            MapError::AllKindsExhausted { .. } => "AllKindsExhausted",
            MapError::CacheStoreFailure(_) => "CacheStoreFailure",
        }
    }

    /// Client faults from the upstream model (bad key, bad request) will not
    /// improve on retry; timeouts, throttling, server faults and bad output may.
    pub fn is_retryable(&self) -> bool {
        match self {
            MapError::UpstreamRequestFailure {
                status: Some(status),
                ..
            } => !(400..500).contains(status) || *status == 408 || *status == 429,
            MapError::InvalidInput(_) => false,
            _ => true,
        }
    }

    pub(crate) fn cache(err: anyhow::Error) -> Self {
        MapError::CacheStoreFailure(format!("{err:#}"))
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(status) => format!(" ({status})"),
        None => String::new(),
    }
}
