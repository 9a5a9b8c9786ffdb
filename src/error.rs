use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StemError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error("onnx runtime: {0}")]
    Ort(#[from] ort::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("wav: {0}")]
    Wav(#[from] hound::Error),

    #[error("decode: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    #[error("array shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("manifest: {0}")]
    Manifest(String),

    #[error("checksum mismatch for {path}")]
    Checksum { path: String },

    #[error("{program} exited with {status}: {stderr}")]
    Tool {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("resample: {0}")]
    Resample(String),

    #[error("empty audio")]
    EmptyAudio,

    #[error("all acquisition strategies failed for {locator}")]
    Acquisition { locator: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job '{0}' is already running")]
    JobInFlight(String),
}

impl From<rubato::ResamplerConstructionError> for StemError {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        StemError::Resample(e.to_string())
    }
}

impl From<rubato::ResampleError> for StemError {
    fn from(e: rubato::ResampleError) -> Self {
        StemError::Resample(e.to_string())
    }
}

impl StemError {
    /// HTTP-equivalent status for the server layer.
    pub fn status_code(&self) -> u16 {
        match self {
            StemError::InvalidRequest(_) => 400,
            StemError::NotFound(_) => 404,
            StemError::JobInFlight(_) => 409,
            _ => 500,
        }
    }

    /// Message safe to show to a user: no paths, no tool output.
    pub fn user_message(&self) -> String {
        match self {
            StemError::Acquisition { .. } => "Failed to download audio from the remote source".into(),
            StemError::InvalidRequest(msg) => msg.clone(),
            StemError::NotFound(_) => "Input file not found".into(),
            StemError::JobInFlight(key) => format!("Job '{key}' is already running"),
            StemError::EmptyAudio | StemError::Decode(_) | StemError::Wav(_) => {
                "The downloaded audio could not be read".into()
            }
            StemError::Ort(_) | StemError::Manifest(_) | StemError::Checksum { .. } => {
                "The separation model is unavailable".into()
            }
            _ => "Audio separation failed".into(),
        }
    }
}

/// Structured error body handed to the server layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    #[serde(skip)]
    pub status: u16,
    pub error: String,
}

impl From<&StemError> for ErrorPayload {
    fn from(e: &StemError) -> Self {
        Self {
            status: e.status_code(),
            error: e.user_message(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_failure_hides_locator() {
        let e = StemError::Acquisition {
            locator: "https://example.com/watch?v=secret".into(),
        };
        let payload = ErrorPayload::from(&e);
        assert_eq!(payload.status, 500);
        assert!(!payload.error.contains("secret"));
    }

    #[test]
    fn status_codes() {
        assert_eq!(StemError::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(StemError::NotFound("x".into()).status_code(), 404);
        assert_eq!(StemError::JobInFlight("x".into()).status_code(), 409);
        assert_eq!(StemError::EmptyAudio.status_code(), 500);
    }

    #[test]
    fn payload_serializes_message_only() {
        let payload = ErrorPayload::from(&StemError::InvalidRequest("missing locator".into()));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "missing locator" }));
    }
}
