//! Boundary to the content-generation service.
//!
//! The core never builds prompts; it hands the backend an opaque request and
//! decides when the call may happen and where its result lands.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::Serialize;
use tracing::debug;

use crate::error::UpstreamError;
use crate::model::{Analysis, AspectRatio, BatchQueueItem, ImagePayload, OutputSize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub topic: String,
    pub style: String,
    pub palette: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl AnalyzeRequest {
    pub fn for_item(item: &BatchQueueItem) -> Self {
        Self {
            topic: item.topic.clone(),
            style: item.style.clone(),
            palette: item.palette.clone(),
            filters: item.filters.clone(),
            content: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub visual_plan: String,
    pub size: OutputSize,
    pub aspect_ratio: AspectRatio,
}

/// Two-phase generation: analyze a topic, then render its visual plan.
pub trait GenerationBackend: Send + Sync {
    fn analyze(&self, request: &AnalyzeRequest) -> Result<Analysis, UpstreamError>;

    fn render(&self, request: &RenderRequest) -> Result<ImagePayload, UpstreamError>;
}

/// Exit codes an external backend program uses to classify failures.
pub mod exit_codes {
    pub const INVALID_INPUT: i32 = 2;
    pub const BLOCKED: i32 = 3;
    pub const THROTTLED: i32 = 4;
}

/// Runs an external program per call: `<program> analyze` or
/// `<program> render`, request JSON on stdin, result on stdout.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn invoke<T: Serialize>(&self, phase: &str, request: &T) -> Result<Vec<u8>, UpstreamError> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| UpstreamError::InvalidInput(format!("unserializable request: {err}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(phase)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                UpstreamError::Unavailable(format!(
                    "failed to execute {}: {err}",
                    self.program.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).map_err(|err| {
                UpstreamError::Unavailable(format!("failed to send {phase} request: {err}"))
            })?;
        }

        let output = child.wait_with_output().map_err(|err| {
            UpstreamError::Unavailable(format!("failed to wait for {phase}: {err}"))
        })?;
        debug!(
            program = %self.program.display(),
            phase,
            status = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            "backend call finished"
        );

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_exit(output.status.code(), stderr.trim()))
        }
    }
}

pub fn classify_exit(code: Option<i32>, message: &str) -> UpstreamError {
    let message = if message.is_empty() {
        format!("backend exited with status {code:?}")
    } else {
        message.to_string()
    };

    match code {
        Some(exit_codes::INVALID_INPUT) => UpstreamError::InvalidInput(message),
        Some(exit_codes::BLOCKED) => UpstreamError::Blocked(message),
        Some(exit_codes::THROTTLED) => UpstreamError::Throttled(message),
        _ => UpstreamError::Unavailable(message),
    }
}

impl GenerationBackend for CommandBackend {
    fn analyze(&self, request: &AnalyzeRequest) -> Result<Analysis, UpstreamError> {
        let stdout = self.invoke("analyze", request)?;
        serde_json::from_slice(&stdout)
            .map_err(|err| UpstreamError::Unavailable(format!("malformed analysis output: {err}")))
    }

    fn render(&self, request: &RenderRequest) -> Result<ImagePayload, UpstreamError> {
        let stdout = self.invoke("render", request)?;
        if stdout.is_empty() {
            return Err(UpstreamError::Unavailable("render produced no image".to_string()));
        }

        let mime = image::guess_format(&stdout)
            .map(|format| format.to_mime_type())
            .map_err(|err| UpstreamError::Unavailable(format!("render output is not an image: {err}")))?;
        Ok(ImagePayload::new(mime, stdout))
    }
}
