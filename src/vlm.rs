use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, multipart};
use serde::Deserialize;

const FRAME_DESCRIPTION_HEADER: &str = "FRAME_DESCRIPTION:";
const ROLLING_CONTEXT_HEADER: &str = "ROLLING_CONTEXT:";

/// Errors from the remote vision-language analysis service.
#[derive(Debug)]
pub enum VlmError {
    Http(reqwest::Error),
    UnexpectedStatus { status: StatusCode, body: String },
    EmptyImage,
    /// The model broke the mandated output format. Never silently coerced.
    MalformedResponse(String),
}

impl fmt::Display for VlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VlmError::Http(err) => write!(f, "vlm http error: {err}"),
            VlmError::UnexpectedStatus { status, body } => {
                write!(f, "vlm unexpected status {status}: {body}")
            }
            VlmError::EmptyImage => write!(f, "empty image buffer"),
            VlmError::MalformedResponse(detail) => {
                write!(f, "vlm response violates the output format: {detail}")
            }
        }
    }
}

impl std::error::Error for VlmError {}

impl From<reqwest::Error> for VlmError {
    fn from(value: reqwest::Error) -> Self {
        VlmError::Http(value)
    }
}

/// Parsed two-section analysis result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisSections {
    pub frame_description: String,
    pub rolling_context: String,
}

/// Static business/camera context woven into every analysis prompt.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub business_name: String,
    pub business_type: String,
    pub camera_name: String,
    pub camera_description: String,
    pub analysis_goal: String,
}

/// Build the analysis prompt: business context, the previous rolling context
/// when one exists, and the mandatory two-section output format.
pub fn build_analysis_prompt(ctx: &PromptContext, previous_rolling_context: Option<&str>) -> String {
    let previous_block = match previous_rolling_context {
        Some(context) => format!(
            "Previous rolling context (may be outdated or partially irrelevant):\n{context}"
        ),
        None => "No previous rolling context is provided.".to_string(),
    };

    format!(
        "You are an AI visual analyst for a real-world business monitoring system.\n\
         Analyze a newly captured image from a fixed camera inside a business.\n\
         \n\
         === BUSINESS & CAMERA CONTEXT ===\n\
         Business name: {business_name}\n\
         Business type: {business_type}\n\
         Camera name: {camera_name}\n\
         Camera view description: {camera_description}\n\
         Analysis goal: {analysis_goal}\n\
         \n\
         === PREVIOUS ROLLING CONTEXT ===\n\
         {previous_block}\n\
         \n\
         Produce TWO outputs:\n\
         1. FRAME_DESCRIPTION: what is happening in the current image, concise and factual.\n\
         2. ROLLING_CONTEXT: the updated ongoing situation summary; update only what changed.\n\
         \n\
         Your response will be parsed by code. Return EXACTLY the following format,\n\
         with no additional text before or after, no quotes, no Markdown:\n\
         \n\
         {frame_header}\n\
         <text here>\n\
         \n\
         {context_header}\n\
         <text here>",
        business_name = ctx.business_name,
        business_type = ctx.business_type,
        camera_name = ctx.camera_name,
        camera_description = ctx.camera_description,
        analysis_goal = ctx.analysis_goal,
        frame_header = FRAME_DESCRIPTION_HEADER,
        context_header = ROLLING_CONTEXT_HEADER,
    )
}

/// Parse the strict two-section response format. Anything outside the
/// mandated shape is a hard error.
pub fn parse_analysis_sections(text: &str) -> Result<AnalysisSections, VlmError> {
    let trimmed = text.trim();

    let rest = trimmed
        .strip_prefix(FRAME_DESCRIPTION_HEADER)
        .ok_or_else(|| {
            VlmError::MalformedResponse(format!("missing leading {FRAME_DESCRIPTION_HEADER}"))
        })?;

    let (description, context) = rest
        .split_once(ROLLING_CONTEXT_HEADER)
        .ok_or_else(|| VlmError::MalformedResponse(format!("missing {ROLLING_CONTEXT_HEADER}")))?;

    let frame_description = description.trim().to_string();
    let rolling_context = context.trim().to_string();

    if frame_description.is_empty() {
        return Err(VlmError::MalformedResponse("empty frame description".into()));
    }
    if rolling_context.is_empty() {
        return Err(VlmError::MalformedResponse("empty rolling context".into()));
    }
    if rolling_context.contains(ROLLING_CONTEXT_HEADER) {
        return Err(VlmError::MalformedResponse("repeated section header".into()));
    }

    Ok(AnalysisSections {
        frame_description,
        rolling_context,
    })
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

/// Blocking client for the model server's image analysis route.
#[derive(Debug, Clone)]
pub struct VlmClient {
    base_url: String,
    http: Client,
}

impl VlmClient {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self, VlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Analyze one frame. The prompt carries both the static business
    /// context and the dynamic rolling context.
    pub fn analyze(&self, jpeg: &[u8], prompt: &str) -> Result<AnalysisSections, VlmError> {
        if jpeg.is_empty() {
            return Err(VlmError::EmptyImage);
        }

        let url = format!("{}/generate", self.base_url);
        let part = multipart::Part::bytes(jpeg.to_vec())
            .mime_str("image/jpeg")
            .map_err(VlmError::Http)?
            .file_name("frame.jpg");
        let form = multipart::Form::new()
            .text("prompt", prompt.to_string())
            .part("image", part);

        let response = self.http.post(url).multipart(form).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(VlmError::UnexpectedStatus { status, body });
        }

        let parsed: GenerateResponse = response.json()?;
        parse_analysis_sections(&parsed.text)
    }
}
