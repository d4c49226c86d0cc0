use crate::llm::{ChatMessage, ContentPart, ImageUrl, LlmClient, LlmError};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescribeError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("room type is required")]
    MissingRoomType,
    #[error("vision request failed: {0}")]
    Llm(#[from] LlmError),
    #[error("description response is not valid json")]
    NotJson,
    #[error("description response has no `description`")]
    MissingDescription,
}

pub fn build_prompt(kind: &str, room_type: &str) -> String {
    let label = match kind.trim() {
        "" => "FURNITURE".to_string(),
        other => other.to_uppercase(),
    };
    format!(
        "You're a professional interior design assistant. Describe only the \"{label}\" in the image, \
taken from a {room}, in extreme detail, including its furniture type, color, shape, design style, \
material, texture, and possible use-case. Return your response strictly in valid JSON format with \
this key only: {{ \"description\": \"...\" }} Do not include any explanation, markdown, or extra text. \
Only return the JSON.",
        room = room_type.trim().to_lowercase(),
    )
}

/// Strips a `data:*;base64,` prefix and checks the payload decodes.
pub fn normalize_base64(input: &str) -> Result<String, DescribeError> {
    let trimmed = input.trim();
    let payload = match trimmed.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => trimmed,
    };
    let payload: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if payload.is_empty() {
        return Err(DescribeError::InvalidImage("image is empty".into()));
    }
    STANDARD
        .decode(&payload)
        .map_err(|err| DescribeError::InvalidImage(err.to_string()))?;
    Ok(payload)
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .skip(1)
        .take_while(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn parse_description(content: &str) -> Result<String, DescribeError> {
    let value: Value =
        serde_json::from_str(&strip_markdown_fence(content)).map_err(|_| DescribeError::NotJson)?;
    value
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or(DescribeError::MissingDescription)
}

pub struct FurnitureDescriber {
    llm: LlmClient,
}

impl FurnitureDescriber {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    pub async fn describe(
        &self,
        base64_image: &str,
        kind: &str,
        room_type: &str,
    ) -> Result<String, DescribeError> {
        if room_type.trim().is_empty() {
            return Err(DescribeError::MissingRoomType);
        }
        let payload = normalize_base64(base64_image)?;
        let message = ChatMessage::user(vec![
            ContentPart::Text {
                text: build_prompt(kind, room_type),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/jpeg;base64,{payload}"),
                },
            },
        ]);
        let content = self.llm.chat(&[message], true).await?;
        parse_description(&content)
    }
}
