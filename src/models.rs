use crate::error::ServiceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(code: &str, detail: &str) -> Self {
        Self {
            error: code.to_string(),
            stage: None,
            detail: Some(detail.to_string()),
        }
    }
}

/// The fixed set of rooms a user can redesign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum RoomType {
    LivingRoom,
    Bedroom,
    Bathroom,
    Kitchen,
    DiningRoom,
    HomeOffice,
    Basement,
    OutdoorPatio,
}

impl RoomType {
    pub const ALL: [RoomType; 8] = [
        RoomType::LivingRoom,
        RoomType::Bedroom,
        RoomType::Bathroom,
        RoomType::Kitchen,
        RoomType::DiningRoom,
        RoomType::HomeOffice,
        RoomType::Basement,
        RoomType::OutdoorPatio,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            RoomType::LivingRoom => "living room",
            RoomType::Bedroom => "bedroom",
            RoomType::Bathroom => "bathroom",
            RoomType::Kitchen => "kitchen",
            RoomType::DiningRoom => "dining room",
            RoomType::HomeOffice => "home office",
            RoomType::Basement => "basement",
            RoomType::OutdoorPatio => "outdoor patio",
        }
    }

    /// Prefix of the furniture detector workflow trained for this room.
    pub fn detector_slug(&self) -> &'static str {
        match self {
            RoomType::LivingRoom => "living",
            RoomType::Bedroom => "bed",
            RoomType::Bathroom => "bath",
            RoomType::Kitchen => "kitchen",
            RoomType::DiningRoom => "dining",
            RoomType::HomeOffice => "homeoffice",
            RoomType::Basement => "basement",
            RoomType::OutdoorPatio => "outdoorpatio",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input
            .trim()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        RoomType::ALL
            .into_iter()
            .find(|room| room.label() == normalized)
    }
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl TryFrom<String> for RoomType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RoomType::parse(&value).ok_or_else(|| format!("unknown room type `{value}`"))
    }
}

impl From<RoomType> for String {
    fn from(value: RoomType) -> Self {
        value.label().to_string()
    }
}

pub const THEME_PALETTE: [&str; 9] = [
    "minimalist",
    "modern",
    "professional",
    "contemporary",
    "mediterranean",
    "vintage",
    "industrial",
    "neoclassic",
    "scandinavian",
];

const MAX_THEME_LEN: usize = 40;

/// Decor style label, normalized to lowercase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct Theme(String);

impl Theme {
    pub fn new(label: &str) -> Result<Self, ServiceError> {
        let normalized = label.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(ServiceError::invalid_input("redesign", "theme is required"));
        }
        if normalized.chars().count() > MAX_THEME_LEN {
            return Err(ServiceError::invalid_input("redesign", "theme_too_long"));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn in_palette(&self) -> bool {
        THEME_PALETTE.contains(&self.as_str())
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Theme {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Theme::new(&value).map_err(|err| err.detail().to_string())
    }
}

impl From<Theme> for String {
    fn from(value: Theme) -> Self {
        value.0
    }
}
