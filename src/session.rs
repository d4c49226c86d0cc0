use crate::{
    error::ServiceError,
    generation::RedesignRequest,
    http::ensure_image_url,
    models::{RoomType, Theme},
    scan::ScanRequest,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

/// State carried across the upload → redesign → scan flow for one user.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignSession {
    pub id: Uuid,
    pub user_id: String,
    pub source_image_url: Option<String>,
    pub room: Option<RoomType>,
    pub theme: Option<Theme>,
    pub output_image_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DesignSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            source_image_url: None,
            room: None,
            theme: None,
            output_image_url: None,
            updated_at: Utc::now(),
        }
    }

    /// A new upload invalidates any previous output.
    pub fn attach_upload(&mut self, url: impl Into<String>) {
        self.source_image_url = Some(url.into());
        self.output_image_url = None;
        self.touch();
    }

    pub fn select_room(&mut self, label: &str) -> Result<RoomType, ServiceError> {
        let room = RoomType::parse(label).ok_or_else(|| {
            ServiceError::invalid_input("redesign", format!("unknown_room_type: {}", label.trim()))
        })?;
        self.room = Some(room);
        self.touch();
        Ok(room)
    }

    pub fn select_theme(&mut self, label: &str) -> Result<&Theme, ServiceError> {
        let theme = Theme::new(label)?;
        self.touch();
        Ok(self.theme.insert(theme))
    }

    pub fn redesign_request(&self) -> Result<RedesignRequest, ServiceError> {
        let source = self
            .source_image_url
            .as_deref()
            .ok_or_else(|| ServiceError::invalid_input("redesign", "image url is required"))?;
        let source_image_url = ensure_image_url("redesign", source)?;
        let room = self
            .room
            .ok_or_else(|| ServiceError::invalid_input("redesign", "room is required"))?;
        let theme = self
            .theme
            .clone()
            .ok_or_else(|| ServiceError::invalid_input("redesign", "theme is required"))?;
        Ok(RedesignRequest {
            source_image_url,
            room,
            theme,
        })
    }

    pub fn record_output(&mut self, url: impl Into<String>) {
        self.output_image_url = Some(url.into());
        self.touch();
    }

    /// Scan input for the latest generated image, if any.
    pub fn scan_target(&self) -> Option<ScanRequest> {
        ScanRequest::from_session(self)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
