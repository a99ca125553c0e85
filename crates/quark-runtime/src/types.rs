//! Payload types carried by engine and host operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lifecycle::PageId;

/// A UI event routed to a page element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsEvent {
    pub page_id: PageId,
    pub element_ref: i32,
    pub event_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub attributes: Value,
}

impl JsEvent {
    pub fn new(page_id: PageId, element_ref: i32, event_type: impl Into<String>) -> Self {
        Self {
            page_id,
            element_ref,
            event_type: event_type.into(),
            params: Value::Null,
            attributes: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// A hardware key event addressed to a page element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub page_id: PageId,
    pub element_ref: i32,
    pub code: i32,
    pub action: i32,
    pub repeat_count: i32,
    /// Echoed back through `on_key_event_handled`.
    pub hash: i32,
}

/// Completion of an asynchronous feature invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsCallback {
    pub callback_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Screen orientation reported to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        }
    }
}

/// Kind of platform configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigurationKind {
    Locale,
    ThemeMode,
    ScreenSize,
}

impl ConfigurationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigurationKind::Locale => "locale",
            ConfigurationKind::ThemeMode => "themeMode",
            ConfigurationKind::ScreenSize => "screenSize",
        }
    }
}

/// Locale pushed to the running app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locale {
    pub language: String,
    #[serde(default)]
    pub country: String,
}

/// A script-side request for a host feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// Token passed back through `fire_callback` when the feature completes
    /// asynchronously.
    #[serde(default)]
    pub callback: String,
    pub instance_id: i32,
}

/// Synchronous answer to a [`FeatureRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureResponse {
    pub code: i32,
    #[serde(default)]
    pub content: Value,
}

impl FeatureResponse {
    pub const SUCCESS: i32 = 0;
    pub const NO_FEATURE: i32 = 204;
    pub const ERROR: i32 = 200;

    pub fn success(content: Value) -> Self {
        Self {
            code: Self::SUCCESS,
            content,
        }
    }

    pub fn no_feature(name: &str) -> Self {
        Self {
            code: Self::NO_FEATURE,
            content: Value::String(format!("feature not available: {}", name)),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: Self::ERROR,
            content: Value::String(message.into()),
        }
    }
}
