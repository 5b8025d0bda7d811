//! Stream-related type definitions
//!
//! Supporting types describing discovered elementary streams.

use crate::caps::Caps;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of an elementary stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StreamClassification {
    Audio,
    Video,
    Text,
    Subpicture,
    /// Stream handled by an opaque sink element plugged inside the engine
    Element,
    /// No element could handle the stream; its data is ignored downstream
    Unknown,
}

impl StreamClassification {
    /// Classifications that get a PrerollBuffer/selector pair
    pub const SELECTABLE: [StreamClassification; 4] = [
        StreamClassification::Audio,
        StreamClassification::Video,
        StreamClassification::Text,
        StreamClassification::Subpicture,
    ];

    /// Classify raw caps by media type name
    pub fn from_caps(caps: &Caps) -> Self {
        match caps.first_name() {
            Some(name) if name.starts_with("audio/") => StreamClassification::Audio,
            Some(name) if name.starts_with("subpicture/") || name == "video/x-dvd-subpicture" => {
                StreamClassification::Subpicture
            }
            Some(name) if name.starts_with("video/") || name.starts_with("image/") => {
                StreamClassification::Video
            }
            Some(name) if name.starts_with("text/") || name.starts_with("application/x-subtitle") => {
                StreamClassification::Text
            }
            _ => StreamClassification::Unknown,
        }
    }

    /// Text and subpicture streams need a video stream to render onto
    pub fn is_subtitle(self) -> bool {
        matches!(self, StreamClassification::Text | StreamClassification::Subpicture)
    }
}

impl std::fmt::Display for StreamClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamClassification::Audio => write!(f, "audio"),
            StreamClassification::Video => write!(f, "video"),
            StreamClassification::Text => write!(f, "text"),
            StreamClassification::Subpicture => write!(f, "subpicture"),
            StreamClassification::Element => write!(f, "element"),
            StreamClassification::Unknown => write!(f, "unknown"),
        }
    }
}

/// Snapshot of a stream descriptor for notifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamInfo {
    pub stream_id: Uuid,
    /// Position within the owning group's descriptor list
    pub index: usize,
    pub classification: StreamClassification,
    pub caps: Caps,
    /// Name of the element whose port produced the stream
    pub element: String,
    pub port: String,
    pub muted: bool,
    pub codec: Option<String>,
    pub language: Option<String>,
}
