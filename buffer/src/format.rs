//! Opaque sample format descriptors.
//!
//! A [`Format`] travels with a buffer so downstream stages can interpret its
//! payload. This crate stores and returns descriptors verbatim and never
//! inspects them: the media type is an interned string and the parameters are
//! uninterpreted bytes (e.g. codec-specific configuration records). Cloning a
//! descriptor is constant-time.

use bytes::Bytes;
use std::sync::Arc;

/// Describes the payload carried by a buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Format {
    media_type: Arc<str>,
    params: Bytes,
}

impl Format {
    /// Creates a descriptor with no parameters.
    pub fn new(media_type: &str) -> Self {
        Self {
            media_type: Arc::from(media_type),
            params: Bytes::new(),
        }
    }

    /// Creates a descriptor carrying opaque parameter bytes.
    pub fn with_params(media_type: &str, params: Bytes) -> Self {
        Self {
            media_type: Arc::from(media_type),
            params,
        }
    }

    /// Returns the media type (e.g. `video/avc`).
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Returns the parameter bytes exactly as supplied.
    pub fn params(&self) -> &[u8] {
        &self.params
    }
}
