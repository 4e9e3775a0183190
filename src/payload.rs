//! Enrollment token codec.
//!
//! There is no server-side session between propose and confirm/cancel:
//! everything the later step needs rides inside an opaque string attached
//! to the platform's action button, which caps the data field at a hard
//! byte ceiling. Tokens are compact JSON, zlib-compressed, base64url
//! encoded without padding, and tagged with a scheme prefix so the decoder
//! can pick a strategy per generation.

use crate::models::LanguageChoice;
use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

/// Scheme tag for zlib-compressed tokens (current generation).
const SCHEME_COMPRESSED: &str = "langsel2";
/// Scheme tag for plain-JSON tokens (first generation, decode only).
const SCHEME_PLAIN: &str = "langsel1";

/// Discriminator of the token family. Unrelated postbacks decode to other
/// kinds (or not at all) and are ignored.
pub const KIND_LANGUAGE_CONFIRM: &str = "language_confirm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadAction {
    Confirm,
    Cancel,
}

/// Client-held enrollment state.
///
/// Field order matters: required fields serialize first so the codec's
/// last-resort truncation only ever damages optional trailing material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentPayload {
    pub kind: String,
    pub action: PayloadAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<LanguageChoice>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_text: Option<String>,
}

impl EnrollmentPayload {
    pub fn confirm(
        languages: Vec<LanguageChoice>,
        primary_language: impl Into<String>,
        completion_text: impl Into<String>,
        limit_text: impl Into<String>,
    ) -> Self {
        Self {
            kind: KIND_LANGUAGE_CONFIRM.to_string(),
            action: PayloadAction::Confirm,
            languages,
            primary_language: primary_language.into(),
            completion_text: Some(completion_text.into()),
            limit_text: Some(limit_text.into()),
            cancel_text: None,
        }
    }

    pub fn cancel(primary_language: impl Into<String>, cancel_text: impl Into<String>) -> Self {
        Self {
            kind: KIND_LANGUAGE_CONFIRM.to_string(),
            action: PayloadAction::Cancel,
            languages: Vec::new(),
            primary_language: primary_language.into(),
            completion_text: None,
            limit_text: None,
            cancel_text: Some(cancel_text.into()),
        }
    }
}

/// Optional text fields, in shrink-priority order: the least important
/// text is sacrificed first.
#[derive(Clone, Copy)]
enum OptionalField {
    LimitText,
    CancelText,
    CompletionText,
}

const SHRINK_ORDER: [OptionalField; 3] = [
    OptionalField::LimitText,
    OptionalField::CancelText,
    OptionalField::CompletionText,
];

/// Minimum character count a shrunk text is allowed to reach.
const SHRINK_FLOOR: usize = 32;
/// Shrink rounds per field before the field is dropped entirely.
const SHRINK_ROUNDS: usize = 3;

/// Encoder/decoder for enrollment tokens under a hard byte ceiling.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    max_bytes: usize,
}

impl PayloadCodec {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Encode a payload, never exceeding the byte ceiling.
    ///
    /// Oversized payloads go through a deterministic shrink policy:
    /// optional texts are cut to ~60% of their length (floor-bounded) for a
    /// few rounds, then dropped, field by field in priority order. If the
    /// token is somehow still oversized the encoded string is hard-truncated
    /// as a last resort.
    pub fn encode(&self, payload: &EnrollmentPayload) -> Result<String> {
        let mut working = payload.clone();
        let mut encoded = encode_once(&working)?;
        if encoded.len() <= self.max_bytes {
            return Ok(encoded);
        }

        for field in SHRINK_ORDER {
            for _ in 0..SHRINK_ROUNDS {
                let changed = shrink_field(&mut working, field);
                encoded = encode_once(&working)?;
                if encoded.len() <= self.max_bytes {
                    return Ok(encoded);
                }
                if !changed {
                    break;
                }
            }

            *field_mut(&mut working, field) = None;
            encoded = encode_once(&working)?;
            if encoded.len() <= self.max_bytes {
                return Ok(encoded);
            }
        }

        encoded.truncate(self.max_bytes);
        Ok(encoded)
    }

    /// Decode a token. Malformed, truncated, or foreign tokens yield
    /// `None` — they may belong to an unrelated feature and must never
    /// raise.
    pub fn decode(&self, data: &str) -> Option<EnrollmentPayload> {
        let (scheme, token) = data.split_once('=')?;
        let compressed = match scheme {
            SCHEME_COMPRESSED => true,
            SCHEME_PLAIN => false,
            _ => return None,
        };

        let blob = URL_SAFE_NO_PAD
            .decode(token.trim_end_matches('='))
            .map_err(|e| debug!("Enrollment token base64 decode failed: {}", e))
            .ok()?;

        let raw = if compressed {
            let mut decoder = ZlibDecoder::new(&blob[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| debug!("Enrollment token decompression failed: {}", e))
                .ok()?;
            out
        } else {
            blob
        };

        serde_json::from_slice(&raw)
            .map_err(|e| debug!("Enrollment token parse failed: {}", e))
            .ok()
    }
}

fn encode_once(payload: &EnrollmentPayload) -> Result<String> {
    let raw = serde_json::to_vec(payload).context("Failed to serialize enrollment payload")?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .context("Failed to compress enrollment payload")?;
    let compressed = encoder
        .finish()
        .context("Failed to finish payload compression")?;
    Ok(format!(
        "{}={}",
        SCHEME_COMPRESSED,
        URL_SAFE_NO_PAD.encode(compressed)
    ))
}

fn field_mut(payload: &mut EnrollmentPayload, field: OptionalField) -> &mut Option<String> {
    match field {
        OptionalField::LimitText => &mut payload.limit_text,
        OptionalField::CancelText => &mut payload.cancel_text,
        OptionalField::CompletionText => &mut payload.completion_text,
    }
}

/// Cut the field to ~60% of its character length, floor-bounded. Returns
/// whether the field was present to shrink.
fn shrink_field(payload: &mut EnrollmentPayload, field: OptionalField) -> bool {
    let slot = field_mut(payload, field);
    match slot {
        Some(text) if !text.is_empty() => {
            let chars = text.chars().count();
            let new_len = ((chars as f64 * 0.6) as usize).max(SHRINK_FLOOR);
            if new_len < chars {
                *text = text.chars().take(new_len).collect();
            }
            true
        }
        _ => false,
    }
}
