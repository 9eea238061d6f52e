//! Attachment descriptors as stored inside attachment columns.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{AppError, AppResult};

/// One entry of an attachment column. Only the recognised fields survive
/// deserialisation; anything else a legacy writer stored is dropped. Kept
/// fields hold whatever JSON the writer stored, so an odd type on one
/// field never rejects the entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<Value>,
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|text| !text.is_empty())
}

impl AttachmentDescriptor {
    /// Normalise one raw array element.
    pub fn from_value(value: Value) -> AppResult<Self> {
        if !value.is_object() {
            return Err(AppError::new(
                "ATTACHMENT/NOT_OBJECT",
                "Attachment entry is not an object.",
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Whether an id is present: null, `false`, `0` and `""` count as none.
    pub fn has_id(&self) -> bool {
        match &self.id {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(id)) => !id.is_empty(),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(_) => true,
        }
    }

    pub fn set_id(&mut self, id: String) {
        self.id = Some(Value::String(id));
    }

    fn non_empty_path(&self) -> Option<&str> {
        non_empty_str(self.path.as_ref())
    }

    fn non_empty_url(&self) -> Option<&str> {
        non_empty_str(self.url.as_ref())
    }

    /// Whether the descriptor points at a backing file at all.
    pub fn locates_file(&self) -> bool {
        self.non_empty_path().is_some() || self.non_empty_url().is_some()
    }

    /// The value recorded as `file_url` in the registry.
    pub fn file_url(&self) -> Option<&str> {
        self.non_empty_path().or_else(|| self.non_empty_url())
    }

    /// Declared mimetype, when it is a non-empty string.
    pub fn declared_mimetype(&self) -> Option<&str> {
        non_empty_str(self.mimetype.as_ref())
    }

    /// Key of the backing file in the storage inventory.
    pub fn storage_key(&self, uploads_prefix: &str, legacy_path_prefix: &str) -> Option<String> {
        if let Some(path) = self.non_empty_path() {
            let relative = path.strip_prefix(legacy_path_prefix).unwrap_or(path);
            return Some(format!("{uploads_prefix}{relative}"));
        }
        self.non_empty_url()
            .map(|url| format!("{uploads_prefix}{}", normalize_url(url, uploads_prefix)))
    }

    /// Size in bytes, accepting numbers and numeric strings.
    pub fn size_bytes(&self) -> Option<i64> {
        match self.size.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
            _ => None,
        }
    }
}

/// Reduce an attachment URL to its path below the uploads root, decoded.
pub fn normalize_url(raw: &str, uploads_prefix: &str) -> String {
    let encoded_path = match Url::parse(raw) {
        Ok(url) => url.path().to_string(),
        Err(_) => raw.to_string(),
    };
    let relative = match encoded_path.find(uploads_prefix) {
        Some(idx) => &encoded_path[idx + uploads_prefix.len()..],
        None => encoded_path.trim_start_matches('/'),
    };
    percent_decode_str(relative).decode_utf8_lossy().into_owned()
}

/// Decode the raw value of an attachment column.
///
/// `Ok(None)` means the cell is empty and there is nothing to reconcile.
pub fn parse_attachment_column(value: &Value) -> AppResult<Option<Vec<AttachmentDescriptor>>> {
    let decoded;
    let value = match value {
        Value::Null => return Ok(None),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => {
            decoded = serde_json::from_str::<Value>(s)?;
            &decoded
        }
        other => other,
    };

    let items = match value {
        Value::Array(items) => items,
        Value::Null => return Ok(None),
        _ => {
            return Err(AppError::new(
                "ATTACHMENT/NOT_ARRAY",
                "Attachment column does not hold an array.",
            ))
        }
    };
    if items.is_empty() {
        return Ok(None);
    }

    items
        .iter()
        .cloned()
        .map(AttachmentDescriptor::from_value)
        .collect::<AppResult<Vec<_>>>()
        .map(Some)
}

pub fn serialize_attachment_column(attachments: &[AttachmentDescriptor]) -> AppResult<String> {
    Ok(serde_json::to_string(attachments)?)
}

/// Mimetype from the descriptor, else guessed from the key's extension.
pub fn guess_mimetype(descriptor: &AttachmentDescriptor, storage_key: &str) -> Option<String> {
    descriptor
        .declared_mimetype()
        .map(str::to_string)
        .or_else(|| mime_guess::from_path(storage_key).first_raw().map(str::to_string))
}
