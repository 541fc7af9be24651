// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoding of raw Scribe message payloads into structured records.

use serde_json::Value;

use crate::config::Format;
use crate::errors::DecodeError;
use crate::scribe::Record;

const MESSAGE_KEY: &str = "message";

/// Turns one raw payload into a record according to the configured format.
///
/// * `text` yields `{"message": <payload>}`, optionally without one trailing
///   line terminator.
/// * `json` yields the parsed object; any other JSON value is rejected.
/// * `url_param` yields the percent-decoded `key=value` pairs.
pub fn decode(payload: &[u8], format: Format, trim_newline: bool) -> Result<Record, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    match format {
        Format::Text => Ok(decode_text(text, trim_newline)),
        Format::Json => decode_json(text),
        Format::UrlParam => decode_url_param(text),
    }
}

fn decode_text(text: &str, trim_newline: bool) -> Record {
    let text = if trim_newline { chomp(text) } else { text };
    let mut record = Record::new();
    record.insert(MESSAGE_KEY.to_string(), Value::String(text.to_string()));
    record
}

/// Removes exactly one trailing `\r\n`, `\n` or `\r`.
fn chomp(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .or_else(|| text.strip_suffix('\r'))
        .unwrap_or(text)
}

fn decode_json(text: &str) -> Result<Record, DecodeError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        Value::Array(_) => Err(DecodeError::NotAnObject("array")),
        Value::String(_) => Err(DecodeError::NotAnObject("string")),
        Value::Number(_) => Err(DecodeError::NotAnObject("number")),
        Value::Bool(_) => Err(DecodeError::NotAnObject("boolean")),
        Value::Null => Err(DecodeError::NotAnObject("null")),
    }
}

fn decode_url_param(text: &str) -> Result<Record, DecodeError> {
    let mut record = Record::new();
    for segment in text.split('&').filter(|s| !s.is_empty()) {
        // Only the first '=' separates key from value
        let (key, value) = segment.split_once('=').unwrap_or((segment, ""));
        record.insert(unescape(key)?, Value::String(unescape(value)?));
    }
    Ok(record)
}

/// Form-style unescaping: `+` is a space, `%XX` is a byte.
fn unescape(component: &str) -> Result<String, DecodeError> {
    let spaced = component.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| DecodeError::PercentEncoding(component.to_string()))
}
