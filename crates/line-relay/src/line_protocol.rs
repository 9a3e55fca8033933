// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syntax-only validation of line-protocol records.
//!
//! A record looks like `measurement[,tag=value...] field=value[,field=value...] [timestamp]`.
//! Commas, spaces and equal signs can be escaped with a backslash, and string field values
//! are double-quoted. Nothing is decoded: the relay forwards lines verbatim, it only needs
//! to know whether downstream could parse them.

use crate::errors::LineError;

/// Seam for the line parser so the ingestion path can be driven with another grammar.
pub trait LineValidator: Send + Sync {
    fn validate(&self, line: &str) -> Result<(), LineError>;
}

/// The default validator for InfluxDB line protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineProtocol;

impl LineValidator for LineProtocol {
    fn validate(&self, line: &str) -> Result<(), LineError> {
        validate(line)
    }
}

/// Returns true for lines that carry no record at all and are skipped silently.
pub fn is_ignorable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

pub fn validate(line: &str) -> Result<(), LineError> {
    let (series, rest) = match find_unescaped(line, b' ', false)? {
        Some(idx) => (&line[..idx], &line[idx + 1..]),
        None => (line, ""),
    };

    let mut series_parts = split_unescaped(series, b',', false)?.into_iter();
    match series_parts.next() {
        Some(measurement) if !measurement.is_empty() => {}
        _ => return Err(LineError::MissingMeasurement),
    }
    for tag in series_parts {
        validate_pair(tag, false).map_err(|_| LineError::InvalidTag(tag.to_string()))?;
    }

    let (fields, timestamp) = match find_unescaped(rest, b' ', true)? {
        Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
        None => (rest, None),
    };
    if fields.is_empty() {
        return Err(LineError::MissingFields);
    }
    for field in split_unescaped(fields, b',', true)? {
        let value = validate_pair(field, true)
            .map_err(|_| LineError::InvalidField(field.to_string()))?;
        if !is_field_value(value) {
            return Err(LineError::InvalidField(field.to_string()));
        }
    }

    if let Some(timestamp) = timestamp {
        if timestamp.contains(' ') {
            return Err(LineError::TrailingData(timestamp.to_string()));
        }
        if timestamp.parse::<i64>().is_err() {
            return Err(LineError::InvalidTimestamp(timestamp.to_string()));
        }
    }
    Ok(())
}

/// Validates `key=value` and returns the value.
fn validate_pair(pair: &str, quoted: bool) -> Result<&str, ()> {
    let idx = find_unescaped(pair, b'=', quoted)
        .map_err(|_| ())?
        .ok_or(())?;
    let (key, value) = (&pair[..idx], &pair[idx + 1..]);
    if key.is_empty() || value.is_empty() {
        return Err(());
    }
    Ok(value)
}

fn is_field_value(value: &str) -> bool {
    if let Some(inner) = value.strip_prefix('"') {
        return inner.ends_with('"') && !inner.is_empty();
    }
    if matches!(
        value,
        "t" | "T" | "true" | "True" | "TRUE" | "f" | "F" | "false" | "False" | "FALSE"
    ) {
        return true;
    }
    if let Some(int) = value.strip_suffix('i') {
        return int.parse::<i64>().is_ok();
    }
    if let Some(uint) = value.strip_suffix('u') {
        return uint.parse::<u64>().is_ok();
    }
    value
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'))
        && value.parse::<f64>().is_ok()
}

/// Byte offset of the first `delim` that is neither escaped nor (when `quoted`) inside a
/// double-quoted string.
fn find_unescaped(s: &str, delim: u8, quoted: bool) -> Result<Option<usize>, LineError> {
    let bytes = s.as_bytes();
    let mut in_quotes = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'"' if quoted => in_quotes = !in_quotes,
            b if b == delim && !in_quotes => return Ok(Some(i)),
            _ => {}
        }
        i += 1;
    }
    if in_quotes {
        return Err(LineError::UnterminatedString);
    }
    Ok(None)
}

fn split_unescaped(s: &str, delim: u8, quoted: bool) -> Result<Vec<&str>, LineError> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(idx) = find_unescaped(rest, delim, quoted)? {
        parts.push(&rest[..idx]);
        rest = &rest[idx + 1..];
    }
    parts.push(rest);
    Ok(parts)
}
