//! Header names and property blocks of the dump format

use crate::error::{ReposError, Result};
use crate::props::{PropChange, PropertySet};
use crate::types::Revnum;
use std::io::{self, Write};

/// Version written by `dump_fs`; versions 1 to 3 are read
pub const DUMP_FORMAT_VERSION: u32 = 3;

pub(crate) const FORMAT_VERSION: &str = "SVN-fs-dump-format-version";
pub(crate) const UUID: &str = "UUID";
pub(crate) const REVISION_NUMBER: &str = "Revision-number";
pub(crate) const NODE_PATH: &str = "Node-path";
pub(crate) const NODE_KIND: &str = "Node-kind";
pub(crate) const NODE_ACTION: &str = "Node-action";
pub(crate) const NODE_COPYFROM_REV: &str = "Node-copyfrom-rev";
pub(crate) const NODE_COPYFROM_PATH: &str = "Node-copyfrom-path";
pub(crate) const PROP_DELTA: &str = "Prop-delta";
pub(crate) const TEXT_DELTA: &str = "Text-delta";
pub(crate) const TEXT_DELTA_BASE_SHA1: &str = "Text-delta-base-sha1";
pub(crate) const TEXT_CONTENT_SHA1: &str = "Text-content-sha1";
pub(crate) const PROP_CONTENT_LENGTH: &str = "Prop-content-length";
pub(crate) const TEXT_CONTENT_LENGTH: &str = "Text-content-length";
pub(crate) const CONTENT_LENGTH: &str = "Content-length";

const PROPS_END: &[u8] = b"PROPS-END";

/// `Name: value` lines of one record, in order
#[derive(Debug, Default, Clone)]
pub(crate) struct Headers(Vec<(String, String)>);

impl Headers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A record of a single header
    pub(crate) fn from_pair(name: &str, value: impl ToString) -> Self {
        let mut headers = Self::new();
        headers.push(name, value);
        headers
    }

    pub(crate) fn push(&mut self, name: &str, value: impl ToString) {
        self.0.push((name.to_string(), value.to_string()));
    }

    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn first(&self) -> Option<&str> {
        self.0.first().map(|(n, _)| n.as_str())
    }

    /// Write every header followed by the blank separator line.
    pub(crate) fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        for (name, value) in &self.0 {
            writeln!(out, "{}: {}", name, value)?;
        }
        writeln!(out)
    }
}

fn write_entry(buf: &mut Vec<u8>, tag: char, data: &[u8]) {
    buf.extend_from_slice(format!("{} {}\n", tag, data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.push(b'\n');
}

/// Encode a full property block.
pub(crate) fn encode_props(props: &PropertySet) -> Vec<u8> {
    let mut buf = Vec::new();
    for (name, value) in props.iter() {
        write_entry(&mut buf, 'K', name.as_bytes());
        write_entry(&mut buf, 'V', value.as_bytes());
    }
    buf.extend_from_slice(PROPS_END);
    buf.push(b'\n');
    buf
}

/// Encode a property delta block; a `None` value deletes the property.
pub(crate) fn encode_prop_delta(changes: &[PropChange]) -> Vec<u8> {
    let mut buf = Vec::new();
    for change in changes {
        match &change.value {
            Some(value) => {
                write_entry(&mut buf, 'K', change.name.as_bytes());
                write_entry(&mut buf, 'V', value.as_bytes());
            }
            None => write_entry(&mut buf, 'D', change.name.as_bytes()),
        }
    }
    buf.extend_from_slice(PROPS_END);
    buf.push(b'\n');
    buf
}

/// Decode a property block that starts at stream `offset`.
///
/// Full blocks yield only values; delta blocks may also yield deletions.
pub(crate) fn decode_props(block: &[u8], offset: u64, revision: Option<Revnum>) -> Result<Vec<PropChange>> {
    let err = |pos: usize, reason: String| ReposError::malformed(offset + pos as u64, revision, reason);
    let mut pos = 0;
    let mut out = Vec::new();

    loop {
        let line_start = pos;
        let line_len = block[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| err(pos, "property block does not end in PROPS-END".to_string()))?;
        let line = &block[pos..pos + line_len];
        pos += line_len + 1;

        if line == PROPS_END {
            if pos != block.len() {
                return Err(err(pos, "data after PROPS-END".to_string()));
            }
            return Ok(out);
        }

        let (tag, len) = parse_len_line(line)
            .ok_or_else(|| err(line_start, format!("bad property line '{}'", String::from_utf8_lossy(line))))?;
        let name = take_string(block, &mut pos, len).map_err(|reason| err(pos, reason))?;
        match tag {
            b'K' => {
                let value_start = pos;
                let value_line_len = block[pos..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .ok_or_else(|| err(pos, "truncated property block".to_string()))?;
                let value_line = &block[pos..pos + value_line_len];
                pos += value_line_len + 1;
                let (_, vlen) = parse_len_line(value_line)
                    .filter(|(t, _)| *t == b'V')
                    .ok_or_else(|| err(value_start, format!("expected value for property '{}'", name)))?;
                let value = take_string(block, &mut pos, vlen).map_err(|reason| err(pos, reason))?;
                out.push(PropChange { name, value: Some(value) });
            }
            b'D' => out.push(PropChange { name, value: None }),
            _ => {
                return Err(err(
                    line_start,
                    format!("bad property line '{}'", String::from_utf8_lossy(line)),
                ));
            }
        }
    }
}

/// Parse `K 12`, `V 3` or `D 4`.
fn parse_len_line(line: &[u8]) -> Option<(u8, usize)> {
    let text = std::str::from_utf8(line).ok()?;
    let (tag, len) = text.split_once(' ')?;
    let tag = match tag {
        "K" | "V" | "D" => tag.as_bytes()[0],
        _ => return None,
    };
    Some((tag, len.parse().ok()?))
}

/// Take `len` bytes and the newline after them.
fn take_string(block: &[u8], pos: &mut usize, len: usize) -> std::result::Result<String, String> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end < block.len())
        .ok_or_else(|| "truncated property block".to_string())?;
    if block[end] != b'\n' {
        return Err("property length does not match its content".to_string());
    }
    let text = String::from_utf8(block[*pos..end].to_vec())
        .map_err(|_| "property is not valid UTF-8".to_string())?;
    *pos = end + 1;
    Ok(text)
}
