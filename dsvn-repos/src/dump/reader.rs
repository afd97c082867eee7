//! Strict single-pass dump stream parser

use super::format::{self, Headers};
use crate::error::{ReposError, Result};
use crate::path;
use crate::props::{PropChange, PropertySet};
use crate::types::{CopyFrom, NodeAction, NodeKind, Revnum};
use bytes::Bytes;
use std::io::{BufRead, Read};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRecord {
    pub revision: Revnum,
    pub props: PropertySet,
    /// Stream offset of the record's first header
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Path relative to the repository root; empty for the root
    pub path: String,
    pub kind: Option<NodeKind>,
    pub action: NodeAction,
    pub copy_from: Option<CopyFrom>,
    /// `props` holds changes rather than the full set
    pub prop_delta: bool,
    pub props: Option<Vec<PropChange>>,
    /// `text` is a binary delta rather than the full content
    pub text_delta: bool,
    pub text: Option<Bytes>,
    pub text_delta_base_sha1: Option<String>,
    pub text_content_sha1: Option<String>,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpRecord {
    FormatVersion(u32),
    Uuid(String),
    Revision(RevisionRecord),
    Node(NodeRecord),
}

/// Reads records one at a time with one record of lookahead.
///
/// Any inconsistency fails with `MalformedStream` and leaves the reader
/// failed; it never skips ahead to resynchronize.
pub struct DumpReader<R: BufRead> {
    input: R,
    offset: u64,
    version: Option<u32>,
    revision: Option<Revnum>,
    peeked: Option<DumpRecord>,
    failed: bool,
}

impl<R: BufRead> DumpReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            offset: 0,
            version: None,
            revision: None,
            peeked: None,
            failed: false,
        }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Revision of the last revision record read
    pub fn current_revision(&self) -> Option<Revnum> {
        self.revision
    }

    pub fn next_record(&mut self) -> Result<Option<DumpRecord>> {
        match self.peeked.take() {
            Some(record) => Ok(Some(record)),
            None => self.read_record(),
        }
    }

    pub fn peek_record(&mut self) -> Result<Option<&DumpRecord>> {
        if self.peeked.is_none() {
            self.peeked = self.read_record()?;
        }
        Ok(self.peeked.as_ref())
    }

    fn malformed(&self, offset: u64, reason: impl Into<String>) -> ReposError {
        ReposError::malformed(offset, self.revision, reason)
    }

    fn read_record(&mut self) -> Result<Option<DumpRecord>> {
        if self.failed {
            return Err(self.malformed(self.offset, "stream already failed"));
        }
        let record = self.parse_record();
        if record.is_err() {
            self.failed = true;
        }
        record
    }

    /// One line without its newline, with the offset it started at.
    fn read_line(&mut self) -> Result<Option<(u64, String)>> {
        let start = self.offset;
        let mut buf = Vec::new();
        let n = self.input.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.offset += n as u64;
        if buf.pop() != Some(b'\n') {
            return Err(self.malformed(start, "truncated header line"));
        }
        let line = String::from_utf8(buf).map_err(|_| self.malformed(start, "header line is not valid UTF-8"))?;
        Ok(Some((start, line)))
    }

    /// The next header block, skipping blank lines before it.
    fn read_headers(&mut self) -> Result<Option<(u64, Headers)>> {
        let mut headers = Headers::new();
        let mut start = None;
        while let Some((offset, line)) = self.read_line()? {
            if line.is_empty() {
                if start.is_some() {
                    break;
                }
                continue;
            }
            let (name, value) = line
                .split_once(": ")
                .or_else(|| line.strip_suffix(':').map(|name| (name, "")))
                .ok_or_else(|| self.malformed(offset, format!("bad header line '{}'", line)))?;
            headers.push(name, value);
            start.get_or_insert(offset);
        }
        Ok(start.map(|s| (s, headers)))
    }

    fn number(&self, headers: &Headers, name: &str, offset: u64) -> Result<Option<u64>> {
        headers
            .get(name)
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|_| self.malformed(offset, format!("bad {} '{}'", name, v)))
            })
            .transpose()
    }

    /// Read the property and text blocks announced by `headers`.
    fn read_content(&mut self, headers: &Headers, start: u64) -> Result<(u64, Option<Vec<u8>>, Option<Vec<u8>>)> {
        let prop_len = self.number(headers, format::PROP_CONTENT_LENGTH, start)?;
        let text_len = self.number(headers, format::TEXT_CONTENT_LENGTH, start)?;
        let content_len = self.number(headers, format::CONTENT_LENGTH, start)?;
        let total = prop_len
            .unwrap_or(0)
            .checked_add(text_len.unwrap_or(0))
            .ok_or_else(|| self.malformed(start, "content lengths overflow"))?;
        if let Some(declared) = content_len {
            if declared != total {
                return Err(self.malformed(
                    start,
                    format!(
                        "Content-length {} does not match Prop-content-length + Text-content-length ({})",
                        declared, total
                    ),
                ));
            }
        }

        let content_offset = self.offset;
        let mut buf = Vec::new();
        (&mut self.input).take(total).read_to_end(&mut buf)?;
        self.offset += buf.len() as u64;
        if (buf.len() as u64) < total {
            return Err(self.malformed(
                content_offset,
                format!("truncated block: expected {} bytes, found {}", total, buf.len()),
            ));
        }
        let split = prop_len.unwrap_or(0) as usize;
        let text = text_len.map(|_| buf.split_off(split));
        let props = prop_len.map(|_| buf);
        Ok((content_offset, props, text))
    }

    fn parse_record(&mut self) -> Result<Option<DumpRecord>> {
        let Some((start, headers)) = self.read_headers()? else {
            return Ok(None);
        };
        let first = headers.first().unwrap_or_default().to_string();
        if self.version.is_none() && first != format::FORMAT_VERSION {
            return Err(self.malformed(start, "stream does not begin with a format version header"));
        }

        match first.as_str() {
            format::FORMAT_VERSION => {
                let version = self.number(&headers, format::FORMAT_VERSION, start)?.unwrap_or(0);
                if self.version.is_some() {
                    return Err(self.malformed(start, "repeated format version header"));
                }
                if !(1..=3).contains(&version) {
                    return Err(self.malformed(start, format!("unsupported dump format version {}", version)));
                }
                self.version = Some(version as u32);
                Ok(Some(DumpRecord::FormatVersion(version as u32)))
            }
            format::UUID => Ok(Some(DumpRecord::Uuid(
                headers.get(format::UUID).unwrap_or_default().to_string(),
            ))),
            format::REVISION_NUMBER => self.parse_revision(start, &headers).map(Some),
            format::NODE_PATH => self.parse_node(start, &headers).map(Some),
            other => Err(self.malformed(start, format!("unexpected header '{}'", other))),
        }
    }

    fn parse_revision(&mut self, start: u64, headers: &Headers) -> Result<DumpRecord> {
        let revision = self
            .number(headers, format::REVISION_NUMBER, start)?
            .unwrap_or_default();
        if let Some(previous) = self.revision {
            if revision <= previous {
                return Err(ReposError::malformed(
                    start,
                    Some(revision),
                    format!("revision {} follows revision {}", revision, previous),
                ));
            }
        }
        self.revision = Some(revision);

        let (content_offset, props, _) = self.read_content(headers, start)?;
        let mut set = PropertySet::new();
        if let Some(block) = props {
            for change in format::decode_props(&block, content_offset, Some(revision))? {
                match change.value {
                    Some(value) => set.set(change.name, value),
                    None => return Err(self.malformed(content_offset, "deletion in a revision property block")),
                }
            }
        }
        tracing::debug!("dump record r{} at offset {}", revision, start);
        Ok(DumpRecord::Revision(RevisionRecord {
            revision,
            props: set,
            offset: start,
        }))
    }

    fn parse_node(&mut self, start: u64, headers: &Headers) -> Result<DumpRecord> {
        let Some(current) = self.revision else {
            return Err(self.malformed(start, "node record before any revision record"));
        };
        let node_path = path::canonicalize_relative(headers.get(format::NODE_PATH).unwrap_or_default());

        let action = headers
            .get(format::NODE_ACTION)
            .ok_or_else(|| self.malformed(start, format!("node '{}' has no Node-action", node_path)))
            .and_then(|tag| {
                NodeAction::parse_dump_tag(tag)
                    .ok_or_else(|| self.malformed(start, format!("bad Node-action '{}'", tag)))
            })?;
        let kind = headers
            .get(format::NODE_KIND)
            .map(|tag| match NodeKind::parse(tag) {
                Some(kind @ (NodeKind::File | NodeKind::Dir)) => Ok(kind),
                _ => Err(self.malformed(start, format!("bad Node-kind '{}'", tag))),
            })
            .transpose()?;

        let copy_rev = self.number(headers, format::NODE_COPYFROM_REV, start)?;
        let copy_from = match (copy_rev, headers.get(format::NODE_COPYFROM_PATH)) {
            (None, None) => None,
            (Some(rev), Some(from)) => {
                if rev > current {
                    return Err(self.malformed(
                        start,
                        format!("copy source revision {} of '{}' is newer than revision {}", rev, node_path, current),
                    ));
                }
                Some(CopyFrom::new(from, rev))
            }
            _ => {
                return Err(self.malformed(
                    start,
                    format!("node '{}' needs both Node-copyfrom-rev and Node-copyfrom-path", node_path),
                ));
            }
        };

        let prop_delta = headers.get(format::PROP_DELTA) == Some("true");
        let text_delta = headers.get(format::TEXT_DELTA) == Some("true");
        let (content_offset, props, text) = self.read_content(headers, start)?;
        let props = match props {
            Some(block) => {
                let changes = format::decode_props(&block, content_offset, Some(current))?;
                if !prop_delta && changes.iter().any(|c| c.value.is_none()) {
                    return Err(self.malformed(content_offset, "deletion in a full property block"));
                }
                Some(changes)
            }
            None => None,
        };

        Ok(DumpRecord::Node(NodeRecord {
            path: node_path,
            kind,
            action,
            copy_from,
            prop_delta,
            props,
            text_delta,
            text: text.map(Bytes::from),
            text_delta_base_sha1: headers.get(format::TEXT_DELTA_BASE_SHA1).map(str::to_string),
            text_content_sha1: headers.get(format::TEXT_CONTENT_SHA1).map(str::to_string),
            offset: start,
        }))
    }
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<DumpRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed && self.peeked.is_none() {
            return None;
        }
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(data: &[u8]) -> Result<Vec<DumpRecord>> {
        DumpReader::new(data).collect()
    }

    fn malformed_reason(data: &[u8]) -> String {
        match records(data) {
            Err(ReposError::MalformedStream { reason, .. }) => reason,
            other => panic!("expected a malformed stream, got {:?}", other),
        }
    }

    const HEAD: &str = "SVN-fs-dump-format-version: 3\n\nUUID: 1234\n\n";

    #[test]
    fn test_reads_revision_and_nodes() {
        let data = format!(
            "{HEAD}Revision-number: 1\nProp-content-length: 30\nContent-length: 30\n\n\
             K 7\nsvn:log\nV 3\nadd\nPROPS-END\n\n\
             Node-path: trunk\nNode-kind: dir\nNode-action: add\nProp-content-length: 10\nContent-length: 10\n\n\
             PROPS-END\n\n\n\
             Node-path: trunk/a.txt\nNode-kind: file\nNode-action: add\nText-content-length: 3\nContent-length: 3\n\n\
             abc\n\n\
             Node-path: old\nNode-action: delete\n\n\n"
        );
        let recs = records(data.as_bytes()).unwrap();
        assert_eq!(recs.len(), 6);
        assert_eq!(recs[0], DumpRecord::FormatVersion(3));
        assert_eq!(recs[1], DumpRecord::Uuid("1234".into()));
        match &recs[2] {
            DumpRecord::Revision(r) => {
                assert_eq!(r.revision, 1);
                assert_eq!(r.props.get("svn:log").map(String::as_str), Some("add"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &recs[4] {
            DumpRecord::Node(n) => {
                assert_eq!(n.path, "trunk/a.txt");
                assert_eq!(n.kind, Some(NodeKind::File));
                assert_eq!(n.text.as_deref(), Some(&b"abc"[..]));
                assert!(n.props.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        match &recs[5] {
            DumpRecord::Node(n) => {
                assert_eq!(n.action, NodeAction::Delete);
                assert_eq!(n.kind, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_peek_does_not_consume() {
        let data = format!("{HEAD}Revision-number: 0\nProp-content-length: 10\nContent-length: 10\n\nPROPS-END\n\n");
        let mut reader = DumpReader::new(data.as_bytes());
        assert_eq!(reader.next_record().unwrap(), Some(DumpRecord::FormatVersion(3)));
        assert!(matches!(reader.peek_record().unwrap(), Some(DumpRecord::Uuid(_))));
        assert!(matches!(reader.next_record().unwrap(), Some(DumpRecord::Uuid(_))));
        assert!(matches!(reader.next_record().unwrap(), Some(DumpRecord::Revision(_))));
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn test_missing_format_header() {
        let reason = malformed_reason(b"UUID: x\n\n");
        assert!(reason.contains("format version"));
    }

    #[test]
    fn test_content_length_mismatch() {
        let data = format!("{HEAD}Revision-number: 1\nProp-content-length: 10\nContent-length: 12\n\nPROPS-END\n\n");
        assert!(malformed_reason(data.as_bytes()).contains("Content-length"));
    }

    #[test]
    fn test_truncated_block() {
        let data = format!("{HEAD}Revision-number: 1\nProp-content-length: 40\nContent-length: 40\n\nPROPS-END\n");
        match records(data.as_bytes()) {
            Err(ReposError::MalformedStream { revision, reason, .. }) => {
                assert_eq!(revision, Some(1));
                assert!(reason.contains("truncated"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_revisions() {
        let rev = |n: u32| format!("Revision-number: {n}\nProp-content-length: 10\nContent-length: 10\n\nPROPS-END\n\n");
        let data = format!("{HEAD}{}{}", rev(2), rev(2));
        assert!(malformed_reason(data.as_bytes()).contains("follows revision 2"));
    }

    #[test]
    fn test_copy_from_future_revision() {
        let data = format!(
            "{HEAD}Revision-number: 1\nProp-content-length: 10\nContent-length: 10\n\nPROPS-END\n\n\
             Node-path: b\nNode-kind: dir\nNode-action: add\nNode-copyfrom-rev: 5\nNode-copyfrom-path: a\n\n"
        );
        assert!(malformed_reason(data.as_bytes()).contains("newer than revision 1"));
    }

    #[test]
    fn test_bad_header_and_unterminated_props() {
        let data = format!("{HEAD}Revision-number 1\n\n");
        assert!(malformed_reason(data.as_bytes()).contains("bad header line"));

        let data = format!("{HEAD}Revision-number: 1\nProp-content-length: 8\nContent-length: 8\n\nK 1\na\nV\n");
        assert!(records(data.as_bytes()).is_err());
    }

    #[test]
    fn test_reader_stays_failed() {
        let data = format!("{HEAD}Node-path: x\nNode-action: add\n\n");
        let mut reader = DumpReader::new(data.as_bytes());
        reader.next_record().unwrap();
        reader.next_record().unwrap();
        assert!(reader.next_record().is_err());
        assert!(reader.next_record().is_err());
    }
}
