//! Content-delta codec
//!
//! A text delta turns a source byte string into a target byte string. It is a
//! sequence of windows; each window describes at most [`DELTA_WINDOW_SIZE`]
//! bytes of target using three instructions:
//!
//! - copy a range of the window's source view,
//! - copy a range of the target view already produced by this window
//!   (ranges may overlap the write position, which expands runs),
//! - append literal bytes from the window's new-data section.
//!
//! The binary form starts with `SVN\0` followed by the encoded windows, so a
//! consumer can apply a delta one window at a time.

use crate::error::{ReposError, Result};
use crate::types::{check_cancel, CancelFn};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Read, Write};

/// Maximum number of target bytes described by one window
pub const DELTA_WINDOW_SIZE: usize = 100 * 1024;

/// Stream header
pub const DELTA_HEADER: &[u8; 4] = b"SVN\0";

/// Block size used when indexing the source view
const MATCH_BLOCKSIZE: usize = 64;

/// Shortest byte run worth encoding as an overlapping target copy
const MIN_RUN: usize = 8;

/// Upper bound on any single length field accepted by the decoder
const MAX_DECODED_LEN: u64 = 64 * 1024 * 1024;

const OP_SOURCE: u8 = 0;
const OP_TARGET: u8 = 1;
const OP_NEW: u8 = 2;

/// One delta instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Copy `len` bytes starting at `offset` of the source view
    CopySource { offset: usize, len: usize },
    /// Copy `len` bytes starting at `offset` of the target view
    CopyTarget { offset: usize, len: usize },
    /// Append the next `len` bytes of new data
    NewData { len: usize },
}

impl Instruction {
    pub fn len(&self) -> usize {
        match *self {
            Instruction::CopySource { len, .. }
            | Instruction::CopyTarget { len, .. }
            | Instruction::NewData { len } => len,
        }
    }
}

/// One window of a text delta
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaWindow {
    /// Offset of the source view in the source text
    pub sview_offset: u64,
    pub sview_len: usize,
    /// Number of target bytes this window produces
    pub tview_len: usize,
    pub ops: Vec<Instruction>,
    pub new_data: Bytes,
}

/// A complete text delta
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextDelta {
    pub windows: Vec<DeltaWindow>,
}

impl TextDelta {
    /// Length of the text this delta produces
    pub fn target_len(&self) -> u64 {
        self.windows.iter().map(|w| w.tview_len as u64).sum()
    }

    /// Encode into the binary stream form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut encoder = DeltaEncoder::new(Vec::new());
        for window in &self.windows {
            encoder.write_window(window)?;
        }
        encoder.finish()
    }

    /// Decode a complete binary stream
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut decoder = DeltaDecoder::new(data);
        let mut windows = Vec::new();
        while let Some(window) = decoder.next_window()? {
            windows.push(window);
        }
        Ok(Self { windows })
    }
}

// ---- Computing ----

/// Compute a delta that turns `source` into `target`.
///
/// Pass an empty source to get a self-contained delta.
pub fn compute_delta(source: &[u8], target: &[u8]) -> TextDelta {
    let mut windows = Vec::new();
    let mut tstart = 0usize;
    while tstart < target.len() {
        let tend = (tstart + DELTA_WINDOW_SIZE).min(target.len());
        let sview_offset = tstart.min(source.len());
        let sview_end = (sview_offset + DELTA_WINDOW_SIZE).min(source.len());
        windows.push(compute_window(
            &source[sview_offset..sview_end],
            sview_offset as u64,
            &target[tstart..tend],
        ));
        tstart = tend;
    }
    TextDelta { windows }
}

/// Weak rolling checksum over a fixed-size block
struct RollingHash {
    s1: u32,
    s2: u32,
    n: u32,
}

impl RollingHash {
    fn new(block: &[u8]) -> Self {
        let n = block.len() as u32;
        let mut s1 = 0u32;
        let mut s2 = 0u32;
        for (k, &x) in block.iter().enumerate() {
            s1 = s1.wrapping_add(x as u32);
            s2 = s2.wrapping_add((n - k as u32).wrapping_mul(x as u32));
        }
        Self { s1, s2, n }
    }

    fn roll(&mut self, out: u8, inp: u8) {
        self.s1 = self.s1.wrapping_sub(out as u32).wrapping_add(inp as u32);
        self.s2 = self
            .s2
            .wrapping_sub(self.n.wrapping_mul(out as u32))
            .wrapping_add(self.s1);
    }

    fn digest(&self) -> u32 {
        (self.s2 << 16) | (self.s1 & 0xffff)
    }
}

/// Accumulates instructions for one window, coalescing neighbours
struct WindowBuilder {
    ops: Vec<Instruction>,
    new_data: Vec<u8>,
    tlen: usize,
}

impl WindowBuilder {
    fn new() -> Self {
        Self {
            ops: Vec::new(),
            new_data: Vec::new(),
            tlen: 0,
        }
    }

    fn copy_source(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(Instruction::CopySource { offset: o, len: l }) = self.ops.last_mut() {
            if *o + *l == offset {
                *l += len;
                self.tlen += len;
                return;
            }
        }
        self.ops.push(Instruction::CopySource { offset, len });
        self.tlen += len;
    }

    fn copy_target(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        self.ops.push(Instruction::CopyTarget { offset, len });
        self.tlen += len;
    }

    fn new_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.new_data.extend_from_slice(data);
        self.tlen += data.len();
        if let Some(Instruction::NewData { len }) = self.ops.last_mut() {
            *len += data.len();
            return;
        }
        self.ops.push(Instruction::NewData { len: data.len() });
    }

    /// Emit literal bytes, folding long runs into overlapping target copies.
    fn literal(&mut self, data: &[u8]) {
        let mut i = 0;
        let mut plain_start = 0;
        while i < data.len() {
            let byte = data[i];
            let mut run = 1;
            while i + run < data.len() && data[i + run] == byte {
                run += 1;
            }
            if run >= MIN_RUN {
                self.new_data(&data[plain_start..=i]);
                let at = self.tlen - 1;
                self.copy_target(at, run - 1);
                i += run;
                plain_start = i;
            } else {
                i += run;
            }
        }
        self.new_data(&data[plain_start..]);
    }

    fn build(self, sview_offset: u64, sview_len: usize) -> DeltaWindow {
        DeltaWindow {
            sview_offset,
            sview_len,
            tview_len: self.tlen,
            ops: self.ops,
            new_data: Bytes::from(self.new_data),
        }
    }
}

fn compute_window(sview: &[u8], sview_offset: u64, tview: &[u8]) -> DeltaWindow {
    let mut builder = WindowBuilder::new();

    if sview.len() < MATCH_BLOCKSIZE || tview.len() < MATCH_BLOCKSIZE {
        // Too small to index; an identical prefix is still worth a copy.
        let common = sview.iter().zip(tview).take_while(|(a, b)| a == b).count();
        builder.copy_source(0, common);
        builder.literal(&tview[common..]);
        return builder.build(sview_offset, sview.len());
    }

    let mut index: HashMap<u32, usize> = HashMap::new();
    let mut block = 0;
    while block + MATCH_BLOCKSIZE <= sview.len() {
        let digest = RollingHash::new(&sview[block..block + MATCH_BLOCKSIZE]).digest();
        index.entry(digest).or_insert(block);
        block += MATCH_BLOCKSIZE;
    }

    let mut pending = 0usize; // start of unmatched target bytes
    let mut pos = 0usize;
    let mut hash: Option<RollingHash> = None;

    while pos + MATCH_BLOCKSIZE <= tview.len() {
        let h = hash.get_or_insert_with(|| RollingHash::new(&tview[pos..pos + MATCH_BLOCKSIZE]));
        let candidate = index
            .get(&h.digest())
            .copied()
            .filter(|&c| sview[c..c + MATCH_BLOCKSIZE] == tview[pos..pos + MATCH_BLOCKSIZE]);

        match candidate {
            Some(mut src) => {
                let mut tpos = pos;
                while tpos > pending && src > 0 && sview[src - 1] == tview[tpos - 1] {
                    src -= 1;
                    tpos -= 1;
                }
                let mut len = pos - tpos + MATCH_BLOCKSIZE;
                while src + len < sview.len()
                    && tpos + len < tview.len()
                    && sview[src + len] == tview[tpos + len]
                {
                    len += 1;
                }
                builder.literal(&tview[pending..tpos]);
                builder.copy_source(src, len);
                pos = tpos + len;
                pending = pos;
                hash = None;
            }
            None => {
                if pos + MATCH_BLOCKSIZE < tview.len() {
                    h.roll(tview[pos], tview[pos + MATCH_BLOCKSIZE]);
                }
                pos += 1;
            }
        }
    }
    builder.literal(&tview[pending..]);
    builder.build(sview_offset, sview.len())
}

// ---- Applying ----

/// Apply one window, appending its target view to `out`.
///
/// `target_offset` is the position of this window in the whole target and
/// is only used for error reporting.
pub fn apply_window(
    source: &[u8],
    window: &DeltaWindow,
    target_offset: u64,
    out: &mut Vec<u8>,
) -> Result<()> {
    let sstart = window.sview_offset as usize;
    let send = sstart
        .checked_add(window.sview_len)
        .filter(|&end| end <= source.len())
        .ok_or_else(|| {
            ReposError::corrupt_delta(
                target_offset,
                format!(
                    "source view {}+{} exceeds source length {}",
                    window.sview_offset,
                    window.sview_len,
                    source.len()
                ),
            )
        })?;
    let sview = &source[sstart..send];

    let mut tbuf: Vec<u8> = Vec::with_capacity(window.tview_len);
    let mut new_pos = 0usize;
    for op in &window.ops {
        let at = target_offset + tbuf.len() as u64;
        if tbuf.len() + op.len() > window.tview_len {
            return Err(ReposError::corrupt_delta(at, "instruction overruns target view"));
        }
        match *op {
            Instruction::CopySource { offset, len } => {
                let end = offset
                    .checked_add(len)
                    .filter(|&e| e <= sview.len())
                    .ok_or_else(|| ReposError::corrupt_delta(at, "copy outside source view"))?;
                tbuf.extend_from_slice(&sview[offset..end]);
            }
            Instruction::CopyTarget { offset, len } => {
                if offset >= tbuf.len() {
                    return Err(ReposError::corrupt_delta(at, "copy outside target view"));
                }
                // Byte at a time: the range may overlap what it produces.
                for i in 0..len {
                    let b = tbuf[offset + i];
                    tbuf.push(b);
                }
            }
            Instruction::NewData { len } => {
                let end = new_pos
                    .checked_add(len)
                    .filter(|&e| e <= window.new_data.len())
                    .ok_or_else(|| ReposError::corrupt_delta(at, "new data exhausted"))?;
                tbuf.extend_from_slice(&window.new_data[new_pos..end]);
                new_pos = end;
            }
        }
    }
    if tbuf.len() != window.tview_len {
        return Err(ReposError::corrupt_delta(
            target_offset,
            format!(
                "window produced {} bytes, header declares {}",
                tbuf.len(),
                window.tview_len
            ),
        ));
    }
    out.extend_from_slice(&tbuf);
    Ok(())
}

/// Apply a delta to `source` and return the target text.
pub fn apply_delta(source: &[u8], delta: &TextDelta) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(delta.target_len() as usize);
    for window in &delta.windows {
        let offset = out.len() as u64;
        apply_window(source, window, offset, &mut out)?;
    }
    Ok(out)
}

/// Apply an encoded delta stream window by window, writing the target to
/// `out`. Returns the number of target bytes written.
pub fn apply_delta_stream<R: Read, W: Write>(
    source: &[u8],
    delta: R,
    mut out: W,
    cancel: CancelFn<'_>,
) -> Result<u64> {
    let mut decoder = DeltaDecoder::new(delta);
    let mut written = 0u64;
    let mut buf = Vec::new();
    while let Some(window) = decoder.next_window()? {
        check_cancel(cancel)?;
        buf.clear();
        apply_window(source, &window, written, &mut buf)?;
        out.write_all(&buf)?;
        written += buf.len() as u64;
    }
    Ok(written)
}

// ---- Encoding ----

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    loop {
        groups[n] = (value & 0x7f) as u8;
        n += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let cont = if i > 0 { 0x80 } else { 0 };
        buf.push(groups[i] | cont);
    }
}

fn encode_ops(ops: &[Instruction]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ops.len() * 3);
    for op in ops {
        let (code, len, offset) = match *op {
            Instruction::CopySource { offset, len } => (OP_SOURCE, len, Some(offset)),
            Instruction::CopyTarget { offset, len } => (OP_TARGET, len, Some(offset)),
            Instruction::NewData { len } => (OP_NEW, len, None),
        };
        if len < 0x40 {
            buf.push((code << 6) | len as u8);
        } else {
            buf.push(code << 6);
            write_varint(&mut buf, len as u64);
        }
        if let Some(offset) = offset {
            write_varint(&mut buf, offset as u64);
        }
    }
    buf
}

/// Streaming delta writer
pub struct DeltaEncoder<W: Write> {
    out: W,
    header_written: bool,
}

impl<W: Write> DeltaEncoder<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }

    fn ensure_header(&mut self) -> Result<()> {
        if !self.header_written {
            self.out.write_all(DELTA_HEADER)?;
            self.header_written = true;
        }
        Ok(())
    }

    pub fn write_window(&mut self, window: &DeltaWindow) -> Result<()> {
        self.ensure_header()?;
        let ops = encode_ops(&window.ops);
        let mut head = Vec::with_capacity(16);
        write_varint(&mut head, window.sview_offset);
        write_varint(&mut head, window.sview_len as u64);
        write_varint(&mut head, window.tview_len as u64);
        write_varint(&mut head, ops.len() as u64);
        write_varint(&mut head, window.new_data.len() as u64);
        self.out.write_all(&head)?;
        self.out.write_all(&ops)?;
        self.out.write_all(&window.new_data)?;
        Ok(())
    }

    /// Write the header if no window was written and return the sink.
    pub fn finish(mut self) -> Result<W> {
        self.ensure_header()?;
        self.out.flush()?;
        Ok(self.out)
    }
}

// ---- Decoding ----

/// Streaming delta reader yielding one window at a time
pub struct DeltaDecoder<R: Read> {
    input: R,
    offset: u64,
    header_read: bool,
}

impl<R: Read> DeltaDecoder<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            offset: 0,
            header_read: false,
        }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        loop {
            match self.input.read(&mut b) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    return Ok(Some(b[0]));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_exact_vec(&mut self, len: usize, what: &str) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.input.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ReposError::corrupt_delta(self.offset, format!("truncated {}", what))
            } else {
                e.into()
            }
        })?;
        self.offset += len as u64;
        Ok(buf)
    }

    /// Read a varint; `Ok(None)` only on a clean end of stream before the
    /// first byte.
    fn read_varint(&mut self, allow_eof: bool) -> Result<Option<u64>> {
        let mut value: u64 = 0;
        for i in 0..10 {
            let byte = match self.read_byte()? {
                Some(b) => b,
                None if i == 0 && allow_eof => return Ok(None),
                None => return Err(ReposError::corrupt_delta(self.offset, "truncated integer")),
            };
            if value > (u64::MAX >> 7) {
                return Err(ReposError::corrupt_delta(self.offset, "integer overflow"));
            }
            value = (value << 7) | (byte & 0x7f) as u64;
            if byte & 0x80 == 0 {
                return Ok(Some(value));
            }
        }
        Err(ReposError::corrupt_delta(self.offset, "integer too long"))
    }

    fn read_len(&mut self, what: &str) -> Result<usize> {
        let value = self
            .read_varint(false)?
            .ok_or_else(|| ReposError::corrupt_delta(self.offset, "truncated integer"))?;
        if value > MAX_DECODED_LEN {
            return Err(ReposError::corrupt_delta(
                self.offset,
                format!("{} of {} bytes exceeds limit", what, value),
            ));
        }
        Ok(value as usize)
    }

    /// Next window, or `None` at the end of the stream.
    pub fn next_window(&mut self) -> Result<Option<DeltaWindow>> {
        if !self.header_read {
            let header = self.read_exact_vec(4, "header")?;
            if header != DELTA_HEADER {
                return Err(ReposError::corrupt_delta(0, "missing delta header"));
            }
            self.header_read = true;
        }
        let sview_offset = match self.read_varint(true)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let sview_len = self.read_len("source view")?;
        let tview_len = self.read_len("target view")?;
        let ins_len = self.read_len("instructions")?;
        let new_len = self.read_len("new data")?;
        let ins_start = self.offset;
        let ins = self.read_exact_vec(ins_len, "instructions")?;
        let new_data = self.read_exact_vec(new_len, "new data")?;
        let ops = decode_ops(&ins, ins_start)?;
        Ok(Some(DeltaWindow {
            sview_offset,
            sview_len,
            tview_len,
            ops,
            new_data: Bytes::from(new_data),
        }))
    }
}

fn decode_ops(data: &[u8], base_offset: u64) -> Result<Vec<Instruction>> {
    let mut cursor = DeltaDecoder {
        input: data,
        offset: base_offset,
        header_read: true,
    };
    let mut ops = Vec::new();
    while let Some(byte) = cursor.read_byte()? {
        let code = byte >> 6;
        let mut len = (byte & 0x3f) as usize;
        if len == 0 {
            len = cursor.read_len("instruction length")?;
        }
        if len == 0 {
            return Err(ReposError::corrupt_delta(cursor.offset, "zero-length instruction"));
        }
        let op = match code {
            OP_SOURCE => Instruction::CopySource {
                offset: cursor.read_len("copy offset")?,
                len,
            },
            OP_TARGET => Instruction::CopyTarget {
                offset: cursor.read_len("copy offset")?,
                len,
            },
            OP_NEW => Instruction::NewData { len },
            _ => return Err(ReposError::corrupt_delta(cursor.offset, "invalid opcode")),
        };
        ops.push(op);
    }
    Ok(ops)
}
