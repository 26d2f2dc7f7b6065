//! Reading `compatible` labels out of device trees, both compiled
//! (flattened device tree blobs) and in source form.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_HEADER_LEN: usize = 40;
const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;
const COMPATIBLE: &str = "compatible";

fn malformed(detail: impl Into<String>) -> Error {
    Error::Malformed {
        what: "device tree blob",
        detail: detail.into(),
    }
}

/// Big-endian cursor over the structure block.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u32(&mut self) -> Result<u32> {
        let end = self.pos + 4;
        let b = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| malformed("truncated structure block"))?;
        self.pos = end;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let b = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| malformed("truncated property"))?;
        self.pos = align4(end);
        Ok(b)
    }

    fn cstr(&mut self) -> Result<&'a [u8]> {
        let rest = self.buf.get(self.pos..).unwrap_or_default();
        let nul = rest
            .iter()
            .position(|&c| c == 0)
            .ok_or_else(|| malformed("unterminated node name"))?;
        let s = &rest[..nul];
        self.pos = align4(self.pos + nul + 1);
        Ok(s)
    }
}

fn align4(v: usize) -> usize {
    (v + 3) & !3
}

fn header_field(blob: &[u8], idx: usize) -> u32 {
    let o = idx * 4;
    u32::from_be_bytes([blob[o], blob[o + 1], blob[o + 2], blob[o + 3]])
}

fn string_list(v: &[u8]) -> Vec<String> {
    v.split(|&c| c == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Find property `name` of the node at `path` (`/` separated, `/` being the
/// root node) in a flattened device tree, returning its raw value.
pub fn property<'a>(blob: &'a [u8], path: &str, name: &str) -> Result<Option<&'a [u8]>> {
    if blob.len() < FDT_HEADER_LEN {
        return Err(malformed("too short for a header"));
    }
    if header_field(blob, 0) != FDT_MAGIC {
        return Err(malformed("bad magic"));
    }
    let totalsize = header_field(blob, 1) as usize;
    let off_struct = header_field(blob, 2) as usize;
    let off_strings = header_field(blob, 3) as usize;
    if totalsize > blob.len() || off_struct >= totalsize || off_strings >= totalsize {
        return Err(malformed("header offsets out of range"));
    }
    let strings = &blob[off_strings..totalsize];
    let mut c = Cursor {
        buf: &blob[..totalsize],
        pos: off_struct,
    };
    let want: Vec<&[u8]> = path
        .split('/')
        .filter(|p| !p.is_empty())
        .map(str::as_bytes)
        .collect();

    // Names of the nodes we are in, below the root
    let mut nodes: Vec<&[u8]> = Vec::new();
    let mut depth = 0usize;
    loop {
        match c.u32()? {
            FDT_BEGIN_NODE => {
                let n = c.cstr()?;
                if depth > 0 {
                    nodes.push(n);
                }
                depth += 1;
            }
            FDT_END_NODE => {
                if depth == 0 {
                    return Err(malformed("unbalanced end of node"));
                }
                depth -= 1;
                nodes.pop();
                if depth == 0 {
                    return Ok(None);
                }
            }
            FDT_PROP => {
                let len = c.u32()? as usize;
                let nameoff = c.u32()? as usize;
                let value = c.bytes(len)?;
                if depth == 0 || nodes != want {
                    continue;
                }
                let pname = strings
                    .get(nameoff..)
                    .and_then(|s| s.split(|&b| b == 0).next())
                    .ok_or_else(|| malformed("property name offset out of range"))?;
                if pname == name.as_bytes() {
                    return Ok(Some(value));
                }
            }
            FDT_NOP => {}
            FDT_END => return Ok(None),
            o => return Err(malformed(format!("unknown token {o:#x}"))),
        }
    }
}

/// A string property value, without its terminating NUL.
pub fn string_value(value: &[u8]) -> String {
    let v = value.strip_suffix(&[0]).unwrap_or(value);
    String::from_utf8_lossy(v).into_owned()
}

/// Parse the root node's `compatible` property of a flattened device tree.
///
/// Returns an empty list if the root node carries no such property.
pub fn compatible_from_blob(blob: &[u8]) -> Result<Vec<String>> {
    Ok(property(blob, "/", COMPATIBLE)?
        .map(string_list)
        .unwrap_or_default())
}

static COMPATIBLE_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*compatible\s*=\s*((?:"[^"]*"\s*,?\s*)+);"#).unwrap()
});

fn quoted_strings(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split('"')
        .skip(1)
        .step_by(2)
        .map(ToOwned::to_owned)
}

/// All labels of every `compatible = "..."` statement in a device tree source.
pub fn source_compatibles(source: &str) -> Vec<String> {
    COMPATIBLE_STATEMENT
        .captures_iter(source)
        .flat_map(|c| {
            c.get(1)
                .map(|m| quoted_strings(m.as_str()).collect::<Vec<_>>())
                .unwrap_or_default()
        })
        .collect()
}

/// The labels of the first `compatible = "..."` statement in a device tree
/// source, which for a full device tree belongs to the root node.
pub fn compatible_from_source(source: &str) -> Vec<String> {
    COMPATIBLE_STATEMENT
        .captures(source)
        .and_then(|c| c.get(1))
        .map(|m| quoted_strings(m.as_str()).collect())
        .unwrap_or_default()
}

/// Whether a device tree source is an overlay (carries the `/plugin/;` tag).
pub fn is_overlay_source(source: &str) -> bool {
    source.lines().any(|l| l.trim() == "/plugin/;")
}

/// Whether an overlay source declares compatibility with any of `labels`.
pub fn overlay_matches(overlay_source: &str, labels: &[String]) -> bool {
    source_compatibles(overlay_source)
        .iter()
        .any(|c| labels.contains(c))
}
