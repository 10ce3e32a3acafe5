//! Writer/reader pairs for artifact payloads.
//!
//! Every blob artifact carries a [`Codec`]: a pair of plain functions that
//! encode a value onto a byte stream and decode one back. The framework does
//! not prescribe a format; it ships a JSON codec and a suffix-based default
//! table, and tasks may attach their own pair.

use std::io::{Read, Write};
use std::path::Path;

use serde_json::Value;

/// Encode a value onto a byte stream.
pub type Writer = fn(&Value, &mut dyn Write) -> std::io::Result<()>;

/// Decode a value from a byte stream.
pub type Reader = fn(&mut dyn Read) -> std::io::Result<Value>;

/// A named `(Writer, Reader)` pair.
#[derive(Clone, Copy)]
pub struct Codec {
    pub name: &'static str,
    pub write: Writer,
    pub read: Reader,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").field("name", &self.name).finish()
    }
}

/// The bundled JSON codec.
pub const JSON: Codec = Codec {
    name: "json",
    write: write_json,
    read: read_json,
};

fn write_json(value: &Value, out: &mut dyn Write) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    out.flush()
}

fn read_json(input: &mut dyn Read) -> std::io::Result<Value> {
    let mut buf = Vec::new();
    input.read_to_end(&mut buf)?;
    serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Default reader table: choose a codec from the file suffix.
///
/// Unknown suffixes fall back to JSON.
pub fn for_path(path: &Path) -> Codec {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => JSON,
        _ => JSON,
    }
}
