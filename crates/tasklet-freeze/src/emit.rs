//! Artifact rendering and atomic output

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// First line of every generated artifact
pub const HEADER: &str = "// Auto-generated by tasklet-freeze; do not edit.";

/// Bytes per line of the rendered array
pub const BYTES_PER_LINE: usize = 16;

/// Render `data` as a Rust static byte array named `symbol`
pub fn render(symbol: &str, data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 128);
    out.push_str(HEADER);
    out.push('\n');
    out.push_str(&format!(
        "pub static {symbol}: [u8; {}] = [\n",
        data.len()
    ));
    for chunk in data.chunks(BYTES_PER_LINE) {
        out.push_str("    ");
        for byte in chunk {
            out.push_str(&byte.to_string());
            out.push(',');
        }
        out.push('\n');
    }
    out.push_str("];\n");
    out
}

/// Write `contents` to `path` through a temporary file in the same
/// directory, so `path` only ever holds a complete artifact
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !fs::metadata(dir)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "output directory does not exist",
        ));
    }

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}
