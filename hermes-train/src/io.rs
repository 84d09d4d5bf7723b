//! Compression-aware file readers for JSONL corpora and prompt files.

use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::Result;

/// Opens a file and returns a buffered reader, automatically decompressing
/// based on file extension (.gz, .zst, .zstd).
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let reader: Box<dyn Read> = match extension.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(file)),
        "zst" | "zstd" => Box::new(zstd::Decoder::new(file)?),
        _ => Box::new(file),
    };

    Ok(Box::new(BufReader::new(reader)))
}

/// Reads entire file content as string, automatically decompressing if needed.
pub fn read_to_string<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut reader = open_file(path)?;
    let mut content = String::new();
    reader.read_to_string(&mut content)?;
    Ok(content)
}

/// Returns an iterator over lines, automatically decompressing if needed.
pub fn read_lines<P: AsRef<Path>>(path: P) -> Result<impl Iterator<Item = Result<String>>> {
    let reader = open_file(path)?;
    Ok(reader.lines().map(|r| r.map_err(Into::into)))
}

/// Parses every non-empty line of a (possibly compressed) JSONL file.
pub fn read_jsonl<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for line in read_lines(path)? {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
