//! Content hashing for ingested rows and source files

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Separator placed between cell values before hashing.
///
/// The ASCII unit separator never appears in well-formed CSV text, so
/// `["a,b", "c"]` and `["a", "b,c"]` hash differently.
const CELL_SEPARATOR: u8 = 0x1f;

/// Compute the SHA-256 hex digest of a row's raw cell values
pub fn row_content_hash<I, S>(cells: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for (i, cell) in cells.into_iter().enumerate() {
        if i > 0 {
            hasher.update([CELL_SEPARATOR]);
        }
        hasher.update(cell.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 hex digest of a file, streaming it in 8 KiB chunks
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute the SHA-256 hex digest of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
