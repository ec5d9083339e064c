//! SHA-256 hex digests for keys and file contents.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const READ_BUFFER: usize = 64 * 1024;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Feed the whole file at `path` into `hasher`. Returns the number of bytes read.
pub async fn update_from_file(hasher: &mut Sha256, path: &Path) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buffer = vec![0u8; READ_BUFFER];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok(total)
}

/// SHA-256 hex digest of a file's contents.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    update_from_file(&mut hasher, path).await?;
    Ok(format!("{:x}", hasher.finalize()))
}
