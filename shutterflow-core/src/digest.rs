use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Streaming SHA-256 of a file, hashed in 1 MiB chunks off the async
/// runtime. Returns the lowercase hex digest.
pub async fn hash_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("hash task panicked: {e}")))??;
    Ok(digest)
}
