use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

const READ_BUF_BYTES: usize = 8192;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("file not found: {path}")]
    NotFound { path: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl DigestError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            DigestError::NotFound {
                path: path.display().to_string(),
            }
        } else {
            DigestError::Io {
                path: path.display().to_string(),
                source,
            }
        }
    }
}

/// Streaming SHA-256 of a file, lowercase hex. Memory use is bounded by the
/// read buffer regardless of file size.
pub fn file_sha256(path: &Path) -> Result<String, DigestError> {
    let mut file = File::open(path).map_err(|e| DigestError::from_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; READ_BUF_BYTES];
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|e| DigestError::from_io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
