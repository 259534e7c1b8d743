use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Content fingerprints hash the file in blocks of this size.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

const BUF_SIZE: usize = 64 * 1024;

/// Block-wise content fingerprint: SHA-256 of every 4 MiB block, then
/// SHA-256 over the concatenated block digests. Identical bytes always give
/// the same fingerprint regardless of how they were chunked in transit.
#[derive(Default)]
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_len: usize,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = BLOCK_SIZE - self.block_len;
            let take = room.min(data.len());
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];
            if self.block_len == BLOCK_SIZE {
                self.flush_block();
            }
        }
    }

    fn flush_block(&mut self) {
        let digest = std::mem::take(&mut self.block).finalize();
        self.overall.update(digest);
        self.block_len = 0;
    }

    /// Hex-encoded fingerprint (64 chars, lowercase).
    pub fn finish(mut self) -> String {
        if self.block_len > 0 {
            self.flush_block();
        }
        hex_encode(&self.overall.finalize())
    }
}

pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Fingerprint a file on disk, reading in 64 KB chunks.
pub async fn content_hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;

    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finish())
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
