//! SHA-1 content hashing for pack archives.
//!
//! The pack transfer protocol identifies an archive by the lowercase hex
//! SHA-1 of its bytes. Clients that receive a pack without a hash compute
//! it themselves on receipt; distributors that can reach the bytes cheaply
//! (local files, already-fetched objects) compute it up front so clients
//! can skip re-downloads.

use std::io;
use std::path::Path;

use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

/// Hash an in-memory byte slice.
pub fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

/// Hash a local file without loading it whole into memory.
///
/// Used by the self-hosted distributor, which has direct filesystem access
/// to the bytes it serves and therefore never hashes over the network.
pub async fn sha1_hex_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut digest = Sha1::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        digest.update(&buf[..read]);
    }
    Ok(hex::encode(digest.finalize()))
}
