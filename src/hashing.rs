//! Hash a file's contents into the 20-byte digest used as its content
//! address (C4): BLAKE2b truncated to 20 bytes, streamed in fixed-size
//! blocks so hashing a file never requires buffering it whole. The
//! digest is a dedup/integrity key, not a MAC - collision resistance
//! against an adversary controlling file contents isn't a goal.

use std::fmt;
use std::fs::File;
use std::io::Read;

use anyhow::{Context, Result};
use blake2::Blake2bVar;
use blake2::digest::{Update, VariableOutput};
use camino::Utf8Path;

/// Block size for streaming reads while hashing.
const BLOCK_SIZE: usize = 64 * 1024;

/// A BLAKE2b-20 digest. Doubles as the `hash` field of a
/// [`crate::metadata::RegularFileState`], whose first `size` bytes are
/// literal file contents instead of a hash when `size <= 20` (inline
/// storage - see spec §3, §4.5).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Hash20(pub [u8; 20]);

impl Hash20 {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex, used verbatim in content filenames (spec §6.2).
    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(40);
        for b in self.0 {
            use std::fmt::Write;
            write!(s, "{b:02x}").unwrap();
        }
        s
    }

    /// The first hash byte, used as the outer fan-out directory name.
    pub fn fanout_outer(&self) -> u8 {
        self.0[0]
    }

    /// The second hash byte, used as the inner fan-out directory name.
    pub fn fanout_inner(&self) -> u8 {
        self.0[1]
    }
}

impl fmt::Debug for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash20({})", self.to_hex())
    }
}

impl fmt::Display for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash raw bytes straight into a [`Hash20`] (used for small in-memory
/// buffers - e.g. in tests, or comparing candidate content before it's
/// written to disk).
pub fn hash_bytes(bytes: &[u8]) -> Hash20 {
    let mut hasher = Blake2bVar::new(20).expect("20 is a valid BLAKE2b output size");
    hasher.update(bytes);
    let mut out = [0u8; 20];
    hasher
        .finalize_variable(&mut out)
        .expect("output buffer is exactly 20 bytes");
    Hash20(out)
}

/// Hash a file's contents, streaming it through in [`BLOCK_SIZE`] chunks
/// rather than loading it wholesale - spec C4's "block-sized reads".
pub fn hash_file(path: &Utf8Path) -> Result<Hash20> {
    let mut f = File::open(path).with_context(|| format!("Couldn't open {path} to hash it"))?;
    hash_reader(&mut f).with_context(|| format!("Couldn't hash {path}"))
}

/// The 20-byte value that belongs in a `RegularFileState`'s hash field for
/// a file of the given `size`: its literal bytes when `size <= 20`
/// (inline storage), otherwise its real BLAKE2b-20 digest. Used both by
/// the backup pipeline's finalisation step and by its change-detection
/// probe during initiation (re-hash on a bare mtime change).
pub fn probe(path: &Utf8Path, size: u64) -> Result<Hash20> {
    if size <= 20 {
        let bytes = std::fs::read(path).with_context(|| format!("Couldn't read {path}"))?;
        let mut out = [0u8; 20];
        out[..bytes.len()].copy_from_slice(&bytes);
        Ok(Hash20(out))
    } else {
        hash_file(path)
    }
}

fn hash_reader<R: Read>(r: &mut R) -> Result<Hash20> {
    let mut hasher = Blake2bVar::new(20).expect("20 is a valid BLAKE2b output size");
    let mut buf = [0u8; BLOCK_SIZE];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut out = [0u8; 20];
    hasher
        .finalize_variable(&mut out)
        .expect("output buffer is exactly 20 bytes");
    Ok(Hash20(out))
}
