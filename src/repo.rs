//! The content-addressed repository layer (C5): a directory this engine
//! owns outright, holding `metadata`, an advisory `lockfile`, a scratch
//! `tmp-file`, and a two-level hex fan-out of content files keyed by
//! `(hash, size, slot)`.
//!
//! Every commit follows the same crash-atomic protocol (§4.1): write to
//! a tmp sibling, fdatasync the file itself, make sure both fan-out
//! directories exist (fsyncing any one we had to create), rename, fsync
//! the directory the rename landed in, and finally fsync the repository
//! root.

use std::fs;
use std::io::{self, Read, Write};

use anyhow::{bail, ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::error::Failure;
use crate::hashing::Hash20;
use crate::io_util;

const METADATA_NAME: &str = "metadata";
const LOCKFILE_NAME: &str = "lockfile";
const TMP_NAME: &str = "tmp-file";

/// The content address of a stored file: which bytes, how many, and which
/// slot disambiguates it from another file sharing the same (hash, size).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ContentId {
    pub hash: Hash20,
    pub size: u64,
    pub slot: u8,
}

impl ContentId {
    /// The filename this content id occupies, exact format from §6.2:
    /// `<40 hex chars>x<size as lowercase hex, no leading zeros>x<slot as
    /// lowercase hex, no leading zeros>`.
    pub fn filename(&self) -> String {
        format!("{}x{:x}x{:x}", self.hash.to_hex(), self.size, self.slot)
    }

    fn rel_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{:02x}/{:02x}/{}",
            self.hash.fanout_outer(),
            self.hash.fanout_inner(),
            self.filename()
        ))
    }

    /// Parse a content file's name back into its `(hash, size, slot)`
    /// triple (§6.2), the inverse of [`ContentId::filename`]. Used by the
    /// garbage collector, which only has filenames to work from.
    pub fn parse_filename(name: &str) -> Option<ContentId> {
        let mut parts = name.splitn(3, 'x');
        let hex = parts.next()?;
        let size_hex = parts.next()?;
        let slot_hex = parts.next()?;
        if hex.len() != 40 {
            return None;
        }
        let mut hash = [0u8; 20];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        let size = u64::from_str_radix(size_hex, 16).ok()?;
        let slot = u8::from_str_radix(slot_hex, 16).ok()?;
        Some(ContentId {
            hash: Hash20(hash),
            size,
            slot,
        })
    }
}

/// An open repository directory.
pub struct Repository {
    root: Utf8PathBuf,
    _lock: fs::File,
}

impl Repository {
    /// Create a fresh, empty repository at `root`: the two-level fan-out
    /// of 256x256 directories plus an empty metadata file.
    pub fn init(root: &Utf8Path) -> Result<()> {
        ensure!(!root.exists(), "The directory {root} already exists");
        io_util::mkdir_p_one(root)?;
        for outer in 0..=255u8 {
            let dir = root.join(format!("{outer:02x}"));
            io_util::mkdir_p_one(&dir)?;
            for inner in 0..=255u8 {
                io_util::mkdir_p_one(&dir.join(format!("{inner:02x}")))?;
            }
        }
        fs::write(root.join(METADATA_NAME), [])
            .with_context(|| format!("Couldn't create {root}/{METADATA_NAME}"))?;
        io_util::fsync_dir(root)?;
        Ok(())
    }

    /// Open an existing repository, taking the advisory lock.
    ///
    /// The lock is created with `O_EXCL`: if it already exists, another
    /// run holds it (spec §5 "Shared-resource policy").
    pub fn open(root: &Utf8Path) -> Result<Self> {
        ensure!(root.is_dir(), "The directory {root} doesn't exist");
        let lock_path = root.join(LOCKFILE_NAME);
        let lock = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .with_context(|| {
                format!("Couldn't create {lock_path} - is another run already in progress?")
            })?;
        Ok(Self {
            root: root.to_owned(),
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn abs(&self, rel: &Utf8Path) -> Utf8PathBuf {
        self.root.join(rel)
    }

    fn tmp_path(&self) -> Utf8PathBuf {
        self.abs(Utf8Path::new(TMP_NAME))
    }

    fn metadata_path(&self) -> Utf8PathBuf {
        self.abs(Utf8Path::new(METADATA_NAME))
    }

    /// Pure path check - does a content file at this id already exist?
    pub fn exists(&self, id: &ContentId) -> bool {
        self.abs(&id.rel_path()).is_file()
    }

    /// Open a reader over a content-addressed file. Fails loudly if
    /// missing; there is no recoverable "not found" here, per §4.1.
    pub fn open_reader(&self, id: &ContentId) -> Result<Reader> {
        let path = self.abs(&id.rel_path());
        let file = io_util::open_read(&path)?;
        Ok(Reader { file })
    }

    /// Read the metadata file's full bytes (raw-mode read counterpart).
    pub fn read_metadata(&self) -> Result<Vec<u8>> {
        fs::read(self.metadata_path())
            .with_context(|| format!("Couldn't read {}", self.metadata_path()))
    }

    /// Open a writer that will land at this content id's final path.
    pub fn open_writer(&self, id: ContentId) -> Result<Writer<'_>> {
        self.open_writer_raw(id.rel_path())
    }

    /// Open a writer whose final path is given explicitly, bypassing
    /// content addressing - used to write `metadata` itself (§6.4
    /// "Raw-mode write").
    pub fn open_writer_raw(&self, final_rel_path: Utf8PathBuf) -> Result<Writer<'_>> {
        let tmp_path = self.tmp_path();
        let file = io_util::create_write(&tmp_path, 0o644)?;
        Ok(Writer {
            repo: self,
            file: Some(file),
            tmp_path,
            final_rel_path,
        })
    }

    /// Find a free slot for `(hash, size)`: starting at 0, byte-compare
    /// any existing content file at that slot against `source`; reuse on
    /// equality, otherwise bump the slot (§4.1 "Slot semantics", §4.5).
    pub fn find_slot(&self, hash: Hash20, size: u64, source: &Utf8Path) -> Result<u8> {
        for slot in 0..=255u8 {
            let id = ContentId { hash, size, slot };
            if !self.exists(&id) {
                return Ok(slot);
            }
            let existing = self.abs(&id.rel_path());
            if io_util::files_equal(source, &existing)? {
                debug!("{source} is a duplicate of existing slot {slot}");
                return Ok(slot);
            }
        }
        bail!(Failure::SlotOverflow(source.to_string()))
    }

    /// List every on-disk content id currently stored, by walking the
    /// 256x256 fan-out directories (§4.7 "walk the repository's on-disk
    /// objects").
    pub fn list_content(&self) -> Result<Vec<ContentId>> {
        let mut out = Vec::new();
        for outer in 0..=255u8 {
            let outer_dir = self.root.join(format!("{outer:02x}"));
            for inner in 0..=255u8 {
                let inner_dir = outer_dir.join(format!("{inner:02x}"));
                for entry in io_util::read_dir(&inner_dir)? {
                    let Some(name) = entry.file_name() else {
                        continue;
                    };
                    if let Some(id) = ContentId::parse_filename(name) {
                        out.push(id);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Delete a content file outright, returning its size in bytes.
    /// Garbage collection (§4.7) is the only caller - every other writer
    /// path is write-then-rename, never a bare unlink.
    pub fn remove_content(&self, id: &ContentId) -> Result<u64> {
        let path = self.abs(&id.rel_path());
        let len = fs::metadata(&path)
            .with_context(|| format!("Couldn't stat {path}"))?
            .len();
        fs::remove_file(&path).with_context(|| format!("Couldn't remove {path}"))?;
        Ok(len)
    }

    /// Write the full bytes of `metadata` atomically, then fsync the
    /// repository root (§5 (iii): metadata is written strictly after every
    /// content file has been committed).
    pub fn write_metadata(&self, bytes: &[u8]) -> Result<()> {
        let mut w = self.open_writer_raw(Utf8PathBuf::from(METADATA_NAME))?;
        w.write_all(bytes)?;
        w.close()?;
        io_util::fsync_dir(&self.root)?;
        Ok(())
    }
}

pub struct Reader {
    file: fs::File,
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Reader {
    /// Read exactly `buf.len()` bytes; short reads or IO errors are fatal
    /// (§4.1 "Reader::read ... EOF or IO is fatal").
    pub fn read_exact_or_fail(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact(buf)
            .context("Short read from a content file - repository is corrupt")
    }
}

/// A write-then-rename handle. Every byte goes to `tmp-file` first; only
/// [`Writer::close`] makes the content visible at its final name.
pub struct Writer<'a> {
    repo: &'a Repository,
    file: Option<fs::File>,
    tmp_path: Utf8PathBuf,
    final_rel_path: Utf8PathBuf,
}

impl Write for Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.as_mut().expect("write after close").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().expect("write after close").flush()
    }
}

impl Writer<'_> {
    /// The crash-atomic commit (§4.1): flush, fdatasync, fclose, make sure
    /// both fan-out directories exist (fsyncing any newly created one),
    /// rename tmp to final, fsync the directory the rename landed in.
    pub fn close(mut self) -> Result<()> {
        let mut file = self.file.take().expect("close called twice");
        file.flush().context("Couldn't flush tmp-file")?;
        io_util::fdatasync(&file)?;
        drop(file);

        let final_path = self.repo.abs(&self.final_rel_path);
        if let Some(parent) = self.final_rel_path.parent() {
            if !parent.as_str().is_empty() {
                self.ensure_ancestor_dirs(parent)?;
            }
        }

        io_util::rename(&self.tmp_path, &final_path)?;

        let parent_abs = final_path
            .parent()
            .map(|p| p.to_owned())
            .unwrap_or_else(|| self.repo.root.clone());
        io_util::fsync_dir(&parent_abs)?;
        if parent_abs != self.repo.root {
            io_util::fsync_dir(&self.repo.root)?;
        }
        Ok(())
    }

    /// Create `<root>/<rel>`'s ancestor chain if missing, fsyncing each
    /// directory we actually had to create. Content directories are
    /// pre-created by [`Repository::init`], so in practice this is a
    /// no-op for content writes and only matters for future layouts.
    fn ensure_ancestor_dirs(&self, rel: &Utf8Path) -> Result<()> {
        let mut built = Utf8PathBuf::new();
        for comp in rel.components() {
            built.push(comp.as_str());
            let abs = self.repo.abs(&built);
            if !abs.is_dir() {
                io_util::mkdir_p_one(&abs)?;
                let parent = abs.parent().unwrap_or(&self.repo.root).to_owned();
                io_util::fsync_dir(&parent)?;
            }
        }
        Ok(())
    }
}
