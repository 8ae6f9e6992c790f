//! Safe IO wrappers (C3): file streams, directory iteration, stat/lstat,
//! symlink reads, atomic rename, and fsync of files and directories.
//!
//! This is the layer every blocking syscall in the engine goes through
//! (§5: "All blocking occurs inside the safe-IO layer"). Built on
//! [`rustix`] for the full POSIX surface the data model assumes (uid/gid,
//! mode bits, readlink, directory fsync).

use std::fs;
use std::io;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::{Mode, OFlags};

/// The kind of thing `lstat` found at a path, independent of backup policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatType {
    Regular,
    Symlink,
    Directory,
    Other,
}

/// Just the fields of a `stat`/`lstat` result the engine cares about -
/// see spec §3 `PathState`.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub kind: StatType,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime: i64,
    pub size: u64,
}

fn classify(mode: rustix::fs::FileType) -> StatType {
    use rustix::fs::FileType;
    match mode {
        FileType::RegularFile => StatType::Regular,
        FileType::Symlink => StatType::Symlink,
        FileType::Directory => StatType::Directory,
        _ => StatType::Other,
    }
}

/// `lstat` a path (does not follow a trailing symlink).
pub fn lstat(path: &Utf8Path) -> Result<Stat> {
    let st = rustix::fs::lstat(path.as_std_path())
        .with_context(|| format!("Couldn't lstat {path}"))?;
    Ok(Stat {
        kind: classify(rustix::fs::FileType::from_raw_mode(st.st_mode)),
        uid: st.st_uid,
        gid: st.st_gid,
        mode: st.st_mode as u32 & 0o7777,
        mtime: st.st_mtime,
        size: st.st_size as u64,
    })
}

/// Read a symlink's target.
pub fn read_link(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let target =
        fs::read_link(path).with_context(|| format!("Couldn't readlink {path}"))?;
    Utf8PathBuf::try_from(target).context("Symlink target isn't UTF-8")
}

/// Iterate a directory's entries, returning their full paths. POSIX leaves
/// the order unspecified (spec §5 (i)) - callers must not depend on it.
pub fn read_dir(path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("Couldn't read directory {path}"))? {
        let entry = entry.with_context(|| format!("Couldn't read an entry of {path}"))?;
        let p = Utf8PathBuf::try_from(entry.path())
            .with_context(|| format!("Non-UTF-8 entry under {path}"))?;
        entries.push(p);
    }
    Ok(entries)
}

/// Open a file for reading.
pub fn open_read(path: &Utf8Path) -> Result<fs::File> {
    fs::File::open(path).with_context(|| format!("Couldn't open {path}"))
}

/// Create (or truncate) a file for writing, with the given mode.
pub fn create_write(path: &Utf8Path, mode: u32) -> Result<fs::File> {
    let fd = rustix::fs::openat(
        rustix::fs::CWD,
        path.as_std_path(),
        OFlags::WRONLY | OFlags::CREATE | OFlags::TRUNC,
        Mode::from_raw_mode(mode),
    )
    .with_context(|| format!("Couldn't create {path}"))?;
    Ok(fs::File::from(fd))
}

/// Create a directory, ignoring "already exists".
pub fn mkdir_p_one(path: &Utf8Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Couldn't create directory {path}")),
    }
}

/// fdatasync a file - flush its data (and enough metadata to find that
/// data again) to stable storage, without the full overhead of `fsync`'s
/// metadata sync (we fsync the containing directory separately, which is
/// where the structural metadata lives that `fdatasync` skips).
pub fn fdatasync(f: &fs::File) -> Result<()> {
    rustix::fs::fdatasync(f).context("fdatasync failed")
}

/// Open a directory (read-only, just to fsync it).
pub fn open_dir_for_sync(path: &Utf8Path) -> Result<OwnedFd> {
    let fd = rustix::fs::openat(
        rustix::fs::CWD,
        path.as_std_path(),
        OFlags::RDONLY | OFlags::DIRECTORY,
        Mode::empty(),
    )
    .with_context(|| format!("Couldn't open directory {path} to sync it"))?;
    Ok(fd)
}

/// fsync a directory by path. Required after `mkdir` and after any `rename`
/// that changed one of its entries (spec §4.1, §5 (iv)).
pub fn fsync_dir(path: &Utf8Path) -> Result<()> {
    let fd = open_dir_for_sync(path)?;
    rustix::fs::fsync(fd.as_fd()).with_context(|| format!("Couldn't fsync directory {path}"))
}

/// Atomically rename `from` to `to`, within the same filesystem.
pub fn rename(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    fs::rename(from, to).with_context(|| format!("Couldn't rename {from} to {to}"))
}

/// Byte-for-byte compare two files - used by the slot-collision check
/// (spec §4.1 "Slot semantics").
pub fn files_equal(a: &Utf8Path, b: &Utf8Path) -> Result<bool> {
    use std::io::Read;

    let mut fa = open_read(a)?;
    let mut fb = open_read(b)?;

    let mut ba = [0u8; 64 * 1024];
    let mut bb = [0u8; 64 * 1024];
    loop {
        let na = fa.read(&mut ba).with_context(|| format!("Couldn't read {a}"))?;
        let nb = fb.read(&mut bb).with_context(|| format!("Couldn't read {b}"))?;
        if na != nb {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
        if ba[..na] != bb[..nb] {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn lstat_classifies_types() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();

        let file_path = dir_path.join("f");
        fs::File::create(&file_path)?.write_all(b"hi")?;
        let st = lstat(&file_path)?;
        assert_eq!(st.kind, StatType::Regular);
        assert_eq!(st.size, 2);

        let subdir = dir_path.join("d");
        fs::create_dir(&subdir)?;
        assert_eq!(lstat(&subdir)?.kind, StatType::Directory);

        #[cfg(unix)]
        {
            let link_path = dir_path.join("l");
            std::os::unix::fs::symlink("f", &link_path)?;
            assert_eq!(lstat(&link_path)?.kind, StatType::Symlink);
            assert_eq!(read_link(&link_path)?, Utf8PathBuf::from("f"));
        }
        Ok(())
    }

    #[test]
    fn files_equal_detects_mismatch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        let a = dir_path.join("a");
        let b = dir_path.join("b");
        let c = dir_path.join("c");
        fs::write(&a, b"hello")?;
        fs::write(&b, b"hello")?;
        fs::write(&c, b"world")?;
        assert!(files_equal(&a, &b)?);
        assert!(!files_equal(&a, &c)?);
        Ok(())
    }
}
