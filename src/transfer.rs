//! File body transfer: streaming send and atomic-rename receive.

use anyhow::{anyhow, bail, Context, Result};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::protocol::{tag, MAX_FILE_SIZE};
use crate::wire::{self, FileInfo};

const COPY_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Streams `src` to the peer as a `File` message: framed metadata, then
/// exactly `fi.size` raw bytes, then the terminator. A source that comes up
/// short is an error; a source that has grown is truncated at `fi.size`.
pub fn send_file<W: Write>(w: &mut W, fi: &FileInfo, src: &Path) -> Result<()> {
    let mut file = File::open(src).with_context(|| format!("open {}", src.display()))?;

    wire::write_u32(w, tag::FILE)?;
    wire::send_file_info(w, fi)?;

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = fi.size as u64;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .with_context(|| format!("read {}", src.display()))?;
        if n == 0 {
            bail!(
                "{} ended {} bytes short of its announced size",
                src.display(),
                remaining
            );
        }
        w.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    wire::write_terminator(w)
}

/// Receives a `File` message into `dest`.
///
/// The body is spooled into a temp file in the system temp directory and
/// renamed over the target only after the terminator checks out, so a
/// partially transferred file never lands at the destination path. A
/// mid-stream failure leaves the temp file behind for inspection. The
/// sender's mod time is applied to the final file.
pub fn recv_file<R: Read>(
    r: &mut R,
    expected: &FileInfo,
    dest: &Path,
    overwrite: bool,
) -> Result<()> {
    if !overwrite && dest.exists() {
        bail!("{} already exists", dest.display());
    }

    let got = wire::read_u32(r)?;
    if got != tag::FILE {
        bail!("expected File, got message type {}", got);
    }
    let fi = wire::expect_file_info(r)?;
    if fi.path != expected.path {
        bail!("received {} while expecting {}", fi.path, expected.path);
    }
    if fi.size < 0 || fi.size > MAX_FILE_SIZE {
        bail!("refusing file of {} bytes", fi.size);
    }

    let (mut file, tmp_path) = tempfile::NamedTempFile::new()
        .context("create temp file")?
        .keep()
        .map_err(|e| anyhow!("keep temp file: {}", e))?;

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = fi.size as u64;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = r.read(&mut buf[..want])?;
        if n == 0 {
            bail!("connection closed {} bytes into file body", fi.size as u64 - remaining);
        }
        file.write_all(&buf[..n])
            .with_context(|| format!("write {}", tmp_path.display()))?;
        remaining -= n as u64;
    }
    wire::read_terminator(r)?;
    drop(file);

    fs::rename(&tmp_path, dest)
        .with_context(|| format!("rename {} over {}", tmp_path.display(), dest.display()))?;
    let mtime = FileTime::from_unix_time(
        fi.mod_time.timestamp(),
        fi.mod_time.timestamp_subsec_nanos(),
    );
    filetime::set_file_times(dest, mtime, mtime)
        .with_context(|| format!("set times on {}", dest.display()))?;
    Ok(())
}

/// Creates a directory with the given permission bits. Parents are expected
/// to exist already; the enumeration order guarantees that.
pub fn make_dir(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir(path).with_context(|| format!("mkdir {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Recursively removes a file or directory tree. A path that is already
/// gone counts as success: deletion requests arrive for every announced
/// entry of a tree, including children removed along with their parent.
pub fn remove_all(path: &Path) -> Result<()> {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    let result = if md.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}
