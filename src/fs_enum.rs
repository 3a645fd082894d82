//! Filesystem enumeration: a background walker feeding a bounded channel.

use anyhow::Result;
use chrono::{DateTime, Local};
use std::fs::Metadata;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use walkdir::WalkDir;

use crate::logger::Log;
use crate::wire::FileInfo;

/// Walks `root` in sorted pre-order, yielding one `FileInfo` per entry over
/// a bounded hand-off so the walk cannot run ahead of the consumer. The
/// root itself is yielded first as `"."`. Entries that cannot be read are
/// logged and skipped; the walk continues past them. The producer exits
/// when the walk finishes or the receiver is dropped.
pub fn enumerate(root: &Path, log: Log) -> Receiver<FileInfo> {
    let (tx, rx) = mpsc::sync_channel(1);
    let root = root.to_path_buf();
    thread::spawn(move || {
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log.warn(&format!("{}", e));
                    continue;
                }
            };
            let md = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log.warn(&format!("{}: {}", entry.path().display(), e));
                    continue;
                }
            };
            let rel = match entry.path().strip_prefix(&root) {
                Ok(r) => r,
                Err(e) => {
                    log.warn(&format!("{}: {}", entry.path().display(), e));
                    continue;
                }
            };
            let fi = match file_info(rel_path_string(rel), &md) {
                Ok(fi) => fi,
                Err(e) => {
                    log.warn(&format!("{}: {}", entry.path().display(), e));
                    continue;
                }
            };
            if tx.send(fi).is_err() {
                // Consumer is gone; the session ended.
                return;
            }
        }
    });
    rx
}

/// Builds the metadata record exchanged on the wire from a stat result.
pub fn file_info(path: String, md: &Metadata) -> Result<FileInfo> {
    let mod_time = DateTime::<Local>::from(md.modified()?).fixed_offset();
    Ok(FileInfo {
        path,
        is_dir: md.is_dir(),
        mode: mode_bits(md),
        mod_time,
        size: md.len() as i64,
    })
}

#[cfg(unix)]
fn mode_bits(md: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(md: &Metadata) -> u32 {
    if md.is_dir() {
        0o755
    } else {
        0o644
    }
}

// Root-relative, '/'-separated; the root itself becomes ".".
fn rel_path_string(rel: &Path) -> String {
    if rel.as_os_str().is_empty() {
        return ".".to_string();
    }
    let mut out = String::new();
    for component in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}
