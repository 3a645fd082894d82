//! Server side: accept loop, handshake, and the per-session command loop.

use anyhow::{bail, Context, Result};
use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::mpsc::Receiver;

use crate::logger::Log;
use crate::protocol::PROTO_VERSION;
use crate::wire::{self, Command, FileInfo, Message};
use crate::{fs_enum, transfer, tune_socket, Options};

/// Binds the listen port and serves forever.
pub fn serve(root: &Path, opts: &Options, log: Log) -> Result<()> {
    log.info("Zync server starting...");
    let listener = TcpListener::bind(("0.0.0.0", opts.port))
        .with_context(|| format!("bind port {}", opts.port))?;
    log.info(&format!("Zync server started on port {}.", opts.port));
    serve_on(listener, root, opts, log)
}

/// Accept loop over an already-bound listener. Connections are handled one
/// at a time; a failed session is logged and the loop resumes accepting.
pub fn serve_on(listener: TcpListener, root: &Path, opts: &Options, log: Log) -> Result<()> {
    for conn in listener.incoming() {
        match conn {
            Ok(mut stream) => {
                tune_socket(&stream);
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                log.info(&format!("Client connected: {}", peer));
                if let Err(e) = handle_connection(&mut stream, root, opts, log) {
                    log.error(&format!("Disconnecting client abnormally: {:#}", e));
                }
                log.info("Client disconnected.");
            }
            Err(e) => log.error(&format!("accept failed: {}", e)),
        }
    }
    Ok(())
}

fn handle_connection(
    stream: &mut TcpStream,
    root: &Path,
    opts: &Options,
    log: Log,
) -> Result<()> {
    let version = wire::expect_version(stream)?;
    log.info(&format!("Client requested protocol version: {}", version));
    if version != PROTO_VERSION {
        // Exact match on version is required (currently).
        wire::send_bool(stream, false)?;
        return Ok(());
    }
    wire::send_bool(stream, true)?;

    let files = fs_enum::enumerate(root, log);
    // Deletions are only honored for the path announced most recently on
    // this session, so a client cannot delete entries it was never shown.
    let mut last_sent_path: Option<String> = None;

    loop {
        let msg = match wire::recv_opt(stream)? {
            Some(msg) => msg,
            None => return Ok(()), // client hung up cleanly
        };
        match msg {
            Message::Command(Command::RequestNextFileInfo) => {
                announce_next(stream, &files, &mut last_sent_path)?
            }
            Message::FileRequest(path) => serve_file(stream, root, &path, log)?,
            Message::FileOffer(fi) => accept_offer(stream, root, &fi, opts, log)?,
            Message::FileDeletionRequest(path) => {
                delete_requested(stream, root, &path, &last_sent_path, opts, log)?
            }
            other => bail!("unexpected message: {:?}", other),
        }
    }
}

fn announce_next(
    stream: &mut TcpStream,
    files: &Receiver<FileInfo>,
    last_sent_path: &mut Option<String>,
) -> Result<()> {
    match files.recv().ok() {
        Some(fi) => {
            wire::send_bool(stream, true)?;
            *last_sent_path = Some(fi.path.clone());
            wire::send_file_info(stream, &fi)
        }
        None => wire::send_bool(stream, false),
    }
}

fn serve_file(stream: &mut TcpStream, root: &Path, path: &str, log: Log) -> Result<()> {
    let abs = root.join(path);
    match fs::metadata(&abs) {
        Ok(md) => {
            let fi = fs_enum::file_info(path.to_string(), &md)?;
            log.verbose(&format!("Sending {} to client.", path));
            wire::send_bool(stream, true)?;
            transfer::send_file(stream, &fi, &abs)
        }
        Err(_) => {
            log.warn(&format!("Cannot provide {}, refusing.", path));
            wire::send_bool(stream, false)
        }
    }
}

fn accept_offer(
    stream: &mut TcpStream,
    root: &Path,
    fi: &FileInfo,
    opts: &Options,
    log: Log,
) -> Result<()> {
    let abs = root.join(&fi.path);
    if opts.restrict_all && abs.exists() {
        log.warn(&format!("Refusing offered {}: already present.", fi.path));
        return wire::send_bool(stream, false);
    }
    if fi.is_dir {
        // Folders carry no body. The directory is created here and the
        // offer is answered false so the client does not start a transfer.
        log.verbose(&format!("Creating folder {}", fi.path));
        transfer::make_dir(&abs, fi.mode)?;
        return wire::send_bool(stream, false);
    }
    log.verbose(&format!("Receiving {} from client.", fi.path));
    wire::send_bool(stream, true)?;
    transfer::recv_file(stream, fi, &abs, true)
}

fn delete_requested(
    stream: &mut TcpStream,
    root: &Path,
    path: &str,
    last_sent_path: &Option<String>,
    opts: &Options,
    log: Log,
) -> Result<()> {
    if opts.restrict || opts.restrict_all {
        log.warn(&format!("Refusing to delete {}: deletions are restricted.", path));
        return wire::send_bool(stream, false);
    }
    if last_sent_path.as_deref() != Some(path) {
        log.warn(&format!("Refusing to delete unannounced path {}.", path));
        return wire::send_bool(stream, false);
    }
    wire::send_bool(stream, true)?;
    log.verbose(&format!("Deleting {}", path));
    transfer::remove_all(&root.join(path))
}
