//! Client side: drives the merge-walk of the local tree against the
//! server's enumeration and resolves each difference.

use anyhow::{bail, Context, Result};
use chrono::SecondsFormat;
use std::io::{self, BufRead, Write};
use std::net::TcpStream;
use std::path::Path;

use crate::logger::Log;
use crate::protocol::PROTO_VERSION;
use crate::wire::{self, Command, FileInfo};
use crate::{fs_enum, transfer, tune_socket, url, KeepWhose, Options};

/// One step of the merge-walk over the two sorted sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkStep {
    /// Only the server has the current path.
    Missing,
    /// Only the client has the current path.
    New,
    /// Both sides have the current path.
    Both,
}

/// Connects, performs the version handshake, and synchronizes the tree
/// under `root` with the server.
///
/// Both enumerations are sorted, so a single joint pass visits every path
/// exactly once: the lesser head is consumed as one-sided (missing or new),
/// equal heads are resolved together.
pub fn run(uri: &str, root: &Path, opts: &Options, log: Log) -> Result<()> {
    let addr = url::resolve_addr(uri)?;

    log.info("Starting Zync client.");
    log.info(&format!("Working directory is {}.", root.display()));
    log.info(&format!("Connecting to Zync server at {}.", addr));
    let mut conn = TcpStream::connect(&addr).with_context(|| format!("connect {}", addr))?;
    tune_socket(&conn);

    wire::send_version(&mut conn, PROTO_VERSION)?;
    if !wire::expect_bool(&mut conn)? {
        bail!("server rejected protocol version {}", PROTO_VERSION);
    }

    let files = fs_enum::enumerate(root, log);
    let mut mine = files.recv().ok();
    let mut theirs = request_next_file_info(&mut conn)?;
    while let Some(step) = classify(mine.as_ref(), theirs.as_ref()) {
        match step {
            WalkStep::Missing => {
                if let Some(fi) = theirs {
                    handle_missing(&mut conn, root, &fi, opts, log)?;
                }
                theirs = request_next_file_info(&mut conn)?;
            }
            WalkStep::New => {
                if let Some(fi) = mine {
                    handle_new(&mut conn, root, &fi, opts, log)?;
                }
                mine = files.recv().ok();
            }
            WalkStep::Both => {
                if let (Some(m), Some(t)) = (mine, theirs) {
                    resolve(&mut conn, root, &m, &t, opts, log)?;
                }
                mine = files.recv().ok();
                theirs = request_next_file_info(&mut conn)?;
            }
        }
    }

    log.info("Complete, disconnecting.");
    Ok(())
}

fn classify(mine: Option<&FileInfo>, theirs: Option<&FileInfo>) -> Option<WalkStep> {
    match (mine, theirs) {
        (None, None) => None,
        (None, Some(_)) => Some(WalkStep::Missing),
        (Some(_), None) => Some(WalkStep::New),
        (Some(m), Some(t)) => Some(if t.path < m.path {
            WalkStep::Missing
        } else if t.path > m.path {
            WalkStep::New
        } else {
            WalkStep::Both
        }),
    }
}

fn handle_missing(
    conn: &mut TcpStream,
    root: &Path,
    theirs: &FileInfo,
    opts: &Options,
    log: Log,
) -> Result<()> {
    if opts.interactive {
        prompt_for_action(conn, root, Pending::Missing(theirs), opts, log)
    } else if opts.keep == Some(KeepWhose::Mine) && opts.auto_delete {
        request_deletion(conn, &theirs.path, log)
    } else {
        request_and_save(conn, root, theirs, false, log)
    }
}

fn handle_new(
    conn: &mut TcpStream,
    root: &Path,
    mine: &FileInfo,
    opts: &Options,
    log: Log,
) -> Result<()> {
    if opts.interactive {
        prompt_for_action(conn, root, Pending::New(mine), opts, log)
    } else if opts.keep == Some(KeepWhose::Theirs) && opts.auto_delete {
        delete_local(root, &mine.path, log)
    } else {
        offer_and_send(conn, root, mine, log)
    }
}

/// Same path on both sides: decide which version wins, if any.
fn resolve(
    conn: &mut TcpStream,
    root: &Path,
    mine: &FileInfo,
    theirs: &FileInfo,
    opts: &Options,
    log: Log,
) -> Result<()> {
    if mine.is_dir || theirs.is_dir {
        if mine.is_dir != theirs.is_dir {
            log.error(&format!("Tree conflict at {}", mine.path));
        }
        return Ok(());
    }

    log.verbose(&format!("Comparing {}", mine.path));
    if mine.size == theirs.size && mine.mod_time == theirs.mod_time {
        log.verbose("Files match, skipping.");
        return Ok(());
    }

    if opts.interactive {
        prompt_for_action(conn, root, Pending::Conflict { mine, theirs }, opts, log)
    } else if opts.keep == Some(KeepWhose::Mine)
        || (opts.keep.is_none() && mine.mod_time > theirs.mod_time)
    {
        log.verbose(&format!("Sending {} to server.", mine.path));
        offer_and_send(conn, root, mine, log)
    } else if opts.keep == Some(KeepWhose::Theirs)
        || (opts.keep.is_none() && theirs.mod_time > mine.mod_time)
    {
        log.verbose(&format!("Requesting {} from server.", theirs.path));
        request_and_save(conn, root, theirs, true, log)
    } else {
        // Sizes differ but mod times are identical.
        log.warn(&format!(
            "Failed to resolve {} automatically; mod times match.",
            mine.path
        ));
        Ok(())
    }
}

///////////////////////
//  Protocol primitives
///////////////////////

/// Asks the server for the next entry of its enumeration.
fn request_next_file_info(conn: &mut TcpStream) -> Result<Option<FileInfo>> {
    wire::send_command(conn, Command::RequestNextFileInfo)?;
    if wire::expect_bool(conn)? {
        Ok(Some(wire::expect_file_info(conn)?))
    } else {
        Ok(None)
    }
}

/// Fetches the server's version of a path. Folders are materialized
/// locally without any protocol traffic.
fn request_and_save(
    conn: &mut TcpStream,
    root: &Path,
    fi: &FileInfo,
    overwrite: bool,
    log: Log,
) -> Result<()> {
    let abs = root.join(&fi.path);
    if fi.is_dir {
        log.verbose(&format!("Creating folder {}", fi.path));
        return transfer::make_dir(&abs, fi.mode);
    }

    log.info(&format!("Requesting {} from server.", fi.path));
    wire::send_file_request(conn, &fi.path)?;
    if wire::expect_bool(conn)? {
        log.verbose(&format!("Receiving {} from server.", fi.path));
        transfer::recv_file(conn, fi, &abs, overwrite)
    } else {
        log.warn(&format!("Server refused to provide {}", fi.path));
        Ok(())
    }
}

/// Offers a file to the server and streams it if the server accepts.
fn offer_and_send(conn: &mut TcpStream, root: &Path, fi: &FileInfo, log: Log) -> Result<()> {
    log.verbose(&format!("Offering {} to server.", fi.path));
    wire::send_file_offer(conn, fi)?;
    if wire::expect_bool(conn)? {
        log.info(&format!("Sending {} to server.", fi.path));
        transfer::send_file(conn, fi, &root.join(&fi.path))
    } else {
        log.verbose(&format!("Server refused to accept {}", fi.path));
        Ok(())
    }
}

/// Asks the server to delete its version of a path. Refusal is a warning,
/// not an error.
fn request_deletion(conn: &mut TcpStream, path: &str, log: Log) -> Result<()> {
    log.verbose(&format!("Asking server to delete {}", path));
    wire::send_file_deletion_request(conn, path)?;
    if !wire::expect_bool(conn)? {
        log.warn(&format!("Server refused to delete {}", path));
    }
    Ok(())
}

fn delete_local(root: &Path, path: &str, log: Log) -> Result<()> {
    log.verbose(&format!("Deleting {}", path));
    transfer::remove_all(&root.join(path))
}

///////////////////////
//  Interactive mode
///////////////////////

enum Pending<'a> {
    Conflict {
        mine: &'a FileInfo,
        theirs: &'a FileInfo,
    },
    Missing(&'a FileInfo),
    New(&'a FileInfo),
}

/// Describes the difference and asks what to do with it. The default shown
/// (and taken on an empty line) is whatever the non-interactive rules would
/// have done.
fn prompt_for_action(
    conn: &mut TcpStream,
    root: &Path,
    pending: Pending,
    opts: &Options,
    log: Log,
) -> Result<()> {
    match pending {
        Pending::Conflict { mine, theirs } => {
            println!("CONFLICT: {}", mine.path);
            print_comparison(theirs, mine);
            let dflt = match opts.keep {
                Some(KeepWhose::Mine) => "give",
                Some(KeepWhose::Theirs) => "accept",
                None => "",
            };
            let action = request_user_input(
                "Action ([g]ive mine, [a]ccept theirs, [s]kip)",
                dflt,
                &["give", "accept", "skip"],
            )?;
            match action.as_str() {
                "give" => {
                    log.verbose(&format!("Sending {} to server.", mine.path));
                    offer_and_send(conn, root, mine, log)
                }
                "accept" => {
                    log.verbose(&format!("Requesting {} from server.", theirs.path));
                    request_and_save(conn, root, theirs, true, log)
                }
                _ => {
                    log.verbose(&format!("Skipping {}", mine.path));
                    Ok(())
                }
            }
        }
        Pending::Missing(theirs) => {
            println!("MISSING: {}", theirs.path);
            let dflt = if opts.keep == Some(KeepWhose::Mine) && opts.auto_delete {
                "delete"
            } else {
                "accept"
            };
            let action = request_user_input(
                "Action ([a]ccept theirs, [d]elete theirs, [s]kip)",
                dflt,
                &["accept", "delete", "skip"],
            )?;
            match action.as_str() {
                "accept" => {
                    log.verbose(&format!("Requesting {} from server.", theirs.path));
                    request_and_save(conn, root, theirs, true, log)
                }
                "delete" => request_deletion(conn, &theirs.path, log),
                _ => {
                    log.verbose(&format!("Skipping {}", theirs.path));
                    Ok(())
                }
            }
        }
        Pending::New(mine) => {
            println!("NEW: {}", mine.path);
            let dflt = if opts.keep == Some(KeepWhose::Theirs) && opts.auto_delete {
                "delete"
            } else {
                "give"
            };
            let action = request_user_input(
                "Action ([g]ive mine, [d]elete mine, [s]kip)",
                dflt,
                &["give", "delete", "skip"],
            )?;
            match action.as_str() {
                "give" => {
                    log.verbose(&format!("Sending {} to server.", mine.path));
                    offer_and_send(conn, root, mine, log)
                }
                "delete" => delete_local(root, &mine.path, log),
                _ => {
                    log.verbose(&format!("Skipping {}", mine.path));
                    Ok(())
                }
            }
        }
    }
}

fn print_comparison(theirs: &FileInfo, mine: &FileInfo) {
    let size_rel = |a: i64, b: i64| {
        if a > b {
            "bigger"
        } else if a < b {
            "smaller"
        } else {
            "same"
        }
    };
    let time_rel = |a: &FileInfo, b: &FileInfo| {
        if a.mod_time > b.mod_time {
            "newer"
        } else if a.mod_time < b.mod_time {
            "older"
        } else {
            "same"
        }
    };
    println!(
        "Server has: {} bytes ({}), {} ({})",
        theirs.size,
        size_rel(theirs.size, mine.size),
        theirs.mod_time.to_rfc3339_opts(SecondsFormat::Secs, false),
        time_rel(theirs, mine)
    );
    println!(
        "Client has: {} bytes ({}), {} ({})",
        mine.size,
        size_rel(mine.size, theirs.size),
        mine.mod_time.to_rfc3339_opts(SecondsFormat::Secs, false),
        time_rel(mine, theirs)
    );
}

/// Reads an answer from standard input. A full option name or its first
/// letter is accepted; an empty line takes the default when one exists.
fn request_user_input(prompt: &str, dflt: &str, options: &[&str]) -> Result<String> {
    let mut stdin = io::stdin().lock();
    loop {
        if dflt.is_empty() {
            print!("{}: ", prompt);
        } else {
            print!("{}: [{}] ", prompt, &dflt[..1]);
        }
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            bail!("end of input while waiting for an answer");
        }
        let line = line.trim();
        if line.is_empty() {
            if !dflt.is_empty() {
                return Ok(dflt.to_string());
            }
        } else {
            for opt in options {
                if line == *opt || line.chars().next() == opt.chars().next() {
                    return Ok((*opt).to_string());
                }
            }
        }
        println!("Invalid input: {}", line);
    }
}
