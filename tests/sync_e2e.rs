//! End-to-end synchronization scenarios: an in-process server on an
//! ephemeral port, a client run against it, and assertions over both trees.

use std::collections::BTreeMap;
use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::thread;

use chrono::{FixedOffset, TimeZone};
use filetime::FileTime;
use tempfile::TempDir;

use zync::logger::Log;
use zync::wire::{self, FileInfo};
use zync::{client, server, KeepWhose, Options};

const BASE_TIME: i64 = 1_700_000_000;

fn start_server(root: &Path, opts: Options) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let root = root.to_path_buf();
    thread::spawn(move || {
        let _ = server::serve_on(listener, &root, &opts, Log::new(false));
    });
    port
}

fn run_client(root: &Path, port: u16, opts: &Options) {
    client::run(&format!("127.0.0.1:{}", port), root, opts, Log::new(false)).unwrap();
}

fn keep_opts(keep: KeepWhose, auto_delete: bool) -> Options {
    Options {
        keep: Some(keep),
        auto_delete,
        ..Options::default()
    }
}

fn write_file(dir: &Path, name: &str, content: &str, unix_secs: i64) {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    let ft = FileTime::from_unix_time(unix_secs, 0);
    filetime::set_file_times(&path, ft, ft).unwrap();
}

fn read(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name)).unwrap()
}

/// Path -> (content, mtime) for files, (None, None) for directories, whose
/// mtimes legitimately differ between the two sides.
fn snapshot(root: &Path) -> BTreeMap<String, (Option<Vec<u8>>, Option<FileTime>)> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(root).unwrap();
        if rel.as_os_str().is_empty() {
            continue;
        }
        let md = entry.metadata().unwrap();
        let value = if md.is_dir() {
            (None, None)
        } else {
            (
                Some(fs::read(entry.path()).unwrap()),
                Some(FileTime::from_last_modification_time(&md)),
            )
        };
        out.insert(rel.to_string_lossy().into_owned(), value);
    }
    out
}

// Client has a file the server lacks: it is offered and sent.
#[test]
fn test_new_client_file_reaches_server() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(client_dir.path(), "a.txt", "hello", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &Options::default());

    assert_eq!(read(server_dir.path(), "a.txt"), "hello");
    assert_eq!(read(client_dir.path(), "a.txt"), "hello");
}

// Server has a file the client lacks: it is requested and saved.
#[test]
fn test_missing_file_fetched_from_server() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "b.txt", "world", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &Options::default());

    assert_eq!(read(server_dir.path(), "b.txt"), "world");
    assert_eq!(read(client_dir.path(), "b.txt"), "world");
}

// Transferred files keep the sender's modification time, so a second run
// sees both sides in agreement.
#[test]
fn test_transfer_preserves_mod_time() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "kept.txt", "data", BASE_TIME - 9_000);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &Options::default());

    let server_md = fs::metadata(server_dir.path().join("kept.txt")).unwrap();
    let client_md = fs::metadata(client_dir.path().join("kept.txt")).unwrap();
    assert_eq!(
        FileTime::from_last_modification_time(&server_md),
        FileTime::from_last_modification_time(&client_md)
    );
}

// Default conflict resolution: the newer modification time wins.
#[test]
fn test_conflict_newer_client_version_wins() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "f.txt", "v2", BASE_TIME);
    write_file(client_dir.path(), "f.txt", "v1", BASE_TIME + 300);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &Options::default());

    assert_eq!(read(server_dir.path(), "f.txt"), "v1");
    assert_eq!(read(client_dir.path(), "f.txt"), "v1");
}

#[test]
fn test_conflict_newer_server_version_wins() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "f.txt", "v2", BASE_TIME + 300);
    write_file(client_dir.path(), "f.txt", "v1", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &Options::default());

    assert_eq!(read(server_dir.path(), "f.txt"), "v2");
    assert_eq!(read(client_dir.path(), "f.txt"), "v2");
}

// --keep mine sends the client's version even when it is older.
#[test]
fn test_keep_mine_overrides_mod_time() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "f.txt", "v2", BASE_TIME + 300);
    write_file(client_dir.path(), "f.txt", "v1", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &keep_opts(KeepWhose::Mine, false));

    assert_eq!(read(server_dir.path(), "f.txt"), "v1");
    assert_eq!(read(client_dir.path(), "f.txt"), "v1");
}

#[test]
fn test_keep_theirs_overrides_mod_time() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "f.txt", "v2", BASE_TIME);
    write_file(client_dir.path(), "f.txt", "v1", BASE_TIME + 300);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &keep_opts(KeepWhose::Theirs, false));

    assert_eq!(read(server_dir.path(), "f.txt"), "v2");
    assert_eq!(read(client_dir.path(), "f.txt"), "v2");
}

// --keep mine --delete removes server files the client does not have.
#[test]
fn test_keep_mine_delete_removes_server_file() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "only_server.txt", "x", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &keep_opts(KeepWhose::Mine, true));

    assert!(!server_dir.path().join("only_server.txt").exists());
    assert!(!client_dir.path().join("only_server.txt").exists());
}

// --keep theirs --delete removes client files the server does not have.
#[test]
fn test_keep_theirs_delete_removes_client_file() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(client_dir.path(), "only_client.txt", "x", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &keep_opts(KeepWhose::Theirs, true));

    assert!(!server_dir.path().join("only_client.txt").exists());
    assert!(!client_dir.path().join("only_client.txt").exists());
}

// A folder missing on the client is deleted from the server recursively;
// deletion requests for its already-gone children succeed as no-ops.
#[test]
fn test_folder_deleted_from_server_recursively() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    fs::create_dir_all(server_dir.path().join("dir1/dir2")).unwrap();
    write_file(&server_dir.path().join("dir1"), "f1", "1", BASE_TIME);
    write_file(&server_dir.path().join("dir1"), "f2", "2", BASE_TIME);
    write_file(&server_dir.path().join("dir1/dir2"), "f3", "3", BASE_TIME);
    write_file(&server_dir.path().join("dir1/dir2"), "f4", "4", BASE_TIME);
    write_file(server_dir.path(), "f6", "6", BASE_TIME);
    write_file(client_dir.path(), "f6", "6", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &keep_opts(KeepWhose::Mine, true));

    assert!(!server_dir.path().join("dir1").exists());
    assert_eq!(read(server_dir.path(), "f6"), "6");
    assert!(!client_dir.path().join("dir1").exists());
    assert_eq!(read(client_dir.path(), "f6"), "6");
}

#[test]
fn test_folder_deleted_from_client_recursively() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    fs::create_dir_all(client_dir.path().join("dir1/dir2")).unwrap();
    write_file(&client_dir.path().join("dir1"), "f1", "1", BASE_TIME);
    write_file(&client_dir.path().join("dir1/dir2"), "f3", "3", BASE_TIME);
    write_file(client_dir.path(), "f6", "6", BASE_TIME);
    write_file(server_dir.path(), "f6", "6", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &keep_opts(KeepWhose::Theirs, true));

    assert!(!client_dir.path().join("dir1").exists());
    assert_eq!(read(client_dir.path(), "f6"), "6");
    assert!(!server_dir.path().join("dir1").exists());
}

// A directory structure is reproduced on the side that lacks it.
#[test]
fn test_directories_are_replicated() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    fs::create_dir_all(client_dir.path().join("deep/nested")).unwrap();
    write_file(&client_dir.path().join("deep/nested"), "leaf.txt", "leaf", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &Options::default());

    assert!(server_dir.path().join("deep/nested").is_dir());
    assert_eq!(read(server_dir.path(), "deep/nested/leaf.txt"), "leaf");
}

// --restrict: deletions are refused but overwrites still land. The client
// treats the refusal as a warning and keeps going.
#[test]
fn test_restrict_refuses_delete_but_accepts_overwrite() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "TestFile1", "keep-me", BASE_TIME);
    write_file(server_dir.path(), "TestFile2", "old", BASE_TIME);
    write_file(client_dir.path(), "TestFile2", "new", BASE_TIME + 300);

    let opts = Options {
        restrict: true,
        ..Options::default()
    };
    let port = start_server(server_dir.path(), opts);
    run_client(client_dir.path(), port, &keep_opts(KeepWhose::Mine, true));

    assert_eq!(read(server_dir.path(), "TestFile1"), "keep-me");
    assert_eq!(read(server_dir.path(), "TestFile2"), "new");
    assert_eq!(read(client_dir.path(), "TestFile2"), "new");
}

// --Restrict: nothing on the server may be deleted or overwritten.
#[test]
fn test_restrict_all_refuses_delete_and_overwrite() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "TestFile1", "keep-me", BASE_TIME);
    write_file(server_dir.path(), "f", "old", BASE_TIME);
    write_file(client_dir.path(), "f", "new", BASE_TIME + 300);

    let opts = Options {
        restrict_all: true,
        ..Options::default()
    };
    let port = start_server(server_dir.path(), opts);
    run_client(client_dir.path(), port, &keep_opts(KeepWhose::Mine, true));

    assert_eq!(read(server_dir.path(), "TestFile1"), "keep-me");
    assert_eq!(read(server_dir.path(), "f"), "old");
    assert_eq!(read(client_dir.path(), "f"), "new");
}

// A second run between synchronized trees changes nothing on either side.
#[test]
fn test_second_run_is_idempotent() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    fs::create_dir_all(server_dir.path().join("shared")).unwrap();
    write_file(&server_dir.path().join("shared"), "s.txt", "from server", BASE_TIME);
    write_file(client_dir.path(), "c.txt", "from client", BASE_TIME + 60);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &Options::default());

    let server_before = snapshot(server_dir.path());
    let client_before = snapshot(client_dir.path());
    assert_eq!(server_before, client_before);

    run_client(client_dir.path(), port, &Options::default());
    assert_eq!(snapshot(server_dir.path()), server_before);
    assert_eq!(snapshot(client_dir.path()), client_before);
}

// Equal mod times with differing sizes cannot be resolved automatically;
// both sides are left alone.
#[test]
fn test_equal_mod_times_left_unresolved() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "f.txt", "server-version", BASE_TIME);
    write_file(client_dir.path(), "f.txt", "client", BASE_TIME);

    let port = start_server(server_dir.path(), Options::default());
    run_client(client_dir.path(), port, &Options::default());

    assert_eq!(read(server_dir.path(), "f.txt"), "server-version");
    assert_eq!(read(client_dir.path(), "f.txt"), "client");
}

///////////////////////
//  Raw protocol probes
///////////////////////

fn handshake(port: u16) -> TcpStream {
    let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    wire::send_version(&mut conn, 1).unwrap();
    assert!(wire::expect_bool(&mut conn).unwrap());
    conn
}

#[test]
fn test_version_mismatch_is_rejected() {
    let server_dir = TempDir::new().unwrap();
    let port = start_server(server_dir.path(), Options::default());

    let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    wire::send_version(&mut conn, 2).unwrap();
    assert!(!wire::expect_bool(&mut conn).unwrap());
}

// Deletion is only honored for the most recently announced path.
#[test]
fn test_deletion_of_unannounced_path_is_refused() {
    let server_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "target.txt", "precious", BASE_TIME);
    let port = start_server(server_dir.path(), Options::default());

    let mut conn = handshake(port);
    wire::send_file_deletion_request(&mut conn, "target.txt").unwrap();
    assert!(!wire::expect_bool(&mut conn).unwrap());
    assert_eq!(read(server_dir.path(), "target.txt"), "precious");
}

// A directory offer is materialized but answered false, since no body
// follows a folder.
#[test]
fn test_directory_offer_is_created_yet_declined() {
    let server_dir = TempDir::new().unwrap();
    let port = start_server(server_dir.path(), Options::default());

    let mut conn = handshake(port);
    let fi = FileInfo {
        path: "made-by-offer".to_string(),
        is_dir: true,
        mode: 0o755,
        mod_time: FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(BASE_TIME, 0)
            .unwrap(),
        size: 0,
    };
    wire::send_file_offer(&mut conn, &fi).unwrap();
    assert!(!wire::expect_bool(&mut conn).unwrap());
    assert!(server_dir.path().join("made-by-offer").is_dir());
}

// Requesting a path the server does not have is a policy refusal, not a
// session error: the same connection keeps working.
#[test]
fn test_missing_file_request_is_refused_not_fatal() {
    let server_dir = TempDir::new().unwrap();
    write_file(server_dir.path(), "real.txt", "here", BASE_TIME);
    let port = start_server(server_dir.path(), Options::default());

    let mut conn = handshake(port);
    wire::send_file_request(&mut conn, "no-such-file").unwrap();
    assert!(!wire::expect_bool(&mut conn).unwrap());

    wire::send_command(&mut conn, wire::Command::RequestNextFileInfo).unwrap();
    assert!(wire::expect_bool(&mut conn).unwrap());
    let fi = wire::expect_file_info(&mut conn).unwrap();
    assert_eq!(fi.path, ".");
    assert!(fi.is_dir);
}

// The server's enumeration arrives sorted, parents before children, and
// ends with a false once exhausted.
#[test]
fn test_server_enumeration_order_on_the_wire() {
    let server_dir = TempDir::new().unwrap();
    fs::create_dir(server_dir.path().join("sub")).unwrap();
    write_file(&server_dir.path().join("sub"), "inner.txt", "i", BASE_TIME);
    write_file(server_dir.path(), "top.txt", "t", BASE_TIME);
    let port = start_server(server_dir.path(), Options::default());

    let mut conn = handshake(port);
    let mut paths = Vec::new();
    loop {
        wire::send_command(&mut conn, wire::Command::RequestNextFileInfo).unwrap();
        if !wire::expect_bool(&mut conn).unwrap() {
            break;
        }
        paths.push(wire::expect_file_info(&mut conn).unwrap().path);
    }
    assert_eq!(paths, vec![".", "sub", "sub/inner.txt", "top.txt"]);
}
