//! Typed, terminator-framed message codec.
//!
//! Every value on the wire is self-delimiting: a big-endian u32 type tag,
//! the body, and the terminator sentinel. Composite messages additionally
//! frame each of their fields as a complete sub-message, which is redundant
//! but lets a receiver catch desynchronization inside a single message
//! instead of drifting silently.

use anyhow::{bail, Result};
use chrono::{DateTime, FixedOffset, TimeZone};
use std::io::{Read, Write};

use crate::protocol::{
    tag, MAX_FILENAME_LENGTH, MAX_TIME_LENGTH, TERMINATOR, TIME_ENC_VERSION,
};

/// Metadata record exchanged for every path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    /// Root-relative path, `/`-separated.
    pub path: String,
    pub is_dir: bool,
    /// POSIX permission bits; the directory bit is applied locally.
    pub mode: u32,
    pub mod_time: DateTime<FixedOffset>,
    /// Byte count; meaningless for directories.
    pub size: i64,
}

/// Commands a client can issue to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    RequestNextFileInfo,
}

impl Command {
    fn from_wire(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Command::RequestNextFileInfo),
            other => bail!("unrecognized command: {}", other),
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            Command::RequestNextFileInfo => 0,
        }
    }
}

/// The closed set of wire messages.
///
/// `File` bodies (tag 2) are deliberately absent: they carry a raw byte
/// stream that must be spooled to disk, so only `transfer::recv_file`
/// consumes them.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Bool(bool),
    Command(Command),
    FileInfo(FileInfo),
    FileOffer(FileInfo),
    FileRequest(String),
    FileDeletionRequest(String),
    I32(i32),
    I64(i64),
    String(String),
    Time(DateTime<FixedOffset>),
    U32(u32),
    Version(i32),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::Bool(_) => "Bool",
            Message::Command(_) => "Command",
            Message::FileInfo(_) => "FileInfo",
            Message::FileOffer(_) => "FileOffer",
            Message::FileRequest(_) => "FileRequest",
            Message::FileDeletionRequest(_) => "FileDeletionRequest",
            Message::I32(_) => "I32",
            Message::I64(_) => "I64",
            Message::String(_) => "String",
            Message::Time(_) => "Time",
            Message::U32(_) => "U32",
            Message::Version(_) => "Version",
        }
    }
}

/// Attempts to fill `buf` from the stream, looping over short reads.
pub fn recv_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut count = 0;
    while count < buf.len() {
        let n = r.read(&mut buf[count..])?;
        if n == 0 {
            bail!(
                "connection closed after {} of {} bytes",
                count,
                buf.len()
            );
        }
        count += n;
    }
    Ok(())
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    recv_fully(r, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    recv_fully(r, &mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    recv_fully(r, &mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

pub(crate) fn write_u32<W: Write>(w: &mut W, val: u32) -> Result<()> {
    w.write_all(&val.to_be_bytes())?;
    Ok(())
}

pub(crate) fn write_terminator<W: Write>(w: &mut W) -> Result<()> {
    write_u32(w, TERMINATOR)
}

pub(crate) fn read_terminator<R: Read>(r: &mut R) -> Result<()> {
    let got = read_u32(r)?;
    if got != TERMINATOR {
        bail!("bad message terminator: 0x{:08x}", got);
    }
    Ok(())
}

///////////////////////
//  Sending
///////////////////////

/// Encodes one message, dispatching on the variant.
pub fn send<W: Write>(w: &mut W, msg: &Message) -> Result<()> {
    match msg {
        Message::Bool(b) => send_bool(w, *b),
        Message::Command(c) => send_command(w, *c),
        Message::FileInfo(fi) => send_file_info(w, fi),
        Message::FileOffer(fi) => send_file_offer(w, fi),
        Message::FileRequest(path) => send_file_request(w, path),
        Message::FileDeletionRequest(path) => send_file_deletion_request(w, path),
        Message::I32(v) => send_i32(w, *v),
        Message::I64(v) => send_i64(w, *v),
        Message::String(s) => send_string(w, s),
        Message::Time(t) => send_time(w, t),
        Message::U32(v) => send_u32(w, *v),
        Message::Version(v) => send_version(w, *v),
    }
}

pub fn send_bool<W: Write>(w: &mut W, val: bool) -> Result<()> {
    write_u32(w, tag::BOOL)?;
    w.write_all(&[val as u8])?;
    write_terminator(w)
}

pub fn send_command<W: Write>(w: &mut W, cmd: Command) -> Result<()> {
    write_u32(w, tag::COMMAND)?;
    w.write_all(&cmd.to_wire().to_be_bytes())?;
    write_terminator(w)
}

pub fn send_i32<W: Write>(w: &mut W, val: i32) -> Result<()> {
    write_u32(w, tag::I32)?;
    w.write_all(&val.to_be_bytes())?;
    write_terminator(w)
}

pub fn send_i64<W: Write>(w: &mut W, val: i64) -> Result<()> {
    write_u32(w, tag::I64)?;
    w.write_all(&val.to_be_bytes())?;
    write_terminator(w)
}

pub fn send_u32<W: Write>(w: &mut W, val: u32) -> Result<()> {
    write_u32(w, tag::U32)?;
    w.write_all(&val.to_be_bytes())?;
    write_terminator(w)
}

pub fn send_version<W: Write>(w: &mut W, val: i32) -> Result<()> {
    write_u32(w, tag::VERSION)?;
    w.write_all(&val.to_be_bytes())?;
    write_terminator(w)
}

/// A string is an i32 byte length followed by that many UTF-8 bytes.
pub fn send_string<W: Write>(w: &mut W, val: &str) -> Result<()> {
    if val.len() > MAX_FILENAME_LENGTH {
        bail!(
            "string length {} exceeds max of {}",
            val.len(),
            MAX_FILENAME_LENGTH
        );
    }
    write_u32(w, tag::STRING)?;
    w.write_all(&(val.len() as i32).to_be_bytes())?;
    w.write_all(val.as_bytes())?;
    write_terminator(w)
}

/// Timestamps travel as a length-prefixed blob: version byte, i64 seconds
/// since the epoch, i32 nanoseconds, i16 minutes east of UTC. 15 bytes.
pub fn send_time<W: Write>(w: &mut W, val: &DateTime<FixedOffset>) -> Result<()> {
    write_u32(w, tag::TIME)?;
    let mut blob = Vec::with_capacity(15);
    blob.push(TIME_ENC_VERSION);
    blob.extend_from_slice(&val.timestamp().to_be_bytes());
    blob.extend_from_slice(&(val.timestamp_subsec_nanos() as i32).to_be_bytes());
    let tz_minutes = (val.offset().local_minus_utc() / 60) as i16;
    blob.extend_from_slice(&tz_minutes.to_be_bytes());
    w.write_all(&(blob.len() as i32).to_be_bytes())?;
    w.write_all(&blob)?;
    write_terminator(w)
}

pub fn send_file_info<W: Write>(w: &mut W, fi: &FileInfo) -> Result<()> {
    write_u32(w, tag::FILE_INFO)?;
    write_file_info_fields(w, fi)?;
    write_terminator(w)
}

pub fn send_file_offer<W: Write>(w: &mut W, fi: &FileInfo) -> Result<()> {
    write_u32(w, tag::FILE_OFFER)?;
    send_file_info(w, fi)?;
    write_terminator(w)
}

pub fn send_file_request<W: Write>(w: &mut W, path: &str) -> Result<()> {
    write_u32(w, tag::FILE_REQUEST)?;
    send_string(w, path)?;
    write_terminator(w)
}

pub fn send_file_deletion_request<W: Write>(w: &mut W, path: &str) -> Result<()> {
    write_u32(w, tag::FILE_DELETION_REQUEST)?;
    send_string(w, path)?;
    write_terminator(w)
}

// Each field is itself a fully framed sub-message.
pub(crate) fn write_file_info_fields<W: Write>(w: &mut W, fi: &FileInfo) -> Result<()> {
    send_string(w, &fi.path)?;
    send_bool(w, fi.is_dir)?;
    send_u32(w, fi.mode)?;
    send_time(w, &fi.mod_time)?;
    send_i64(w, fi.size)
}

///////////////////////
//  Receiving
///////////////////////

/// Reads one complete message: tag, body, terminator.
pub fn recv<R: Read>(r: &mut R) -> Result<Message> {
    let tag = read_u32(r)?;
    recv_body(r, tag)
}

/// Like `recv`, but a clean end-of-stream before the first tag byte yields
/// `None`. Used by the server's command loop, where the client simply
/// closing the connection is a normal way to end the session.
pub fn recv_opt<R: Read>(r: &mut R) -> Result<Option<Message>> {
    let mut first = [0u8; 1];
    loop {
        match r.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let mut rest = [0u8; 3];
    recv_fully(r, &mut rest)?;
    let tag = u32::from_be_bytes([first[0], rest[0], rest[1], rest[2]]);
    recv_body(r, tag).map(Some)
}

fn recv_body<R: Read>(r: &mut R, tag_val: u32) -> Result<Message> {
    let msg = match tag_val {
        tag::BOOL => Message::Bool(read_bool_body(r)?),
        tag::COMMAND => Message::Command(Command::from_wire(read_i32(r)?)?),
        tag::FILE => bail!("file bodies must be received through recv_file"),
        tag::FILE_INFO => Message::FileInfo(read_file_info_fields(r)?),
        tag::FILE_OFFER => Message::FileOffer(expect_file_info(r)?),
        tag::FILE_REQUEST => Message::FileRequest(expect_string(r)?),
        tag::FILE_DELETION_REQUEST => Message::FileDeletionRequest(expect_string(r)?),
        tag::I32 => Message::I32(read_i32(r)?),
        tag::I64 => Message::I64(read_i64(r)?),
        tag::STRING => Message::String(read_string_body(r)?),
        tag::TIME => Message::Time(read_time_body(r)?),
        tag::U32 => Message::U32(read_u32(r)?),
        tag::VERSION => Message::Version(read_i32(r)?),
        other => bail!("unknown message type: {}", other),
    };
    read_terminator(r)?;
    Ok(msg)
}

fn read_bool_body<R: Read>(r: &mut R) -> Result<bool> {
    let mut buf = [0u8; 1];
    recv_fully(r, &mut buf)?;
    Ok(buf[0] != 0)
}

fn read_string_body<R: Read>(r: &mut R) -> Result<String> {
    let len = read_i32(r)?;
    if len < 0 || len as usize > MAX_FILENAME_LENGTH {
        bail!(
            "string length {} exceeds max of {}",
            len,
            MAX_FILENAME_LENGTH
        );
    }
    let mut buf = vec![0u8; len as usize];
    recv_fully(r, &mut buf)?;
    String::from_utf8(buf).map_err(|e| anyhow::anyhow!("string is not UTF-8: {}", e))
}

fn read_time_body<R: Read>(r: &mut R) -> Result<DateTime<FixedOffset>> {
    let len = read_i32(r)?;
    if len < 0 || len as usize > MAX_TIME_LENGTH {
        bail!("time length {} exceeds max of {}", len, MAX_TIME_LENGTH);
    }
    let mut blob = vec![0u8; len as usize];
    recv_fully(r, &mut blob)?;
    if blob.len() != 15 || blob[0] != TIME_ENC_VERSION {
        bail!("unsupported time encoding");
    }
    let secs = i64::from_be_bytes(blob[1..9].try_into().unwrap());
    let nanos = i32::from_be_bytes(blob[9..13].try_into().unwrap());
    let tz_minutes = i16::from_be_bytes(blob[13..15].try_into().unwrap());
    if nanos < 0 {
        bail!("negative nanoseconds in timestamp");
    }
    let offset = FixedOffset::east_opt(tz_minutes as i32 * 60)
        .ok_or_else(|| anyhow::anyhow!("invalid timezone offset: {} minutes", tz_minutes))?;
    offset
        .timestamp_opt(secs, nanos as u32)
        .single()
        .ok_or_else(|| anyhow::anyhow!("invalid timestamp: {}s {}ns", secs, nanos))
}

fn read_file_info_fields<R: Read>(r: &mut R) -> Result<FileInfo> {
    let path = expect_string(r)?;
    let is_dir = expect_bool(r)?;
    let mode = expect_u32(r)?;
    let mod_time = expect_time(r)?;
    let size = expect_i64(r)?;
    Ok(FileInfo {
        path,
        is_dir,
        mode,
        mod_time,
        size,
    })
}

///////////////////////
//  Typed expectations
///////////////////////

pub fn expect_bool<R: Read>(r: &mut R) -> Result<bool> {
    match recv(r)? {
        Message::Bool(b) => Ok(b),
        m => bail!("expected Bool, got {}", m.kind()),
    }
}

pub fn expect_command<R: Read>(r: &mut R) -> Result<Command> {
    match recv(r)? {
        Message::Command(c) => Ok(c),
        m => bail!("expected Command, got {}", m.kind()),
    }
}

pub fn expect_version<R: Read>(r: &mut R) -> Result<i32> {
    match recv(r)? {
        Message::Version(v) => Ok(v),
        m => bail!("expected Version, got {}", m.kind()),
    }
}

pub fn expect_string<R: Read>(r: &mut R) -> Result<String> {
    match recv(r)? {
        Message::String(s) => Ok(s),
        m => bail!("expected String, got {}", m.kind()),
    }
}

pub fn expect_u32<R: Read>(r: &mut R) -> Result<u32> {
    match recv(r)? {
        Message::U32(v) => Ok(v),
        m => bail!("expected U32, got {}", m.kind()),
    }
}

pub fn expect_i64<R: Read>(r: &mut R) -> Result<i64> {
    match recv(r)? {
        Message::I64(v) => Ok(v),
        m => bail!("expected I64, got {}", m.kind()),
    }
}

pub fn expect_time<R: Read>(r: &mut R) -> Result<DateTime<FixedOffset>> {
    match recv(r)? {
        Message::Time(t) => Ok(t),
        m => bail!("expected Time, got {}", m.kind()),
    }
}

pub fn expect_file_info<R: Read>(r: &mut R) -> Result<FileInfo> {
    match recv(r)? {
        Message::FileInfo(fi) => Ok(fi),
        m => bail!("expected FileInfo, got {}", m.kind()),
    }
}
