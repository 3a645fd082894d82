//! Shared constants for the Zync framed wire protocol

/// Current protocol version. Exact match is required during the handshake.
pub const PROTO_VERSION: i32 = 1;

/// Sentinel closing every message and every nested sub-message.
pub const TERMINATOR: u32 = 0x0000_5105;

/// Default TCP port (the terminator sentinel, in decimal).
pub const DEFAULT_PORT: u16 = 20741;

// Limit on encoded path length, to avoid allocating absurd buffer space.
pub const MAX_FILENAME_LENGTH: usize = 1024;

// Limit on the encoded timestamp blob.
pub const MAX_TIME_LENGTH: usize = 16;

/// Largest file body accepted by the receive path (32 GiB).
pub const MAX_FILE_SIZE: i64 = 32 * 1024 * 1024 * 1024;

/// Version byte leading the binary timestamp encoding.
pub const TIME_ENC_VERSION: u8 = 0x01;

// Message type tags (keep numeric values stable for wire compat).
pub mod tag {
    pub const BOOL: u32 = 0;
    pub const COMMAND: u32 = 1;
    pub const FILE: u32 = 2;
    pub const FILE_INFO: u32 = 3;
    pub const FILE_OFFER: u32 = 4;
    pub const FILE_REQUEST: u32 = 5;
    pub const FILE_DELETION_REQUEST: u32 = 6;
    pub const I32: u32 = 7;
    pub const I64: u32 = 8;
    pub const STRING: u32 = 9;
    pub const TIME: u32 = 10;
    pub const U32: u32 = 11;
    pub const VERSION: u32 = 12;
}
