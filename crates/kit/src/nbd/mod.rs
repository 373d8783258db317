//! Network Block Device client
//!
//! A minimal, strictly lock-step NBD client used to patch raw sectors of a
//! disk image exported by a `qemu-nbd` subprocess. Only the pieces needed
//! for sector editing are implemented: the old-style and (fixed) new-style
//! handshakes with an empty export name, and the READ, WRITE, FLUSH and
//! DISCONNECT commands.
//!
//! Reference: <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>

pub mod server;
pub mod session;
#[cfg(test)]
pub(crate) mod testutil;

pub use server::{NbdServer, NbdServerOpts};
pub use session::Session;

/// Literal prefix sent by every server at the start of the handshake.
pub const NBDMAGIC: &[u8; 8] = b"NBDMAGIC";
/// Old-style handshake magic.
pub const OLD_STYLE_MAGIC: u64 = 0x0042_0281_8612_53;
/// New-style handshake magic ("IHAVEOPT").
pub const IHAVEOPT: u64 = 0x4948_4156_454F_5054;

pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const REPLY_MAGIC: u32 = 0x6744_6698;

pub const NBD_OPT_EXPORT_NAME: u32 = 1;

/// Size of the zero padding that closes both handshake variants.
pub const HANDSHAKE_PADDING: usize = 124;

// Handshake flags (new-style, server side).
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
// Client flags.
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;

// Transmission flags.
pub const NBD_FLAG_HAS_FLAGS: u32 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u32 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u32 = 1 << 2;

/// Request types carried in the 32-bit type field of a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u32)]
pub enum Command {
    Read = 0,
    Write = 1,
    #[strum(serialize = "DISCONNECT")]
    Disc = 2,
    Flush = 3,
    // Part of the wire vocabulary; the disk editor never discards blocks.
    #[allow(dead_code)]
    Trim = 4,
}

/// Errors raised by an NBD [`Session`].
#[derive(Debug, thiserror::Error)]
pub enum NbdError {
    /// The server sent something that is not valid at this point of the protocol.
    #[error("NBD protocol error: {0}")]
    Protocol(String),
    /// The server answered a request with a non-zero error code.
    #[error("NBD server failed {command} request (handle {handle}): errno {errno}")]
    Server {
        command: Command,
        handle: u64,
        errno: u32,
    },
    /// Reading from or writing to the underlying stream failed.
    #[error("NBD transport error: {0}")]
    Transport(#[from] std::io::Error),
}

pub type Result<T, E = NbdError> = std::result::Result<T, E>;
