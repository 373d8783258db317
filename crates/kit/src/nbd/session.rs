//! One lock-step NBD connection.

use std::io::{Read, Write};

use byteorder::{BigEndian as BE, ReadBytesExt, WriteBytesExt};
use tracing::{debug, trace};

use super::{
    Command, NbdError, Result, HANDSHAKE_PADDING, IHAVEOPT, NBDMAGIC, NBD_FLAG_C_FIXED_NEWSTYLE,
    NBD_FLAG_FIXED_NEWSTYLE, NBD_FLAG_HAS_FLAGS, NBD_FLAG_READ_ONLY, NBD_FLAG_SEND_FLUSH,
    NBD_OPT_EXPORT_NAME, OLD_STYLE_MAGIC, REPLY_MAGIC, REQUEST_MAGIC,
};

const REQUEST_LEN: usize = 28;

/// A negotiated NBD connection over a duplex byte stream.
///
/// Exactly one request is in flight at a time: every call writes a request
/// frame and blocks until its reply has been consumed. The session is not
/// meant to be shared; operations take `&mut self`.
#[derive(Debug)]
pub struct Session<S> {
    stream: S,
    handle: u64,
    size: u64,
    flags: u32,
}

impl<S: Read + Write> Session<S> {
    /// Perform the handshake on a freshly connected stream.
    ///
    /// Both the old-style and the new-style handshake are accepted. For the
    /// new style, the default (empty) export is selected with
    /// `NBD_OPT_EXPORT_NAME`, and the handshake flags are folded into the
    /// high 16 bits of [`Session::flags`].
    pub fn connect(mut stream: S) -> Result<Self> {
        let mut magic = [0u8; 8];
        stream.read_exact(&mut magic)?;
        if &magic != NBDMAGIC {
            return Err(NbdError::Protocol(format!(
                "expected NBDMAGIC greeting, got {magic:02x?}"
            )));
        }

        let (size, flags) = match stream.read_u64::<BE>()? {
            OLD_STYLE_MAGIC => {
                let size = stream.read_u64::<BE>()?;
                let flags = stream.read_u32::<BE>()?;
                debug!("Old-style NBD handshake: size={size} flags={flags:#x}");
                (size, flags)
            }
            IHAVEOPT => {
                let handshake_flags = stream.read_u16::<BE>()?;
                let client_flags = if handshake_flags & NBD_FLAG_FIXED_NEWSTYLE != 0 {
                    NBD_FLAG_C_FIXED_NEWSTYLE
                } else {
                    0
                };

                let mut negotiation = Vec::with_capacity(20);
                negotiation.write_u32::<BE>(client_flags)?;
                negotiation.write_u64::<BE>(IHAVEOPT)?;
                negotiation.write_u32::<BE>(NBD_OPT_EXPORT_NAME)?;
                // Empty export name
                negotiation.write_u32::<BE>(0)?;
                stream.write_all(&negotiation)?;
                stream.flush()?;

                let size = stream.read_u64::<BE>()?;
                let transmission_flags = stream.read_u16::<BE>()?;
                debug!(
                    "New-style NBD handshake: size={size} handshake_flags={handshake_flags:#x} \
                     transmission_flags={transmission_flags:#x}"
                );
                (
                    size,
                    (u32::from(handshake_flags) << 16) | u32::from(transmission_flags),
                )
            }
            other => {
                return Err(NbdError::Protocol(format!(
                    "unknown handshake magic {other:#018x}"
                )))
            }
        };

        let mut padding = [0u8; HANDSHAKE_PADDING];
        stream.read_exact(&mut padding)?;

        Ok(Self {
            stream,
            handle: 1,
            size,
            flags,
        })
    }

    /// Size of the export in bytes, as announced by the server.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Negotiated flags: transmission flags in the low 16 bits, new-style
    /// handshake flags (if any) in the high 16 bits.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn supports_flush(&self) -> bool {
        let wanted = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;
        self.flags & wanted == wanted
    }

    /// Whether the server exports the image read-only.
    pub fn is_read_only(&self) -> bool {
        let wanted = NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY;
        self.flags & wanted == wanted
    }

    /// Read exactly `len` bytes starting at byte `offset` of the export.
    pub fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let handle = self.send(Command::Read, offset, len, &[])?;
        self.receive(Command::Read, handle)?;
        let mut buf = vec![0u8; len as usize];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write `data` starting at byte `offset` of the export.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| {
            NbdError::Protocol(format!(
                "write of {} bytes does not fit a request frame",
                data.len()
            ))
        })?;
        let handle = self.send(Command::Write, offset, len, data)?;
        self.receive(Command::Write, handle)
    }

    /// Ask the server to persist outstanding writes.
    ///
    /// Succeeds without talking to the server unless it advertised flush
    /// support during the handshake.
    pub fn flush(&mut self) -> Result<()> {
        if !self.supports_flush() {
            trace!("Server does not support flush (flags {:#x})", self.flags);
            return Ok(());
        }
        let handle = self.send(Command::Flush, 0, 0, &[])?;
        self.receive(Command::Flush, handle)
    }

    /// Tell the server we are done and close the stream.
    ///
    /// Servers do not reply to DISCONNECT, so nothing is read back.
    pub fn disconnect(mut self) -> Result<()> {
        self.send(Command::Disc, 0, 0, &[])?;
        debug!("Sent NBD disconnect after {} requests", self.handle - 1);
        Ok(())
    }

    fn send(&mut self, command: Command, offset: u64, len: u32, payload: &[u8]) -> Result<u64> {
        let handle = self.handle;
        self.handle = self.handle.wrapping_add(1);
        trace!("NBD {command} handle={handle} from={offset} len={len}");

        let mut frame = Vec::with_capacity(REQUEST_LEN + payload.len());
        frame.write_u32::<BE>(REQUEST_MAGIC)?;
        frame.write_u32::<BE>(command as u32)?;
        frame.write_u64::<BE>(handle)?;
        frame.write_u64::<BE>(offset)?;
        frame.write_u32::<BE>(len)?;
        frame.extend_from_slice(payload);

        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(handle)
    }

    fn receive(&mut self, command: Command, expected: u64) -> Result<()> {
        let magic = self.stream.read_u32::<BE>()?;
        if magic != REPLY_MAGIC {
            return Err(NbdError::Protocol(format!(
                "bad reply magic {magic:#010x} for {command} request"
            )));
        }
        let errno = self.stream.read_u32::<BE>()?;
        let handle = self.stream.read_u64::<BE>()?;
        if handle != expected {
            return Err(NbdError::Protocol(format!(
                "reply handle {handle} does not match outstanding {command} request {expected}"
            )));
        }
        if errno != 0 {
            return Err(NbdError::Server {
                command,
                handle,
                errno,
            });
        }
        Ok(())
    }
}
