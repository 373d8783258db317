//! In-process NBD server serving a `Vec<u8>`, for tests.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread::JoinHandle;

use byteorder::{BigEndian as BE, ReadBytesExt, WriteBytesExt};

use super::{
    HANDSHAKE_PADDING, IHAVEOPT, NBDMAGIC, NBD_FLAG_FIXED_NEWSTYLE, NBD_FLAG_HAS_FLAGS,
    NBD_FLAG_SEND_FLUSH, OLD_STYLE_MAGIC, REPLY_MAGIC, REQUEST_MAGIC,
};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Handshake {
    OldStyle,
    NewStyle,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FakeServerOpts {
    pub handshake: Handshake,
    pub transmission_flags: u16,
    /// Answer every request with this reply magic instead of the real one.
    pub reply_magic: u32,
    /// Added to the request handle when replying.
    pub handle_skew: u64,
}

impl Default for FakeServerOpts {
    fn default() -> Self {
        Self {
            handshake: Handshake::NewStyle,
            transmission_flags: (NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH) as u16,
            reply_magic: REPLY_MAGIC,
            handle_skew: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Request {
    pub kind: u32,
    pub handle: u64,
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug)]
pub(crate) struct ServerLog {
    pub disk: Vec<u8>,
    /// Bytes the client sent during new-style option negotiation.
    pub negotiation: Vec<u8>,
    pub requests: Vec<Request>,
}

/// Start a server thread on one end of a socket pair and return the other end.
pub(crate) fn spawn(
    disk: Vec<u8>,
    opts: FakeServerOpts,
) -> (UnixStream, JoinHandle<io::Result<ServerLog>>) {
    let (client, server) = UnixStream::pair().expect("socketpair");
    let handle = std::thread::spawn(move || serve(server, disk, opts));
    (client, handle)
}

fn serve(mut s: UnixStream, mut disk: Vec<u8>, opts: FakeServerOpts) -> io::Result<ServerLog> {
    let mut log = ServerLog {
        disk: Vec::new(),
        negotiation: Vec::new(),
        requests: Vec::new(),
    };

    s.write_all(NBDMAGIC)?;
    match opts.handshake {
        Handshake::OldStyle => {
            s.write_u64::<BE>(OLD_STYLE_MAGIC)?;
            s.write_u64::<BE>(disk.len() as u64)?;
            s.write_u32::<BE>(u32::from(opts.transmission_flags))?;
        }
        Handshake::NewStyle => {
            s.write_u64::<BE>(IHAVEOPT)?;
            s.write_u16::<BE>(NBD_FLAG_FIXED_NEWSTYLE)?;
            let mut negotiation = [0u8; 20];
            s.read_exact(&mut negotiation)?;
            log.negotiation = negotiation.to_vec();
            s.write_u64::<BE>(disk.len() as u64)?;
            s.write_u16::<BE>(opts.transmission_flags)?;
        }
    }
    s.write_all(&[0u8; HANDSHAKE_PADDING])?;

    loop {
        let magic = match s.read_u32::<BE>() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        assert_eq!(magic, REQUEST_MAGIC, "client sent bad request magic");
        let req = Request {
            kind: s.read_u32::<BE>()?,
            handle: s.read_u64::<BE>()?,
            offset: s.read_u64::<BE>()?,
            len: s.read_u32::<BE>()?,
        };
        log.requests.push(req.clone());

        let start = req.offset as usize;
        let end = start + req.len as usize;
        let in_range = end <= disk.len();
        let reply = |s: &mut UnixStream, errno: u32| -> io::Result<()> {
            s.write_u32::<BE>(opts.reply_magic)?;
            s.write_u32::<BE>(errno)?;
            s.write_u64::<BE>(req.handle.wrapping_add(opts.handle_skew))
        };

        match req.kind {
            0 if in_range => {
                reply(&mut s, 0)?;
                s.write_all(&disk[start..end])?;
            }
            1 => {
                let mut payload = vec![0u8; req.len as usize];
                s.read_exact(&mut payload)?;
                if in_range {
                    disk[start..end].copy_from_slice(&payload);
                    reply(&mut s, 0)?;
                } else {
                    reply(&mut s, 28)?;
                }
            }
            2 => break,
            3 => reply(&mut s, 0)?,
            // EINVAL for out-of-range reads and anything unsupported
            _ => reply(&mut s, 22)?,
        }
    }

    log.disk = disk;
    Ok(log)
}
