//! Wire format shared by the daemon and the agent.
//!
//! Every datagram is a netlink-style envelope: a 16-byte header in host byte
//! order followed by a NUL-terminated ASCII payload, padded to 4 bytes.
//!
//! ```text
//! 0       4     6      8      12     16
//! +-------+-----+------+------+------+----------------------+
//! |  len  |kind |flags | seq  | pid  | payload \0 (padding) |
//! +-------+-----+------+------+------+----------------------+
//! ```
//!
//! `len` covers the header, the payload and its NUL but not the padding.
//! There are no sequence numbers and no versioning: `seq` and `flags` are
//! always zero, and receivers dispatch on exact payload equality.

use std::fmt;

/// Protocol number both sides agree on out of band.
pub const PROTOCOL: u16 = 31;

/// Largest payload (excluding the terminating NUL) a frame may carry.
pub const MAX_PAYLOAD: usize = 1024;

/// Group that receives notifications while no listener is registered.
pub const BROADCAST_GROUP: u32 = 1;

/// Payload of the shutdown notification.
pub const SHUTDOWN: &str = "Shutdown";

/// Default handshake payload sent by the agent.
pub const HELLO: &str = "Hello from client!";

/// Size of the fixed envelope header.
pub const HEADER_LEN: usize = 16;

const ALIGN: usize = 4;

const fn align(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

/// A decoded (or to-be-encoded) frame borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    pub payload: &'a str,
}

impl<'a> Envelope<'a> {
    pub fn new(kind: u16, pid: u32, payload: &'a str) -> Self {
        Self {
            kind,
            flags: 0,
            seq: 0,
            pid,
            payload,
        }
    }
}

/// Frame validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    PayloadTooLarge { len: usize, max: usize },
    NotAscii,
    EmbeddedNul,
    Truncated { len: usize },
    BadLength { declared: usize, available: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds maximum of {max}")
            }
            Self::NotAscii => f.write_str("payload is not ASCII"),
            Self::EmbeddedNul => f.write_str("payload contains a NUL byte"),
            Self::Truncated { len } => {
                write!(f, "frame of {len} bytes is shorter than the {HEADER_LEN}-byte header")
            }
            Self::BadLength {
                declared,
                available,
            } => write!(
                f,
                "header declares {declared} bytes but {available} were received"
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Encoder/decoder bound to one protocol number and payload limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    protocol: u16,
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(PROTOCOL, MAX_PAYLOAD)
    }
}

impl FrameCodec {
    pub const fn new(protocol: u16, max_payload: usize) -> Self {
        Self {
            protocol,
            max_payload,
        }
    }

    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Bytes needed on the wire for a payload of `payload_len` bytes.
    pub const fn frame_len(payload_len: usize) -> usize {
        align(HEADER_LEN + payload_len + 1)
    }

    /// Receive buffer size that fits any frame this codec accepts.
    pub fn max_frame_len(&self) -> usize {
        Self::frame_len(self.max_payload)
    }

    /// Envelope of this codec's protocol carrying `payload`.
    pub fn envelope<'a>(&self, pid: u32, payload: &'a str) -> Envelope<'a> {
        Envelope::new(self.protocol, pid, payload)
    }

    /// Append the encoded frame to `out`.
    ///
    /// Does not allocate when `out` already has [`FrameCodec::frame_len`]
    /// bytes of spare capacity.
    pub fn encode_into(&self, env: &Envelope<'_>, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let payload = env.payload.as_bytes();
        if payload.len() > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }
        if !payload.is_ascii() {
            return Err(ProtocolError::NotAscii);
        }
        if payload.contains(&0) {
            return Err(ProtocolError::EmbeddedNul);
        }

        let len = HEADER_LEN + payload.len() + 1;
        out.extend_from_slice(&(len as u32).to_ne_bytes());
        out.extend_from_slice(&env.kind.to_ne_bytes());
        out.extend_from_slice(&env.flags.to_ne_bytes());
        out.extend_from_slice(&env.seq.to_ne_bytes());
        out.extend_from_slice(&env.pid.to_ne_bytes());
        out.extend_from_slice(payload);
        out.resize(out.len() + align(len) - len + 1, 0);
        Ok(())
    }

    pub fn encode(&self, env: &Envelope<'_>) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(Self::frame_len(env.payload.len()));
        self.encode_into(env, &mut out)?;
        Ok(out)
    }

    /// Decode one frame.
    ///
    /// The payload ends at the first NUL inside the declared length, so
    /// senders that declare a full fixed-size buffer are accepted too.
    pub fn decode<'b>(&self, buf: &'b [u8]) -> Result<Envelope<'b>, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated { len: buf.len() });
        }
        let declared = read_u32(buf, 0) as usize;
        if declared < HEADER_LEN || declared > buf.len() {
            return Err(ProtocolError::BadLength {
                declared,
                available: buf.len(),
            });
        }

        let body = &buf[HEADER_LEN..declared];
        let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let text = &body[..end];
        if !text.is_ascii() {
            return Err(ProtocolError::NotAscii);
        }
        let payload = std::str::from_utf8(text).map_err(|_| ProtocolError::NotAscii)?;

        Ok(Envelope {
            kind: read_u16(buf, 4),
            flags: read_u16(buf, 6),
            seq: read_u32(buf, 8),
            pid: read_u32(buf, 12),
            payload,
        })
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[at..at + 2]);
    u16::from_ne_bytes(b)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(b)
}
