//! DCCP header record and byte codec.
//!
//! Pure data transformation, no I/O.  Addressing lives in the multiplexer
//! frame around this header, so the codec carries only the protocol fields:
//!
//! ```text
//!  0        type(4) | x(1) | reserved(3)
//!  1        ccval(4) | cscov(4)
//!  2-3      checksum (ones'-complement over the whole packet)
//!  4        data offset, in 32-bit words (header + options)
//!  5        reserved
//!  ...      seqno   — 6 bytes when x=1, 3 bytes when x=0, big-endian
//!  ...      ackno   — 6 or 3 bytes; absent on Request and Data
//!  ...      service code (Request/Response) or reset code+data (Reset)
//!  ...      options, padded with Padding to a 32-bit boundary
//!  ...      payload
//! ```

use crate::error::{Error, Result};
use crate::options::{self, Opt};

/// Largest representable sequence number (48 bits).
pub const MAX_SEQNO: i64 = (1 << 48) - 1;

/// Reset codes (RFC 4340 §5.6, the subset the engine emits).
pub const RESET_CLOSED: u8 = 1;
pub const RESET_ABORTED: u8 = 2;
pub const RESET_NO_CONNECTION: u8 = 3;
pub const RESET_SEQUENCE: u8 = 5;

// ---------------------------------------------------------------------------
// Packet types
// ---------------------------------------------------------------------------

/// The ten DCCP packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 1,
    Data = 2,
    Ack = 3,
    DataAck = 4,
    CloseReq = 5,
    Close = 6,
    Reset = 7,
    Sync = 8,
    SyncAck = 9,
}

impl PacketType {
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Request,
            1 => Self::Response,
            2 => Self::Data,
            3 => Self::Ack,
            4 => Self::DataAck,
            5 => Self::CloseReq,
            6 => Self::Close,
            7 => Self::Reset,
            8 => Self::Sync,
            9 => Self::SyncAck,
            _ => return None,
        })
    }

    /// Every type except Request and Data carries an acknowledgement number.
    pub fn has_ackno(self) -> bool {
        !matches!(self, Self::Request | Self::Data)
    }

    /// Types whose payload is application data.
    pub fn carries_data(self) -> bool {
        matches!(self, Self::Data | Self::DataAck)
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// One DCCP packet, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub ptype: PacketType,
    /// Extended (48-bit) sequence numbers.
    pub x: bool,
    pub seqno: i64,
    /// Meaningful only when `ptype.has_ackno()`.
    pub ackno: i64,
    /// Request and Response only.
    pub service_code: u32,
    /// Reset only.
    pub reset_code: u8,
    pub ccval: u8,
    pub cscov: u8,
    pub options: Vec<Opt>,
    pub payload: Vec<u8>,
}

impl Header {
    /// Header skeleton of the given type; sequence fields are filled in by
    /// the write pipeline at send time.
    pub fn of_type(ptype: PacketType) -> Self {
        Self {
            ptype,
            x: true,
            seqno: 0,
            ackno: 0,
            service_code: 0,
            reset_code: 0,
            ccval: 0,
            cscov: 0,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Encode
    // -----------------------------------------------------------------------

    /// Serialise into a wire packet.  Options that are reserved fail the
    /// encode; options invalid for this packet type are silently omitted.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let seq_len = if self.x { 6 } else { 3 };
        let ack_len = if self.ptype.has_ackno() { seq_len } else { 0 };
        let extra = match self.ptype {
            PacketType::Request | PacketType::Response | PacketType::Reset => 4,
            _ => 0,
        };

        let mut opt_bytes = Vec::new();
        for o in &self.options {
            if options::is_reserved(o.kind) {
                return Err(Error::Malformed);
            }
            if !options::is_valid_for_packet(o.kind, self.ptype) {
                log::debug!("[header] omitting option {} from {} packet", o.kind, self.ptype);
                continue;
            }
            if o.mandatory {
                opt_bytes.push(options::OPT_MANDATORY);
            }
            if options::is_single_byte(o.kind) {
                opt_bytes.push(o.kind);
            } else {
                let len = 2 + o.data.len();
                if len > u8::MAX as usize {
                    return Err(Error::Oversize);
                }
                opt_bytes.push(o.kind);
                opt_bytes.push(len as u8);
                opt_bytes.extend_from_slice(&o.data);
            }
        }
        while (6 + seq_len + ack_len + extra + opt_bytes.len()) % 4 != 0 {
            opt_bytes.push(options::OPT_PADDING);
        }

        let header_len = 6 + seq_len + ack_len + extra + opt_bytes.len();
        let data_off = header_len / 4;
        if data_off > u8::MAX as usize {
            return Err(Error::Oversize);
        }

        let mut p = Vec::with_capacity(header_len + self.payload.len());
        p.push(((self.ptype as u8) << 4) | (u8::from(self.x) << 3));
        p.push(((self.ccval & 0x0f) << 4) | (self.cscov & 0x0f));
        p.extend_from_slice(&[0, 0]); // checksum, filled in below
        p.push(data_off as u8);
        p.push(0);
        put_seq(&mut p, self.seqno, self.x);
        if self.ptype.has_ackno() {
            put_seq(&mut p, self.ackno, self.x);
        }
        match self.ptype {
            PacketType::Request | PacketType::Response => {
                p.extend_from_slice(&self.service_code.to_be_bytes());
            }
            PacketType::Reset => {
                p.push(self.reset_code);
                p.extend_from_slice(&[0, 0, 0]);
            }
            _ => {}
        }
        p.extend_from_slice(&opt_bytes);
        p.extend_from_slice(&self.payload);

        let sum = internet_checksum(&p);
        p[2..4].copy_from_slice(&sum.to_be_bytes());
        Ok(p)
    }

    // -----------------------------------------------------------------------
    // Decode
    // -----------------------------------------------------------------------

    /// Parse a wire packet.  Any framing or checksum inconsistency, or a
    /// reserved option on the wire, is `Malformed` — callers drop such
    /// packets silently.
    pub fn decode(p: &[u8]) -> Result<Self> {
        if p.len() < 6 {
            return Err(Error::Malformed);
        }
        let ptype = PacketType::from_wire(p[0] >> 4).ok_or(Error::Malformed)?;
        let x = p[0] & 0x08 != 0;
        let ccval = p[1] >> 4;
        let cscov = p[1] & 0x0f;
        let wire_sum = u16::from_be_bytes([p[2], p[3]]);
        let data_off = p[4] as usize * 4;
        if data_off > p.len() || data_off < 6 {
            return Err(Error::Malformed);
        }

        let mut zeroed = p.to_vec();
        zeroed[2] = 0;
        zeroed[3] = 0;
        if internet_checksum(&zeroed) != wire_sum {
            return Err(Error::Malformed);
        }

        let mut at = 6;
        let seqno = take_seq(p, &mut at, x)?;
        let ackno = if ptype.has_ackno() {
            take_seq(p, &mut at, x)?
        } else {
            0
        };
        let mut service_code = 0;
        let mut reset_code = 0;
        match ptype {
            PacketType::Request | PacketType::Response => {
                let b = p.get(at..at + 4).ok_or(Error::Malformed)?;
                service_code = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
                at += 4;
            }
            PacketType::Reset => {
                reset_code = *p.get(at).ok_or(Error::Malformed)?;
                at += 4;
            }
            _ => {}
        }
        if at > data_off {
            return Err(Error::Malformed);
        }

        let opts = parse_options(&p[at..data_off], ptype)?;
        Ok(Self {
            ptype,
            x,
            seqno,
            ackno,
            service_code,
            reset_code,
            ccval,
            cscov,
            options: opts,
            payload: p[data_off..].to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn put_seq(p: &mut Vec<u8>, v: i64, x: bool) {
    let b = (v as u64).to_be_bytes();
    if x {
        p.extend_from_slice(&b[2..8]); // 48 bits
    } else {
        p.extend_from_slice(&b[5..8]); // 24 bits
    }
}

fn take_seq(p: &[u8], at: &mut usize, x: bool) -> Result<i64> {
    let n = if x { 6 } else { 3 };
    let b = p.get(*at..*at + n).ok_or(Error::Malformed)?;
    *at += n;
    let mut v: i64 = 0;
    for byte in b {
        v = (v << 8) | *byte as i64;
    }
    Ok(v)
}

fn parse_options(mut region: &[u8], ptype: PacketType) -> Result<Vec<Opt>> {
    let mut opts = Vec::new();
    let mut mandatory = false;
    while let Some(&kind) = region.first() {
        region = &region[1..];
        if kind == options::OPT_PADDING {
            mandatory = false;
            continue;
        }
        if kind == options::OPT_MANDATORY {
            mandatory = true;
            continue;
        }
        if options::is_reserved(kind) {
            return Err(Error::Malformed);
        }
        let data = if options::is_single_byte(kind) {
            Vec::new()
        } else {
            let len = *region.first().ok_or(Error::Malformed)? as usize;
            if len < 2 || len - 1 > region.len() {
                return Err(Error::Malformed);
            }
            let d = region[1..len - 1].to_vec();
            region = &region[len - 1..];
            d
        };
        // Options foreign to this packet type are ignored, not fatal.
        if options::is_valid_for_packet(kind, ptype) {
            opts.push(Opt {
                kind,
                data,
                mandatory,
            });
        }
        mandatory = false;
    }
    Ok(opts)
}

fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
