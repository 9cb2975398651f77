//! Opcodes and status codes of the binary KV protocol (spec §6).
//!
//! Values follow the published Couchbase/memcached binary protocol table;
//! the client never originates new codes, only the ones named in spec §4.7
//! and the handshake sequence of §4.3 are modeled here.

/// Packet magic byte (spec §6): which direction a frame travels, and
/// whether it carries the framed-extras variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Magic {
    Request = 0x80,
    Response = 0x81,
    FramedRequest = 0x18,
    FramedResponse = 0x19,
}

impl Magic {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x80 => Some(Self::Request),
            0x81 => Some(Self::Response),
            0x18 => Some(Self::FramedRequest),
            0x19 => Some(Self::FramedResponse),
            _ => None,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, Self::Response | Self::FramedResponse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Noop = 0x0a,
    Version = 0x0b,
    GetQ = 0x09,
    Append = 0x0e,
    Prepend = 0x0f,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    SelectBucket = 0x89,
    Observe = 0x92,
    GetClusterConfig = 0xb5,
}

impl Opcode {
    /// Safe to retry on `Unknown(status)` per spec §4.7 ("idempotent" ops).
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::Get | Self::GetQ | Self::Observe | Self::Noop | Self::Version)
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Self::Get,
            0x01 => Self::Set,
            0x02 => Self::Add,
            0x03 => Self::Replace,
            0x04 => Self::Delete,
            0x05 => Self::Increment,
            0x06 => Self::Decrement,
            0x07 => Self::Quit,
            0x09 => Self::GetQ,
            0x0a => Self::Noop,
            0x0b => Self::Version,
            0x0e => Self::Append,
            0x0f => Self::Prepend,
            0x1f => Self::Hello,
            0x20 => Self::SaslListMechs,
            0x21 => Self::SaslAuth,
            0x22 => Self::SaslStep,
            0x89 => Self::SelectBucket,
            0x92 => Self::Observe,
            0xb5 => Self::GetClusterConfig,
            _ => return None,
        })
    }
}

/// Response status (spec §4.7 classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    KeyEnoent,
    KeyEexists,
    TooBig,
    NotStored,
    DeltaBadVal,
    NotMyVBucket,
    Locked,
    AuthStale,
    AuthError,
    AuthContinue,
    AccessError,
    NoMemory,
    Busy,
    TmpFail,
    Unknown(u16),
}

impl Status {
    pub fn from_u16(v: u16) -> Self {
        match v {
            0x0000 => Self::Success,
            0x0001 => Self::KeyEnoent,
            0x0002 => Self::KeyEexists,
            0x0003 => Self::TooBig,
            0x0005 => Self::NotStored,
            0x0006 => Self::DeltaBadVal,
            0x0007 => Self::NotMyVBucket,
            0x0009 => Self::Locked,
            0x001f => Self::AuthStale,
            0x0020 => Self::AuthError,
            0x0021 => Self::AuthContinue,
            0x0024 => Self::AccessError,
            0x0082 => Self::NoMemory,
            0x0085 => Self::Busy,
            0x0086 => Self::TmpFail,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::KeyEnoent => 0x0001,
            Self::KeyEexists => 0x0002,
            Self::TooBig => 0x0003,
            Self::NotStored => 0x0005,
            Self::DeltaBadVal => 0x0006,
            Self::NotMyVBucket => 0x0007,
            Self::Locked => 0x0009,
            Self::AuthStale => 0x001f,
            Self::AuthError => 0x0020,
            Self::AuthContinue => 0x0021,
            Self::AccessError => 0x0024,
            Self::NoMemory => 0x0082,
            Self::Busy => 0x0085,
            Self::TmpFail => 0x0086,
            Self::Unknown(v) => v,
        }
    }
}
