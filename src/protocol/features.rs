//! HELLO feature negotiation bits (spec §4.3 step 2).

bitflags::bitflags! {
    /// Features the client can advertise in HELLO; the server echoes back
    /// the intersection it supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HelloFeature: u32 {
        const TLS                 = 0x0001;
        const JSON_DATATYPE        = 0x0002;
        const MUTATION_TOKENS      = 0x0004;
        const XATTR                = 0x0008;
        const SNAPPY_COMPRESSION   = 0x0010;
        const ENHANCED_ERRORS      = 0x0020;
        const UNORDERED_EXECUTION  = 0x0040;
        const SELECT_BUCKET        = 0x0080;
        const TRACING              = 0x0100;
    }
}

impl HelloFeature {
    /// Features this crate supports and advertises by default, per spec §4.3.
    /// `MUTATION_TOKENS` and `TLS` are not included here: both are
    /// conditional on connection configuration, so the caller ORs them in
    /// (see `Connection::connect`).
    pub fn supported_by_client() -> Self {
        Self::JSON_DATATYPE
            | Self::XATTR
            | Self::SNAPPY_COMPRESSION
            | Self::ENHANCED_ERRORS
            | Self::UNORDERED_EXECUTION
            | Self::SELECT_BUCKET
            | Self::TRACING
    }

    /// The 16-bit wire codes used in the HELLO body: one u16 per requested
    /// feature, in ascending bit order.
    pub fn to_wire_codes(self) -> Vec<u16> {
        let mut codes = Vec::new();
        for (bit, code) in [
            (Self::TLS, 0x02u16),
            (Self::JSON_DATATYPE, 0x0cu16),
            (Self::MUTATION_TOKENS, 0x04u16),
            (Self::XATTR, 0x06u16),
            (Self::SNAPPY_COMPRESSION, 0x0au16),
            (Self::ENHANCED_ERRORS, 0x07u16),
            (Self::UNORDERED_EXECUTION, 0x0eu16),
            (Self::SELECT_BUCKET, 0x08u16),
            (Self::TRACING, 0x0fu16),
        ] {
            if self.contains(bit) {
                codes.push(code);
            }
        }
        codes
    }

    pub fn from_wire_codes(codes: &[u16]) -> Self {
        let mut features = Self::empty();
        for &code in codes {
            let bit = match code {
                0x02 => Self::TLS,
                0x0c => Self::JSON_DATATYPE,
                0x04 => Self::MUTATION_TOKENS,
                0x06 => Self::XATTR,
                0x0a => Self::SNAPPY_COMPRESSION,
                0x07 => Self::ENHANCED_ERRORS,
                0x0e => Self::UNORDERED_EXECUTION,
                0x08 => Self::SELECT_BUCKET,
                0x0f => Self::TRACING,
                _ => continue,
            };
            features |= bit;
        }
        features
    }
}
