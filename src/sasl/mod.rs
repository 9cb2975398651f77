//! SASL mechanism negotiation for the Connection handshake (spec §4.3 step 3).

pub mod scram;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    ScramSha512,
    ScramSha256,
    ScramSha1,
    Plain,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Self::ScramSha512 => "SCRAM-SHA512",
            Self::ScramSha256 => "SCRAM-SHA256",
            Self::ScramSha1 => "SCRAM-SHA1",
            Self::Plain => "PLAIN",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "SCRAM-SHA512" => Some(Self::ScramSha512),
            "SCRAM-SHA256" => Some(Self::ScramSha256),
            "SCRAM-SHA1" => Some(Self::ScramSha1),
            "PLAIN" => Some(Self::Plain),
            _ => None,
        }
    }
}

/// Picks the strongest mechanism both sides support, per spec §4.3:
/// SCRAM-SHA-512 > SHA-256 > SHA-1 > PLAIN, with PLAIN allowed only over TLS.
pub fn negotiate(server_mechs: &str, is_tls: bool) -> Result<Mechanism> {
    let available: Vec<Mechanism> = server_mechs
        .split_whitespace()
        .filter_map(Mechanism::from_name)
        .collect();

    for candidate in [
        Mechanism::ScramSha512,
        Mechanism::ScramSha256,
        Mechanism::ScramSha1,
    ] {
        if available.contains(&candidate) {
            return Ok(candidate);
        }
    }
    if available.contains(&Mechanism::Plain) {
        if !is_tls {
            return Err(Error::AuthFailure(
                "server only offers PLAIN and connection is not TLS".into(),
            ));
        }
        return Ok(Mechanism::Plain);
    }
    Err(Error::AuthFailure(format!(
        "no supported SASL mechanism among: {server_mechs}"
    )))
}

/// Builds the PLAIN SASL initial response: `\0username\0password`.
pub fn plain_initial_response(username: &str, password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(username.len() + password.len() + 2);
    out.push(0);
    out.extend_from_slice(username.as_bytes());
    out.push(0);
    out.extend_from_slice(password.as_bytes());
    out
}
