//! Pure request/response builders for the Connection handshake (spec §4.3).
//! Network I/O and state transitions live in `conn.rs`; this module only
//! knows how to build request bodies and parse response bodies.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::{HelloFeature, Magic, Opcode, Packet, Status};

/// HELLO request: key = user-agent string, value = requested feature codes
/// (one big-endian u16 per feature).
pub fn hello_request(opaque: u32, user_agent: &str, features: HelloFeature) -> Packet {
    let mut value = Vec::new();
    for code in features.to_wire_codes() {
        value.extend_from_slice(&code.to_be_bytes());
    }
    Packet {
        magic: Magic::Request as u8,
        opcode: Opcode::Hello as u8,
        data_type: 0,
        vbucket_or_status: 0,
        opaque,
        cas: 0,
        extras: Bytes::new(),
        key: Bytes::copy_from_slice(user_agent.as_bytes()),
        value: Bytes::from(value),
    }
}

/// Parses the negotiated feature set from a HELLO response body.
pub fn parse_hello_response(response: &Packet) -> Result<HelloFeature> {
    check_success(response)?;
    if response.value.len() % 2 != 0 {
        return Err(Error::ProtocolViolation(
            "HELLO response value is not a whole number of u16 codes".into(),
        ));
    }
    let codes: Vec<u16> = response
        .value
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    Ok(HelloFeature::from_wire_codes(&codes))
}

pub fn sasl_list_mechs_request(opaque: u32) -> Packet {
    Packet {
        magic: Magic::Request as u8,
        opcode: Opcode::SaslListMechs as u8,
        data_type: 0,
        vbucket_or_status: 0,
        opaque,
        cas: 0,
        extras: Bytes::new(),
        key: Bytes::new(),
        value: Bytes::new(),
    }
}

pub fn parse_sasl_list_mechs_response(response: &Packet) -> Result<String> {
    check_success(response)?;
    String::from_utf8(response.value.to_vec())
        .map_err(|_| Error::ProtocolViolation("SASL mechanism list is not UTF-8".into()))
}

pub fn sasl_auth_request(opaque: u32, mechanism: &str, initial_response: &[u8]) -> Packet {
    Packet {
        magic: Magic::Request as u8,
        opcode: Opcode::SaslAuth as u8,
        data_type: 0,
        vbucket_or_status: 0,
        opaque,
        cas: 0,
        extras: Bytes::new(),
        key: Bytes::copy_from_slice(mechanism.as_bytes()),
        value: Bytes::copy_from_slice(initial_response),
    }
}

pub fn sasl_step_request(opaque: u32, mechanism: &str, data: &[u8]) -> Packet {
    Packet {
        magic: Magic::Request as u8,
        opcode: Opcode::SaslStep as u8,
        data_type: 0,
        vbucket_or_status: 0,
        opaque,
        cas: 0,
        extras: Bytes::new(),
        key: Bytes::copy_from_slice(mechanism.as_bytes()),
        value: Bytes::copy_from_slice(data),
    }
}

/// A step in the (possibly multi-round) SASL exchange.
pub enum AuthStep {
    /// Server accepted; value carries any final mechanism data (e.g. SCRAM's `v=`).
    Success(Bytes),
    /// Server wants another round; value carries the challenge/continuation data.
    Continue(Bytes),
}

/// Classifies a SASL_AUTH or SASL_STEP response. `AUTH_ERROR` is always
/// fatal (spec §4.3: "no retry on auth failure").
pub fn parse_auth_response(response: &Packet) -> Result<AuthStep> {
    match Status::from_u16(response.vbucket_or_status) {
        Status::Success => Ok(AuthStep::Success(response.value.clone())),
        Status::AuthContinue => Ok(AuthStep::Continue(response.value.clone())),
        Status::AuthError | Status::AuthStale => Err(Error::AuthFailure(
            String::from_utf8_lossy(&response.value).into_owned(),
        )),
        other => Err(Error::AuthFailure(format!(
            "unexpected SASL response status {:#x}",
            other.as_u16()
        ))),
    }
}

pub fn select_bucket_request(opaque: u32, bucket: &str) -> Packet {
    Packet {
        magic: Magic::Request as u8,
        opcode: Opcode::SelectBucket as u8,
        data_type: 0,
        vbucket_or_status: 0,
        opaque,
        cas: 0,
        extras: Bytes::new(),
        key: Bytes::copy_from_slice(bucket.as_bytes()),
        value: Bytes::new(),
    }
}

pub fn parse_select_bucket_response(response: &Packet, bucket: &str) -> Result<()> {
    match Status::from_u16(response.vbucket_or_status) {
        Status::Success => Ok(()),
        Status::KeyEnoent => Err(Error::BucketNotFound(bucket.to_string())),
        Status::AccessError => Err(Error::AccessDenied),
        other => Err(Error::ProtocolViolation(format!(
            "SELECT_BUCKET failed with status {:#x}",
            other.as_u16()
        ))),
    }
}

fn check_success(response: &Packet) -> Result<()> {
    match Status::from_u16(response.vbucket_or_status) {
        Status::Success => Ok(()),
        other => Err(Error::FeatureUnsupported(format!(
            "handshake step failed with status {:#x}",
            other.as_u16()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips_features() {
        let features = HelloFeature::JSON_DATATYPE | HelloFeature::UNORDERED_EXECUTION;
        let req = hello_request(1, "couchbase-core/0.1", features);
        let resp = Packet {
            vbucket_or_status: Status::Success.as_u16(),
            ..req
        };
        let parsed = parse_hello_response(&resp).unwrap();
        assert_eq!(parsed, features);
    }

    #[test]
    fn select_bucket_maps_enoent_to_bucket_not_found() {
        let resp = Packet {
            magic: Magic::Response as u8,
            opcode: Opcode::SelectBucket as u8,
            data_type: 0,
            vbucket_or_status: Status::KeyEnoent.as_u16(),
            opaque: 1,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        };
        assert!(matches!(
            parse_select_bucket_response(&resp, "travel-sample"),
            Err(Error::BucketNotFound(_))
        ));
    }
}
