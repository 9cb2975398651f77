//! SCRAM-SHA-1/256/512 client (RFC 5802), used by the Connection handshake
//! when the server negotiates one of the SCRAM mechanisms (spec §4.3).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use super::Mechanism;
use crate::error::{Error, Result};

/// Drives one client-side SCRAM exchange. Two round trips: the server sends
/// `r=<nonce>,s=<salt>,i=<iterations>`, the client answers with the proof,
/// the server sends `v=<signature>` to confirm mutual authentication.
pub struct ScramClient {
    mechanism: Mechanism,
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    expected_server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(mechanism: Mechanism, username: &str, password: &str) -> Self {
        let client_nonce = random_nonce();
        let client_first_bare = format!("n={},r={}", saslprep_escape(username), client_nonce);
        Self {
            mechanism,
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            expected_server_signature: None,
        }
    }

    /// `n,,n=<user>,r=<client-nonce>` — the SASL-AUTH initial request body.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Given the server's `r=,s=,i=` response, compute and return the
    /// client-final-message containing the proof.
    pub fn handle_server_first(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| Error::AuthFailure("SCRAM server-first is not UTF-8".into()))?;
        let fields = parse_fields(server_first);

        let server_nonce = fields
            .get("r")
            .ok_or_else(|| Error::AuthFailure("SCRAM server-first missing r=".into()))?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(Error::AuthFailure(
                "SCRAM server nonce does not extend client nonce".into(),
            ));
        }
        let salt_b64 = fields
            .get("s")
            .ok_or_else(|| Error::AuthFailure("SCRAM server-first missing s=".into()))?;
        let salt = BASE64
            .decode(salt_b64.as_bytes())
            .map_err(|_| Error::AuthFailure("SCRAM salt is not valid base64".into()))?;
        let iterations: u32 = fields
            .get("i")
            .ok_or_else(|| Error::AuthFailure("SCRAM server-first missing i=".into()))?
            .parse()
            .map_err(|_| Error::AuthFailure("SCRAM iteration count is not an integer".into()))?;

        let channel_binding = BASE64.encode("n,,");
        let client_final_without_proof = format!("c={channel_binding},r={server_nonce}");
        let auth_message =
            format!("{},{},{}", self.client_first_bare, server_first, client_final_without_proof);

        let (client_proof, server_signature) =
            self.mechanism
                .derive(self.password.as_bytes(), &salt, iterations, auth_message.as_bytes());

        self.expected_server_signature = Some(server_signature);

        Ok(format!(
            "{client_final_without_proof},p={}",
            BASE64.encode(client_proof)
        )
        .into_bytes())
    }

    /// Verifies the server's closing `v=<signature>` message.
    pub fn handle_server_final(&self, server_final: &[u8]) -> Result<()> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| Error::AuthFailure("SCRAM server-final is not UTF-8".into()))?;
        let fields = parse_fields(server_final);
        if let Some(err) = fields.get("e") {
            return Err(Error::AuthFailure(format!("SCRAM server reported error: {err}")));
        }
        let v = fields
            .get("v")
            .ok_or_else(|| Error::AuthFailure("SCRAM server-final missing v=".into()))?;
        let got = BASE64
            .decode(v.as_bytes())
            .map_err(|_| Error::AuthFailure("SCRAM server signature is not valid base64".into()))?;
        let expected = self
            .expected_server_signature
            .as_ref()
            .ok_or_else(|| Error::AuthFailure("SCRAM client-final was never sent".into()))?;
        if &got != expected {
            return Err(Error::AuthFailure("SCRAM server signature mismatch".into()));
        }
        let _ = &self.username;
        Ok(())
    }
}

impl Mechanism {
    /// Computes `(client_proof, server_signature)` for this mechanism.
    fn derive(
        self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        auth_message: &[u8],
    ) -> (Vec<u8>, Vec<u8>) {
        match self {
            Self::ScramSha1 => scram_derive_sha1(password, salt, iterations, auth_message),
            Self::ScramSha256 => scram_derive_sha256(password, salt, iterations, auth_message),
            Self::ScramSha512 => scram_derive_sha512(password, salt, iterations, auth_message),
            Self::Plain => unreachable!("PLAIN does not use SCRAM derivation"),
        }
    }
}

/// Computes `(client_proof, server_signature)` per RFC 5802 §3: derive the
/// salted password via PBKDF2, then ClientKey/StoredKey/ClientSignature and
/// ServerKey/ServerSignature via HMAC over the auth message.
macro_rules! impl_scram_derive {
    ($fn_name:ident, $digest:ty, $hmac:ty) => {
        fn $fn_name(password: &[u8], salt: &[u8], iterations: u32, auth_message: &[u8]) -> (Vec<u8>, Vec<u8>) {
            use sha1::Digest as _;

            let output_len = <$digest>::output_size();
            let mut salted_password = vec![0u8; output_len];
            pbkdf2::pbkdf2_hmac::<$digest>(password, salt, iterations, &mut salted_password);

            let client_key = hmac_bytes::<$hmac>(&salted_password, b"Client Key");
            let stored_key = {
                let mut hasher = <$digest>::new();
                hasher.update(&client_key);
                hasher.finalize().to_vec()
            };
            let client_signature = hmac_bytes::<$hmac>(&stored_key, auth_message);
            let client_proof: Vec<u8> = client_key
                .iter()
                .zip(client_signature.iter())
                .map(|(a, b)| a ^ b)
                .collect();

            let server_key = hmac_bytes::<$hmac>(&salted_password, b"Server Key");
            let server_signature = hmac_bytes::<$hmac>(&server_key, auth_message);

            (client_proof, server_signature)
        }
    };
}

impl_scram_derive!(scram_derive_sha1, Sha1, Hmac<Sha1>);
impl_scram_derive!(scram_derive_sha256, Sha256, Hmac<Sha256>);
impl_scram_derive!(scram_derive_sha512, Sha512, Hmac<Sha512>);

fn hmac_bytes<M: Mac>(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <M as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn parse_fields(s: &str) -> std::collections::HashMap<String, String> {
    s.split(',')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Escapes `,` and `=` per RFC 5802 §5.1 (`=2C`, `=3D`).
fn saslprep_escape(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}

fn random_nonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 18] = rng.r#gen();
    BASE64.encode(bytes)
}
