//! `Quantum` authorization header codec and canonical signing input.
//!
//! Header format: `Quantum <v1|v2> <base64-signature> <unix-ms-timestamp> <nonce>`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::AuthError;

pub const AUTH_SCHEME: &str = "Quantum";
const MAX_NONCE_LEN: usize = 128;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigningVersion {
    /// `METHOD\nPATH\nTIMESTAMP\nNONCE\nRAW_BODY`
    V1,
    /// `v2\nMETHOD\nPATH\nTIMESTAMP\nNONCE\nhex(SHA256(RAW_BODY))`
    V2,
}

impl SigningVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            SigningVersion::V1 => "v1",
            SigningVersion::V2 => "v2",
        }
    }
}

impl fmt::Display for SigningVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningVersion {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(SigningVersion::V1),
            "v2" => Ok(SigningVersion::V2),
            other => Err(AuthError::MalformedHeader(format!(
                "unsupported signing version '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthHeader {
    pub version: SigningVersion,
    pub signature: Vec<u8>,
    pub timestamp_ms: i64,
    pub nonce: String,
}

impl FromStr for AuthHeader {
    type Err = AuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        let [scheme, version, signature, timestamp, nonce] = parts.as_slice() else {
            return Err(AuthError::MalformedHeader(format!(
                "expected 5 fields, found {}",
                parts.len()
            )));
        };
        if *scheme != AUTH_SCHEME {
            return Err(AuthError::MalformedHeader(
                "authorization scheme must be Quantum".to_string(),
            ));
        }
        let version = version.parse()?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|_| AuthError::MalformedHeader("signature is not base64".to_string()))?;
        if signature.is_empty() {
            return Err(AuthError::MalformedHeader("empty signature".to_string()));
        }
        let timestamp_ms: i64 = timestamp
            .parse()
            .map_err(|_| AuthError::MalformedHeader("timestamp is not an integer".to_string()))?;
        if nonce.len() > MAX_NONCE_LEN || !nonce.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(AuthError::MalformedHeader("invalid nonce".to_string()));
        }
        Ok(AuthHeader {
            version,
            signature,
            timestamp_ms,
            nonce: (*nonce).to_string(),
        })
    }
}

impl fmt::Display for AuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{AUTH_SCHEME} {} {} {} {}",
            self.version,
            STANDARD.encode(&self.signature),
            self.timestamp_ms,
            self.nonce
        )
    }
}

pub fn signing_input(
    version: SigningVersion,
    method: &str,
    path: &str,
    timestamp_ms: i64,
    nonce: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut input = Vec::with_capacity(body.len() + 128);
    if version == SigningVersion::V2 {
        input.extend_from_slice(b"v2\n");
    }
    input.extend_from_slice(method.as_bytes());
    input.push(b'\n');
    input.extend_from_slice(path.as_bytes());
    input.push(b'\n');
    input.extend_from_slice(timestamp_ms.to_string().as_bytes());
    input.push(b'\n');
    input.extend_from_slice(nonce.as_bytes());
    input.push(b'\n');
    match version {
        SigningVersion::V1 => input.extend_from_slice(body),
        SigningVersion::V2 => input.extend_from_slice(hex::encode(Sha256::digest(body)).as_bytes()),
    }
    input
}

pub fn compute_signature(secret: &[u8], input: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length, so `new_from_slice` cannot fail here.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    };
    mac.update(input);
    mac.finalize().into_bytes().into()
}

/// Builds the full `Authorization` header value for a request.
pub fn sign_request(
    secret: &[u8],
    version: SigningVersion,
    method: &str,
    path: &str,
    timestamp_ms: i64,
    nonce: &str,
    body: &[u8],
) -> String {
    let input = signing_input(version, method, path, timestamp_ms, nonce, body);
    AuthHeader {
        version,
        signature: compute_signature(secret, &input).to_vec(),
        timestamp_ms,
        nonce: nonce.to_string(),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_header() {
        let header: AuthHeader = "Quantum v2 AAEC 1700000000000 abc-123".parse().unwrap();
        assert_eq!(header.version, SigningVersion::V2);
        assert_eq!(header.signature, vec![0, 1, 2]);
        assert_eq!(header.timestamp_ms, 1_700_000_000_000);
        assert_eq!(header.nonce, "abc-123");
    }

    #[test]
    fn rejects_malformed_headers() {
        for value in [
            "",
            "Bearer v1 AAEC 1 n",
            "Quantum v3 AAEC 1 n",
            "Quantum v1 !!! 1 n",
            "Quantum v1 AAEC soon n",
            "Quantum v1 AAEC 1",
            "Quantum v1 AAEC 1 n extra",
        ] {
            let err = value.parse::<AuthHeader>().unwrap_err();
            assert!(matches!(err, AuthError::MalformedHeader(_)), "{value}: {err}");
        }
    }

    #[test]
    fn v1_input_is_newline_joined() {
        let input = signing_input(SigningVersion::V1, "POST", "/intents", 42, "n1", b"{}");
        assert_eq!(input, b"POST\n/intents\n42\nn1\n{}".to_vec());
    }

    #[test]
    fn v2_input_hashes_body_and_prefixes_version() {
        let input = signing_input(SigningVersion::V2, "POST", "/intents", 42, "n1", b"abc");
        let expected = format!(
            "v2\nPOST\n/intents\n42\nn1\n{}",
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(input, expected.into_bytes());
    }

    #[test]
    fn signature_matches_rfc4231_case_2() {
        let sig = compute_signature(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(sig),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn signed_header_round_trips_through_parser() {
        let value = sign_request(b"k", SigningVersion::V1, "GET", "/jobs/1", 7, "n", b"");
        let header: AuthHeader = value.parse().unwrap();
        assert_eq!(header.to_string(), value);
        assert_eq!(header.signature.len(), 32);
    }
}
