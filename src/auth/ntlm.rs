//! NTLM message engine
//!
//! Builds and parses the three messages of the NTLM handshake:
//! 1. Type 1 (Negotiate) sent by the client
//! 2. Type 2 (Challenge) sent by the server, carrying the nonce
//! 3. Type 3 (Authenticate) sent by the client with the computed response
//!
//! Both response schemes are supported: NTLMv2 (HMAC-MD5 proof over the
//! server and client challenges plus the target info blob) and the legacy
//! NTLMv1 scheme (three DES-ECB encryptions of the server challenge under
//! the padded NT hash).

use super::{ExplicitCredentials, NtlmVersion};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use rand::RngCore;

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

// NTLM flag bits (subset)
const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

/// Authentication scheme advertised in `WWW-Authenticate`. Negotiate is
/// treated identically to NTLM for handshake purposes; the reply echoes
/// the scheme the server offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Ntlm,
    Negotiate,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Ntlm => "NTLM",
            AuthScheme::Negotiate => "Negotiate",
        }
    }
}

/// Pick the scheme to answer with from a `WWW-Authenticate` header value.
/// Explicit credentials prefer NTLM; SSO prefers Negotiate.
pub fn offered_scheme(header: &str, prefer_negotiate: bool) -> Option<AuthScheme> {
    let mut has_ntlm = false;
    let mut has_negotiate = false;
    for token in header.split(',') {
        let token = token.trim();
        let name = token.split_whitespace().next().unwrap_or("");
        if name.eq_ignore_ascii_case("NTLM") {
            has_ntlm = true;
        } else if name.eq_ignore_ascii_case("Negotiate") {
            has_negotiate = true;
        }
    }
    match (has_ntlm, has_negotiate, prefer_negotiate) {
        (_, true, true) => Some(AuthScheme::Negotiate),
        (true, _, _) => Some(AuthScheme::Ntlm),
        (_, true, _) => Some(AuthScheme::Negotiate),
        _ => None,
    }
}

/// Extract the base64 challenge token from a `WWW-Authenticate` value.
pub fn extract_token(header: &str) -> Option<(AuthScheme, Vec<u8>)> {
    for part in header.split(',') {
        let part = part.trim();
        let (scheme, token) = if let Some(rest) = strip_scheme(part, "NTLM") {
            (AuthScheme::Ntlm, rest)
        } else if let Some(rest) = strip_scheme(part, "Negotiate") {
            (AuthScheme::Negotiate, rest)
        } else {
            continue;
        };
        if token.is_empty() {
            continue;
        }
        if let Ok(data) = BASE64.decode(token) {
            return Some((scheme, data));
        }
    }
    None
}

fn strip_scheme<'a>(value: &'a str, scheme: &str) -> Option<&'a str> {
    let (name, rest) = value.split_once(' ')?;
    if name.eq_ignore_ascii_case(scheme) {
        Some(rest.trim())
    } else {
        None
    }
}

/// `Authorization` header value carrying `token` under `scheme`.
pub fn authorization_header(scheme: AuthScheme, token: &[u8]) -> String {
    format!("{} {}", scheme.as_str(), BASE64.encode(token))
}

/// Build the Type 1 (Negotiate) message.
pub fn negotiate_message() -> Vec<u8> {
    let flags: u32 = NEGOTIATE_UNICODE
        | NEGOTIATE_OEM
        | REQUEST_TARGET
        | NEGOTIATE_NTLM
        | NEGOTIATE_ALWAYS_SIGN
        | NEGOTIATE_EXTENDED_SESSIONSECURITY
        | NEGOTIATE_TARGET_INFO
        | NEGOTIATE_128
        | NEGOTIATE_56;

    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    // Domain and workstation security buffers, both empty
    write_security_buffer(&mut msg, 0, 0);
    write_security_buffer(&mut msg, 0, 0);
    msg
}

/// Parsed Type 2 (Challenge) message.
#[derive(Debug)]
pub struct Challenge {
    pub server_challenge: [u8; 8],
    pub flags: u32,
    pub target_name: Option<String>,
    pub target_info: Option<Vec<u8>>,
}

/// Parse a Type 2 (Challenge) message.
pub fn parse_challenge(data: &[u8]) -> Result<Challenge> {
    if data.len() < 32 {
        return Err(Error::handshake(format!(
            "NTLM challenge too short: {} bytes",
            data.len()
        )));
    }
    if &data[0..8] != SIGNATURE {
        return Err(Error::handshake("Invalid NTLM signature"));
    }
    let msg_type = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if msg_type != 2 {
        return Err(Error::handshake(format!("Expected NTLM Type 2, got {}", msg_type)));
    }

    let flags = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);

    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&data[24..32]);

    // Target name security buffer at offset 12..20
    let target_name = {
        let len = u16::from_le_bytes([data[12], data[13]]) as usize;
        let offset = u32::from_le_bytes([data[16], data[17], data[18], data[19]]) as usize;
        if len > 0 && offset + len <= data.len() {
            let raw = &data[offset..offset + len];
            if flags & NEGOTIATE_UNICODE != 0 {
                let utf16: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect();
                Some(String::from_utf16_lossy(&utf16))
            } else {
                Some(String::from_utf8_lossy(raw).into_owned())
            }
        } else {
            None
        }
    };

    // Target info security buffer at offset 40..48 when advertised
    let target_info = if data.len() >= 48 && flags & NEGOTIATE_TARGET_INFO != 0 {
        let len = u16::from_le_bytes([data[40], data[41]]) as usize;
        let offset = u32::from_le_bytes([data[44], data[45], data[46], data[47]]) as usize;
        if len > 0 && offset + len <= data.len() {
            Some(data[offset..offset + len].to_vec())
        } else {
            None
        }
    } else {
        None
    };

    Ok(Challenge {
        server_challenge,
        flags,
        target_name,
        target_info,
    })
}

/// Build the Type 3 (Authenticate) message for explicit credentials
/// against `host` (used to default the domain).
pub fn authenticate_message(
    challenge: &Challenge,
    credentials: &ExplicitCredentials,
    host: &str,
) -> Result<Vec<u8>> {
    let domain = credentials.domain_for(host);
    let workstation = credentials.workstation_name();

    let (nt_response, lm_response) = match credentials.version {
        NtlmVersion::V2 => ntlmv2_response(credentials, &domain, challenge)?,
        NtlmVersion::V1 => ntlmv1_response(&credentials.password, &challenge.server_challenge),
    };

    let domain_utf16 = to_utf16le(&domain);
    let username_utf16 = to_utf16le(&credentials.username);
    let workstation_utf16 = to_utf16le(&workstation);

    // Fixed header: signature + type + five security buffers + session key
    // buffer + flags = 64 bytes
    let base_offset: u32 = 64;
    let lm_offset = base_offset;
    let nt_offset = lm_offset + lm_response.len() as u32;
    let domain_offset = nt_offset + nt_response.len() as u32;
    let username_offset = domain_offset + domain_utf16.len() as u32;
    let workstation_offset = username_offset + username_utf16.len() as u32;
    let session_key_offset = workstation_offset + workstation_utf16.len() as u32;

    let mut msg = Vec::with_capacity(session_key_offset as usize);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());

    write_security_buffer(&mut msg, lm_response.len() as u16, lm_offset);
    write_security_buffer(&mut msg, nt_response.len() as u16, nt_offset);
    write_security_buffer(&mut msg, domain_utf16.len() as u16, domain_offset);
    write_security_buffer(&mut msg, username_utf16.len() as u16, username_offset);
    write_security_buffer(&mut msg, workstation_utf16.len() as u16, workstation_offset);
    // Encrypted random session key, empty
    write_security_buffer(&mut msg, 0, session_key_offset);
    msg.extend_from_slice(&challenge.flags.to_le_bytes());

    msg.extend_from_slice(&lm_response);
    msg.extend_from_slice(&nt_response);
    msg.extend_from_slice(&domain_utf16);
    msg.extend_from_slice(&username_utf16);
    msg.extend_from_slice(&workstation_utf16);

    Ok(msg)
}

/// NT hash: MD4 over the UTF-16LE password.
fn nt_hash(password: &str) -> [u8; 16] {
    let mut md4 = Md4::new();
    md4.update(to_utf16le(password));
    md4.finalize().into()
}

/// NTLMv2 NT and LM responses.
fn ntlmv2_response(
    credentials: &ExplicitCredentials,
    domain: &str,
    challenge: &Challenge,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let nt_hash = nt_hash(&credentials.password);

    // NTLMv2 hash = HMAC-MD5(NT hash, UPPER(user) + domain)
    let user_domain = format!("{}{}", credentials.username.to_uppercase(), domain);
    let mut mac = <HmacMd5 as Mac>::new_from_slice(&nt_hash)
        .map_err(|e| Error::handshake(format!("HMAC error: {}", e)))?;
    mac.update(&to_utf16le(&user_domain));
    let ntlmv2_hash = mac.finalize().into_bytes();

    let mut client_challenge = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut client_challenge);

    // Blob: version, timestamp, client challenge, target info
    let target_info = challenge.target_info.as_deref().unwrap_or(&[]);
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    blob.extend_from_slice(&filetime_now());
    blob.extend_from_slice(&client_challenge);
    blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

    // NT proof = HMAC-MD5(NTLMv2 hash, server challenge + blob)
    let mut mac = <HmacMd5 as Mac>::new_from_slice(&ntlmv2_hash)
        .map_err(|e| Error::handshake(format!("HMAC error: {}", e)))?;
    mac.update(&challenge.server_challenge);
    mac.update(&blob);
    let nt_proof = mac.finalize().into_bytes();

    let mut nt_response = Vec::with_capacity(16 + blob.len());
    nt_response.extend_from_slice(&nt_proof);
    nt_response.extend_from_slice(&blob);

    // LMv2 = HMAC-MD5(NTLMv2 hash, server + client challenge) + client challenge
    let mut mac = <HmacMd5 as Mac>::new_from_slice(&ntlmv2_hash)
        .map_err(|e| Error::handshake(format!("HMAC error: {}", e)))?;
    mac.update(&challenge.server_challenge);
    mac.update(&client_challenge);
    let lm_proof = mac.finalize().into_bytes();

    let mut lm_response = Vec::with_capacity(24);
    lm_response.extend_from_slice(&lm_proof);
    lm_response.extend_from_slice(&client_challenge);

    Ok((nt_response, lm_response))
}

/// NTLMv1 NT response: the padded NT hash split into three 7-byte DES keys,
/// each encrypting the server challenge. The LM response is left empty.
fn ntlmv1_response(password: &str, server_challenge: &[u8; 8]) -> (Vec<u8>, Vec<u8>) {
    let hash = nt_hash(password);
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(&hash);

    let mut nt_response = Vec::with_capacity(24);
    for key7 in padded.chunks_exact(7) {
        nt_response.extend_from_slice(&des_encrypt(key7, server_challenge));
    }
    (nt_response, vec![0u8; 24])
}

/// Single-block DES-ECB encryption under a 7-byte key expanded to 8 bytes
/// with odd parity.
fn des_encrypt(key7: &[u8], block: &[u8; 8]) -> [u8; 8] {
    let key8 = expand_des_key(key7);
    let cipher = Des::new(&key8.into());
    let mut out = (*block).into();
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Expand a 7-byte key into an 8-byte DES key with odd parity.
fn expand_des_key(key7: &[u8]) -> [u8; 8] {
    let mut key8 = [0u8; 8];
    key8[0] = key7[0] >> 1;
    key8[1] = ((key7[0] & 0x01) << 6) | (key7[1] >> 2);
    key8[2] = ((key7[1] & 0x03) << 5) | (key7[2] >> 3);
    key8[3] = ((key7[2] & 0x07) << 4) | (key7[3] >> 4);
    key8[4] = ((key7[3] & 0x0F) << 3) | (key7[4] >> 5);
    key8[5] = ((key7[4] & 0x1F) << 2) | (key7[5] >> 6);
    key8[6] = ((key7[5] & 0x3F) << 1) | (key7[6] >> 7);
    key8[7] = key7[6] & 0x7F;
    for b in &mut key8 {
        *b <<= 1;
        if b.count_ones() % 2 == 0 {
            *b ^= 0x01;
        }
    }
    key8
}

fn to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// Current time as Windows FILETIME (100ns ticks since 1601-01-01).
fn filetime_now() -> [u8; 8] {
    use std::time::{SystemTime, UNIX_EPOCH};

    const EPOCH_DIFF: u64 = 116_444_736_000_000_000;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let filetime = now.as_secs() * 10_000_000 + now.subsec_nanos() as u64 / 100 + EPOCH_DIFF;
    filetime.to_le_bytes()
}

fn write_security_buffer(buf: &mut Vec<u8>, length: u16, offset: u32) {
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NtlmVersion;

    fn creds(version: NtlmVersion) -> ExplicitCredentials {
        ExplicitCredentials {
            username: "user".to_string(),
            password: "SecREt01".to_string(),
            domain: Some("DOMAIN".to_string()),
            workstation: Some("WS1".to_string()),
            version,
        }
    }

    #[test]
    fn test_negotiate_message_shape() {
        let msg = negotiate_message();
        assert_eq!(&msg[0..8], b"NTLMSSP\0");
        assert_eq!(&msg[8..12], &1u32.to_le_bytes());
        assert_eq!(msg.len(), 32);
    }

    #[test]
    fn test_nt_hash_vector() {
        // Davenport NTLM test vector
        assert_eq!(hex::encode(nt_hash("SecREt01")), "cd06ca7c7e10c99b1d33b7485a2ed808");
    }

    #[test]
    fn test_ntlmv1_response_vector() {
        let challenge = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
        let (nt, lm) = ntlmv1_response("SecREt01", &challenge);
        assert_eq!(
            hex::encode(&nt),
            "25a98c1c31e81847466b29b2df4680f39958fb8c213a9cc6"
        );
        assert_eq!(lm, vec![0u8; 24]);
    }

    #[test]
    fn test_parse_challenge() {
        let mut type2 = vec![0u8; 56];
        type2[0..8].copy_from_slice(b"NTLMSSP\0");
        type2[8..12].copy_from_slice(&2u32.to_le_bytes());
        type2[20..24].copy_from_slice(&(NEGOTIATE_UNICODE | NEGOTIATE_NTLM).to_le_bytes());
        type2[24..32].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let parsed = parse_challenge(&type2).unwrap();
        assert_eq!(parsed.server_challenge, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(parsed.target_info.is_none());
    }

    #[test]
    fn test_parse_challenge_rejects_garbage() {
        assert!(parse_challenge(b"short").is_err());
        let mut wrong_type = vec![0u8; 40];
        wrong_type[0..8].copy_from_slice(b"NTLMSSP\0");
        wrong_type[8..12].copy_from_slice(&1u32.to_le_bytes());
        assert!(parse_challenge(&wrong_type).is_err());
    }

    #[test]
    fn test_authenticate_message_shape() {
        for version in [NtlmVersion::V1, NtlmVersion::V2] {
            let challenge = Challenge {
                server_challenge: [1, 2, 3, 4, 5, 6, 7, 8],
                flags: NEGOTIATE_UNICODE | NEGOTIATE_NTLM,
                target_name: Some("DOMAIN".to_string()),
                target_info: None,
            };
            let msg = authenticate_message(&challenge, &creds(version), "host.example.com").unwrap();
            assert_eq!(&msg[0..8], b"NTLMSSP\0");
            assert_eq!(
                u32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]),
                3
            );
        }
    }

    #[test]
    fn test_offered_scheme() {
        assert_eq!(offered_scheme("NTLM", false), Some(AuthScheme::Ntlm));
        assert_eq!(offered_scheme("Negotiate, NTLM", false), Some(AuthScheme::Ntlm));
        assert_eq!(
            offered_scheme("Negotiate, NTLM", true),
            Some(AuthScheme::Negotiate)
        );
        assert_eq!(offered_scheme("Negotiate", false), Some(AuthScheme::Negotiate));
        assert_eq!(offered_scheme("Basic realm=\"x\"", false), None);
    }

    #[test]
    fn test_extract_token_round_trip() {
        let msg = negotiate_message();
        let header = authorization_header(AuthScheme::Ntlm, &msg);
        let (scheme, token) = extract_token(&header).unwrap();
        assert_eq!(scheme, AuthScheme::Ntlm);
        assert_eq!(token, msg);
    }

    #[test]
    fn test_extract_token_ignores_bare_scheme() {
        assert!(extract_token("NTLM").is_none());
        assert!(extract_token("Basic abc=").is_none());
    }
}
