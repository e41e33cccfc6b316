// NTLM message codec (negotiate / challenge / authenticate) with NTLMv2 responses
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_MESSAGE: u32 = 1;
const CHALLENGE_MESSAGE: u32 = 2;
const AUTHENTICATE_MESSAGE: u32 = 3;

pub const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
pub const NEGOTIATE_OEM: u32 = 0x0000_0002;
pub const REQUEST_TARGET: u32 = 0x0000_0004;
pub const NEGOTIATE_NTLM: u32 = 0x0000_0200;
pub const NEGOTIATE_OEM_DOMAIN_SUPPLIED: u32 = 0x0000_1000;
pub const NEGOTIATE_OEM_WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
pub const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
pub const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
pub const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
pub const NEGOTIATE_128: u32 = 0x2000_0000;
pub const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | NEGOTIATE_OEM
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_128
    | NEGOTIATE_56;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

type HmacMd5 = Hmac<Md5>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NtlmError {
    Malformed(&'static str),
    Crypto,
    Random,
}

impl std::fmt::Display for NtlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NtlmError::Malformed(what) => write!(f, "malformed NTLM message: {}", what),
            NtlmError::Crypto => write!(f, "NTLM response computation failed"),
            NtlmError::Random => write!(f, "no randomness available for the client nonce"),
        }
    }
}

impl std::error::Error for NtlmError {}

/// Type-1 message. Domain and workstation are sent OEM-encoded when given.
pub fn negotiate_message(domain: Option<&str>, workstation: Option<&str>) -> Vec<u8> {
    let domain = domain.filter(|d| !d.is_empty()).map(|d| d.to_uppercase().into_bytes());
    let workstation = workstation
        .filter(|w| !w.is_empty())
        .map(|w| w.to_uppercase().into_bytes());

    let mut flags = CLIENT_FLAGS;
    if domain.is_some() {
        flags |= NEGOTIATE_OEM_DOMAIN_SUPPLIED;
    }
    if workstation.is_some() {
        flags |= NEGOTIATE_OEM_WORKSTATION_SUPPLIED;
    }

    let mut msg = MessageWriter::new(NEGOTIATE_MESSAGE, 32);
    msg.put_u32(flags);
    msg.put_field(domain.as_deref().unwrap_or_default());
    msg.put_field(workstation.as_deref().unwrap_or_default());
    msg.finish()
}

/// Decoded Type-2 message.
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_name: Vec<u8>,
    pub target_info: Vec<u8>,
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Challenge")
            .field("flags", &format_args!("{:#010x}", self.flags))
            .field("target_info_len", &self.target_info.len())
            .finish_non_exhaustive()
    }
}

impl Challenge {
    pub fn parse(msg: &[u8]) -> Result<Self, NtlmError> {
        if msg.len() < 32 {
            return Err(NtlmError::Malformed("challenge shorter than 32 bytes"));
        }
        if &msg[..8] != SIGNATURE {
            return Err(NtlmError::Malformed("bad signature"));
        }
        if read_u32(msg, 8) != CHALLENGE_MESSAGE {
            return Err(NtlmError::Malformed("not a challenge message"));
        }

        let target_name = read_field(msg, 12)?.to_vec();
        let flags = read_u32(msg, 20);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&msg[24..32]);

        // Target info is absent from very old servers that send a 32-byte message.
        let target_info = if msg.len() >= 48 {
            read_field(msg, 40)?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Challenge {
            flags,
            server_challenge,
            target_name,
            target_info,
        })
    }

    /// MsvAvTimestamp from the target info, if the server sent one.
    #[must_use]
    pub fn timestamp(&self) -> Option<[u8; 8]> {
        let info = &self.target_info;
        let mut pos = 0;
        while pos + 4 <= info.len() {
            let id = u16::from_le_bytes([info[pos], info[pos + 1]]);
            let len = u16::from_le_bytes([info[pos + 2], info[pos + 3]]) as usize;
            let start = pos + 4;
            if id == AV_EOL || start + len > info.len() {
                return None;
            }
            if id == AV_TIMESTAMP && len == 8 {
                let mut ts = [0u8; 8];
                ts.copy_from_slice(&info[start..start + 8]);
                return Some(ts);
            }
            pos = start + len;
        }
        None
    }

    fn unicode(&self) -> bool {
        self.flags & NEGOTIATE_UNICODE != 0
    }
}

/// Inputs for a Type-3 message.
pub struct AuthenticateInput<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub domain: &'a str,
    pub workstation: &'a str,
}

/// Type-3 message answering `challenge` with an NTLMv2 response.
pub fn authenticate_message(
    challenge: &Challenge,
    input: &AuthenticateInput<'_>,
) -> Result<Vec<u8>, NtlmError> {
    let mut client_challenge = [0u8; 8];
    getrandom::fill(&mut client_challenge).map_err(|_| NtlmError::Random)?;
    let timestamp = challenge.timestamp();
    let time = timestamp.unwrap_or_else(filetime_now);
    build_authenticate(challenge, input, client_challenge, time, timestamp.is_some())
}

fn build_authenticate(
    challenge: &Challenge,
    input: &AuthenticateInput<'_>,
    client_challenge: [u8; 8],
    time: [u8; 8],
    server_timestamp: bool,
) -> Result<Vec<u8>, NtlmError> {
    let key = ntowf_v2(input.password, input.username, input.domain)?;

    let blob = client_blob(time, client_challenge, &challenge.target_info);
    let mut nt_response = hmac_md5(&*key, &[&challenge.server_challenge[..], &blob[..]])?.to_vec();
    nt_response.extend_from_slice(&blob);

    // MS-NLMP 3.1.5.1.2: no LMv2 response when the server supplied a timestamp.
    let lm_response = if server_timestamp {
        vec![0u8; 24]
    } else {
        lm_v2_response(&key, &challenge.server_challenge, &client_challenge)?
    };

    let unicode = challenge.unicode();
    let encode = |s: &str| {
        if unicode {
            utf16le(s)
        } else {
            s.as_bytes().to_vec()
        }
    };

    let charset = if unicode { NEGOTIATE_UNICODE } else { NEGOTIATE_OEM };
    let flags = (challenge.flags & CLIENT_FLAGS) | NEGOTIATE_NTLM | charset;

    let mut msg = MessageWriter::new(AUTHENTICATE_MESSAGE, 64);
    msg.put_field(&lm_response);
    msg.put_field(&nt_response);
    msg.put_field(&encode(input.domain));
    msg.put_field(&encode(input.username));
    msg.put_field(&encode(input.workstation));
    msg.put_field(&[]);
    msg.put_u32(flags);
    Ok(msg.finish())
}

/// NTOWFv1: MD4 over the UTF-16LE password.
pub fn nt_hash(password: &str) -> Zeroizing<[u8; 16]> {
    let encoded = Zeroizing::new(utf16le(password));
    let digest = Md4::digest(&*encoded);
    let mut out = Zeroizing::new([0u8; 16]);
    out.copy_from_slice(&digest);
    out
}

/// NTOWFv2: HMAC-MD5 keyed by the NT hash over UPPER(user) + domain.
pub fn ntowf_v2(
    password: &str,
    username: &str,
    domain: &str,
) -> Result<Zeroizing<[u8; 16]>, NtlmError> {
    let hash = nt_hash(password);
    let identity = utf16le(&format!("{}{}", username.to_uppercase(), domain));
    Ok(Zeroizing::new(hmac_md5(&*hash, &[identity.as_slice()])?))
}

/// LMv2: HMAC-MD5(key, server || client) followed by the client nonce.
pub fn lm_v2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>, NtlmError> {
    let mut out = hmac_md5(key, &[&server_challenge[..], &client_challenge[..]])?.to_vec();
    out.extend_from_slice(client_challenge);
    Ok(out)
}

fn client_blob(time: [u8; 8], client_challenge: [u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(&time);
    blob.extend_from_slice(&client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]);
    blob
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], NtlmError> {
    let mut mac = HmacMd5::new_from_slice(key).map_err(|_| NtlmError::Crypto)?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn filetime_now() -> [u8; 8] {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ticks = (since_epoch.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000
        + u64::from(since_epoch.subsec_nanos() / 100);
    ticks.to_le_bytes()
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn read_u32(msg: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([msg[at], msg[at + 1], msg[at + 2], msg[at + 3]])
}

/// Security buffer at `at`: u16 length, u16 max length, u32 offset.
fn read_field(msg: &[u8], at: usize) -> Result<&[u8], NtlmError> {
    if at + 8 > msg.len() {
        return Err(NtlmError::Malformed("truncated field header"));
    }
    let len = u16::from_le_bytes([msg[at], msg[at + 1]]) as usize;
    let offset = read_u32(msg, at + 4) as usize;
    if len == 0 {
        return Ok(&[]);
    }
    msg.get(offset..offset + len)
        .ok_or(NtlmError::Malformed("field outside message"))
}

/// Lays out fixed header fields, appending payloads after `header_len`.
struct MessageWriter {
    header: Vec<u8>,
    payload: Vec<u8>,
    header_len: usize,
}

impl MessageWriter {
    fn new(message_type: u32, header_len: usize) -> Self {
        let mut header = Vec::with_capacity(header_len);
        header.extend_from_slice(SIGNATURE);
        header.extend_from_slice(&message_type.to_le_bytes());
        MessageWriter {
            header,
            payload: Vec::new(),
            header_len,
        }
    }

    fn put_u32(&mut self, value: u32) {
        self.header.extend_from_slice(&value.to_le_bytes());
    }

    fn put_field(&mut self, data: &[u8]) {
        let offset = (self.header_len + self.payload.len()) as u32;
        let len = data.len() as u16;
        self.header.extend_from_slice(&len.to_le_bytes());
        self.header.extend_from_slice(&len.to_le_bytes());
        self.header.extend_from_slice(&offset.to_le_bytes());
        self.payload.extend_from_slice(data);
    }

    fn finish(mut self) -> Vec<u8> {
        debug_assert_eq!(self.header.len(), self.header_len);
        self.header.extend_from_slice(&self.payload);
        self.header
    }
}
