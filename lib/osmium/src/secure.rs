use crate::keystore::{KeyStore, SharedKeys};
use byteorder::{ByteOrder, LittleEndian};
use ferrite::crypto;
use ferrite::logging;
use std::str;

/// Header marking a decrypted message as a control message.
const CONTROL_HEADER: &str = "#!-";

/// Well-known control header an agent sends on its way down. Always let through,
/// even when the enqueue counter says the socket already went stale.
pub const HC_SHUTDOWN: &str = "#!-agent shutdown";

const COUNTER_SIZE: usize = 8;

#[inline]
pub fn is_control(text: &str) -> bool {
    text.starts_with(CONTROL_HEADER)
}

#[inline]
pub fn is_shutdown(text: &str) -> bool {
    text.starts_with(HC_SHUTDOWN)
}

/// Addressing envelope of a transport payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Envelope<'a> {
    /// `!<decimal-id>!<ciphertext>`: the agent names itself.
    Addressed { id: &'a str, payload: &'a [u8] },
    /// `#ping` liveness probe; never authenticated.
    Ping,
    /// Bare ciphertext; the sender is identified by its source address.
    Plain(&'a [u8]),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EnvelopeError;

/// Splits a payload into its addressing envelope. The id digits run up to the
/// closing `!`; anything else in between is a protocol violation.
pub fn parse_envelope(buffer: &[u8]) -> Result<Envelope, EnvelopeError> {
    if buffer.first() == Some(&b'!') {
        let rest = &buffer[1..];
        let end = rest
            .iter()
            .position(|byte| !byte.is_ascii_digit())
            .ok_or(EnvelopeError)?;

        if rest[end] != b'!' {
            return Err(EnvelopeError);
        }

        let id = str::from_utf8(&rest[..end]).map_err(|_| EnvelopeError)?;
        return Ok(Envelope::Addressed {
            id,
            payload: &rest[end + 1..],
        });
    }

    if buffer.starts_with(b"#ping") {
        return Ok(Envelope::Ping);
    }

    Ok(Envelope::Plain(buffer))
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecodeError {
    /// The authentication tag did not verify: wrong or rotated key material.
    InvalidKey,
    /// Counter at or below the last accepted one for this agent.
    Duplicate,
    /// Too short to carry a counter and a tag, or cleartext that is not text.
    Format,
}

pub struct Decoded {
    pub text: String,
    pub counter: u64,
}

/// Verifies, decrypts and de-duplicates one agent payload. On success the
/// entry's counter advances and is journaled through its rids handle. The
/// caller holds the store read lock; the entry mutex is taken here.
pub fn decode(
    keys: &SharedKeys,
    store: &KeyStore,
    idx: usize,
    payload: &[u8],
    log: &logging::Logger,
) -> Result<Decoded, DecodeError> {
    if payload.len() < COUNTER_SIZE + crypto::MAC_SIZE {
        return Err(DecodeError::Format);
    }

    let counter = LittleEndian::read_u64(&payload[..COUNTER_SIZE]);
    let cipher = &payload[COUNTER_SIZE..];
    let entry = store.entry(idx);

    let mut plain = vec![0u8; cipher.len() - crypto::MAC_SIZE];
    crypto::open(&mut plain, cipher, entry.id.as_bytes(), counter, &entry.key)
        .map_err(|_| DecodeError::InvalidKey)?;

    let text = String::from_utf8(plain).map_err(|_| DecodeError::Format)?;

    let mut state = entry.lock();
    if counter <= state.counter {
        logging::warn!(log, "Duplicated message counter";
                       "id" => %entry.id,
                       "counter" => counter,
                       "stored" => state.counter);
        return Err(DecodeError::Duplicate);
    }

    keys.store_counter(idx, entry, &mut state, counter);

    Ok(Decoded { text, counter })
}

/// Builds the wire payload carrying `text` under `counter` for the given agent
/// credentials. The agent side of `decode`; used by test harnesses and local
/// delivery tooling.
pub fn seal_payload(key: &[u8; crypto::KEY_SIZE], id: &str, counter: u64, text: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; COUNTER_SIZE + text.len() + crypto::MAC_SIZE];
    LittleEndian::write_u64(&mut payload[..COUNTER_SIZE], counter);
    crypto::seal(&mut payload[COUNTER_SIZE..], text, id.as_bytes(), counter, key)
        .expect("Error sealing payload");
    payload
}
