//! Hidden AVP processing, RFC 2661 section 4.3.
//!
//! An AVP with the H bit set carries its value obscured by an MD5-derived
//! keystream.  The keystream for the first 16-byte block is
//! `MD5(attribute ‖ secret ‖ RV)` where RV is the payload of a Random
//! Vector AVP appearing earlier in the same message; each subsequent block
//! uses `MD5(secret ‖ previous-ciphertext-block)`.  The clear payload is
//! prefixed with its 16-bit original length so padding can be stripped.

use md5::{Digest, Md5};

use l2tp_core::error::ProtocolError;

const BLOCK: usize = 16;

fn first_block_key(attribute: u16, secret: &[u8], random_vector: &[u8]) -> [u8; BLOCK] {
    let mut hasher = Md5::new();
    hasher.update(attribute.to_be_bytes());
    hasher.update(secret);
    hasher.update(random_vector);
    hasher.finalize().into()
}

fn chained_block_key(secret: &[u8], prev_cipher: &[u8]) -> [u8; BLOCK] {
    let mut hasher = Md5::new();
    hasher.update(secret);
    hasher.update(prev_cipher);
    hasher.finalize().into()
}

/// Obscures `value` for transmission in a hidden AVP.
///
/// The caller supplies the attribute type the value belongs to, the shared
/// secret, and the random vector already placed in the message.
pub fn hide(attribute: u16, value: &[u8], secret: &[u8], random_vector: &[u8]) -> Vec<u8> {
    let mut clear = Vec::with_capacity(2 + value.len());
    clear.extend_from_slice(&(value.len() as u16).to_be_bytes());
    clear.extend_from_slice(value);

    let mut out = Vec::with_capacity(clear.len());
    let mut key = first_block_key(attribute, secret, random_vector);
    for chunk in clear.chunks(BLOCK) {
        let start = out.len();
        for (i, byte) in chunk.iter().enumerate() {
            out.push(byte ^ key[i]);
        }
        key = chained_block_key(secret, &out[start..]);
    }
    out
}

/// Recovers the clear value of a hidden AVP.
///
/// Fails with [`ProtocolError::HiddenAvpNoSecret`] when no secret is
/// configured, and [`ProtocolError::HiddenAvpMismatch`] when the recovered
/// length prefix is inconsistent with the payload, which is the symptom of
/// a shared secret mismatch between the peers.
pub fn unhide(
    attribute: u16,
    obscured: &[u8],
    secret: &[u8],
    random_vector: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if secret.is_empty() {
        return Err(ProtocolError::HiddenAvpNoSecret);
    }
    if obscured.len() < 2 {
        return Err(ProtocolError::HiddenAvpMismatch);
    }

    let mut clear = Vec::with_capacity(obscured.len());
    let mut key = first_block_key(attribute, secret, random_vector);
    for chunk in obscured.chunks(BLOCK) {
        for (i, byte) in chunk.iter().enumerate() {
            clear.push(byte ^ key[i]);
        }
        key = chained_block_key(secret, chunk);
    }

    let declared = u16::from_be_bytes([clear[0], clear[1]]) as usize;
    if declared > clear.len() - 2 {
        return Err(ProtocolError::HiddenAvpMismatch);
    }
    clear.drain(..2);
    clear.truncate(declared);
    Ok(clear)
}
