//! Obfuscated-EF stream cipher layer.
//!
//! Every TCP session starts with a 64-byte prelude of random bytes. The
//! prelude both disguises the protocol (nothing on the wire is
//! distinguishable from noise) and carries the key material from which the
//! two AES-256-CTR streams of the session are derived:
//!
//! - outbound: key = prelude[8..40], IV = prelude[40..56]
//! - inbound: the same 48 bytes reversed, split the same way
//!
//! The keys are used raw; there is no KDF. Both streams run continuously
//! for the life of the TCP session and are only ever reset by a fresh
//! prelude.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use zeroize::Zeroize;

use crate::core::{
    FORBIDDEN_PRELUDE_WORDS, PRELUDE_MARKER_OFFSET, PRELUDE_SIZE, PROTOCOL_MARKER_EF,
};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Paired cipher streams for one TCP session.
pub struct ObfuscationCipher {
    encrypt: Aes256Ctr,
    decrypt: Aes256Ctr,
}

/// Generate prelude bytes that cannot be mistaken for another protocol.
///
/// Regenerates until the first byte is not the EF marker, the first
/// little-endian u32 matches no known protocol signature, and the second
/// u32 is nonzero. The protocol marker is not yet present in the result.
fn random_prelude_bytes(rng: &mut impl RngCore) -> [u8; PRELUDE_SIZE] {
    let mut bytes = [0u8; PRELUDE_SIZE];
    loop {
        rng.fill_bytes(&mut bytes);
        let first = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let second = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if bytes[0] != PROTOCOL_MARKER_EF
            && !FORBIDDEN_PRELUDE_WORDS.contains(&first)
            && second != 0
        {
            return bytes;
        }
    }
}

/// Split 48 bytes of key material into an AES-256 key and a CTR IV.
fn keys_from_material(material: &[u8; 48]) -> Aes256Ctr {
    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&material[..32]);
    iv.copy_from_slice(&material[32..]);
    let cipher = Aes256Ctr::new(&key.into(), &iv.into());
    key.zeroize();
    iv.zeroize();
    cipher
}

fn forward_material(prelude: &[u8; PRELUDE_SIZE]) -> [u8; 48] {
    let mut material = [0u8; 48];
    material.copy_from_slice(&prelude[8..56]);
    material
}

fn reversed_material(prelude: &[u8; PRELUDE_SIZE]) -> [u8; 48] {
    let mut material = [0u8; 48];
    for (i, byte) in material.iter_mut().enumerate() {
        *byte = prelude[55 - i];
    }
    material
}

impl ObfuscationCipher {
    /// Create the initiator-side cipher pair and the 64-byte prelude to
    /// put on the wire.
    ///
    /// The wire prelude is the plaintext with bytes 56..64 replaced by
    /// their ciphertext: the peer decrypts that tail to find the EF
    /// protocol marker, while everything else stays indistinguishable
    /// from random. Encrypting the whole prelude advances the outbound
    /// stream, so the first frame continues the keystream at offset 64.
    pub fn initiator(rng: &mut impl RngCore) -> (Self, [u8; PRELUDE_SIZE]) {
        let mut plaintext = random_prelude_bytes(rng);
        for byte in &mut plaintext[PRELUDE_MARKER_OFFSET..PRELUDE_MARKER_OFFSET + 4] {
            *byte = PROTOCOL_MARKER_EF;
        }

        let mut forward = forward_material(&plaintext);
        let mut reversed = reversed_material(&plaintext);
        let mut cipher = Self {
            encrypt: keys_from_material(&forward),
            decrypt: keys_from_material(&reversed),
        };
        forward.zeroize();
        reversed.zeroize();

        let mut scratch = plaintext;
        cipher.encrypt.apply_keystream(&mut scratch);

        let mut wire = plaintext;
        wire[PRELUDE_MARKER_OFFSET..].copy_from_slice(&scratch[PRELUDE_MARKER_OFFSET..]);
        (cipher, wire)
    }

    /// Create the responder-side cipher pair from a received prelude.
    ///
    /// Returns `None` when the decrypted tail does not carry the EF
    /// marker. On success both streams are positioned to continue from
    /// the initiator's first frame.
    pub fn responder(wire: &[u8; PRELUDE_SIZE]) -> Option<Self> {
        let mut forward = forward_material(wire);
        let mut reversed = reversed_material(wire);
        let mut cipher = Self {
            // Directions swap relative to the initiator.
            encrypt: keys_from_material(&reversed),
            decrypt: keys_from_material(&forward),
        };
        forward.zeroize();
        reversed.zeroize();

        let mut tail = *wire;
        cipher.decrypt.apply_keystream(&mut tail);
        if tail[PRELUDE_MARKER_OFFSET..PRELUDE_MARKER_OFFSET + 4] != [PROTOCOL_MARKER_EF; 4] {
            return None;
        }
        // The responder's outbound stream starts fresh; only the inbound
        // stream consumed the 64 prelude bytes.
        Some(cipher)
    }

    /// Encrypt outbound bytes in place, advancing the outbound stream.
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        self.encrypt.apply_keystream(data);
    }

    /// Decrypt inbound bytes in place, advancing the inbound stream.
    pub fn decrypt_in_place(&mut self, data: &mut [u8]) {
        self.decrypt.apply_keystream(data);
    }
}
