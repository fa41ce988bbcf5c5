//! Encryptor chain for control messages and data packets.
//!
//! Keys are derived with HKDF-SHA256 from the pre-shared secret; the AEAD
//! is XChaCha20-Poly1305 with an 8-byte little-endian counter nonce on the
//! wire and a sliding replay window on receive. Encryptors work in place
//! over a packet buffer and may grow the payload up to the buffer's
//! capacity.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const WIRE_NONCE_SIZE: usize = 8;
const TAG_SIZE: usize = 16;
pub const REPLAY_WINDOW_SIZE: u64 = 64;

/// Bytes the AEAD adds to a payload: wire nonce plus tag.
pub const AEAD_OVERHEAD: usize = WIRE_NONCE_SIZE + TAG_SIZE;

const KEY_SALT: &[u8] = b"stun-key-salt";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed")]
    Decrypt,
    #[error("Packet too short for decryption")]
    TooShort,
    #[error("Ciphertext does not fit the packet buffer")]
    Overflow,
    #[error("Replay detected: nonce {0} already seen or too old")]
    Replay(u64),
    #[error("Key derivation failed")]
    Derive,
}

/// An in-place transform applied to a packet buffer.
///
/// `len` is the occupied prefix of `buf`; the result is the new occupied
/// length. A chain `[e0, e1, ..., en]` applied forward on send is inverted
/// on receive (`en..e0`).
pub trait Encryptor {
    fn encrypt(&mut self, buf: &mut [u8], len: usize) -> Result<usize, CryptoError>;
    fn decrypt(&mut self, buf: &mut [u8], len: usize) -> Result<usize, CryptoError>;
}

/// Run the chain forward over the buffer.
pub fn encrypt_chain(
    chain: &mut [Box<dyn Encryptor>],
    buf: &mut [u8],
    len: usize,
) -> Result<usize, CryptoError> {
    let mut len = len;
    for encryptor in chain.iter_mut() {
        len = encryptor.encrypt(buf, len)?;
    }
    Ok(len)
}

/// Run the chain in reverse over the buffer.
pub fn decrypt_chain(
    chain: &mut [Box<dyn Encryptor>],
    buf: &mut [u8],
    len: usize,
) -> Result<usize, CryptoError> {
    let mut len = len;
    for encryptor in chain.iter_mut().rev() {
        len = encryptor.decrypt(buf, len)?;
    }
    Ok(len)
}

/// Generate a fresh pre-shared secret for config files.
pub fn generate_secret() -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    B64.encode(key)
}

/// Derive a 32-byte key from the shared secret and a context label.
pub fn derive_key(secret: &str, info: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let prk = Hkdf::<Sha256>::extract(Some(KEY_SALT), secret.as_bytes()).0;
    let expander = Hkdf::<Sha256>::from_prk(&prk).map_err(|_| CryptoError::Derive)?;
    let mut okm = [0u8; KEY_SIZE];
    expander.expand(info, &mut okm).map_err(|_| CryptoError::Derive)?;
    Ok(okm)
}

/// Derive the directional key pair for one channel (e.g. a data pipe's
/// seed). The initiator sends with the first key and receives with the
/// second; the responder swaps them. Distinct directions never share a
/// (key, nonce) pair.
pub fn derive_key_pair(
    secret: &str,
    info: &[u8],
) -> Result<([u8; KEY_SIZE], [u8; KEY_SIZE]), CryptoError> {
    let prk = Hkdf::<Sha256>::extract(Some(KEY_SALT), secret.as_bytes()).0;
    let expander = Hkdf::<Sha256>::from_prk(&prk).map_err(|_| CryptoError::Derive)?;
    let mut okm = [0u8; KEY_SIZE * 2];
    expander.expand(info, &mut okm).map_err(|_| CryptoError::Derive)?;
    let first: [u8; KEY_SIZE] = okm[..KEY_SIZE].try_into().expect("32-byte slice");
    let second: [u8; KEY_SIZE] = okm[KEY_SIZE..].try_into().expect("32-byte slice");
    Ok((first, second))
}

/// XChaCha20-Poly1305 with directional keys, a monotonically increasing
/// send nonce, and a 64-entry sliding replay window on receive.
pub struct AeadEncryptor {
    send_cipher: XChaCha20Poly1305,
    recv_cipher: XChaCha20Poly1305,
    send_nonce: u64,
    last_recv_nonce: u64,
    recv_nonce_bitmap: u64,
}

impl AeadEncryptor {
    pub fn new(send_key: &[u8; KEY_SIZE], recv_key: &[u8; KEY_SIZE]) -> AeadEncryptor {
        AeadEncryptor {
            send_cipher: XChaCha20Poly1305::new(send_key.into()),
            recv_cipher: XChaCha20Poly1305::new(recv_key.into()),
            send_nonce: 0,
            last_recv_nonce: 0,
            recv_nonce_bitmap: 0,
        }
    }

    /// Build the channel encryptor for one side of a connection.
    pub fn for_channel(secret: &str, info: &[u8], initiator: bool) -> Result<AeadEncryptor, CryptoError> {
        let (first, second) = derive_key_pair(secret, info)?;
        Ok(if initiator {
            AeadEncryptor::new(&first, &second)
        } else {
            AeadEncryptor::new(&second, &first)
        })
    }

    fn full_nonce(nonce_val: u64) -> XNonce {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes[..8].copy_from_slice(&nonce_val.to_le_bytes());
        nonce_bytes.into()
    }

    /// Read-only replay check; the window only advances once the tag has
    /// verified.
    fn check_replay(&self, nonce_val: u64) -> Result<(), CryptoError> {
        if nonce_val > self.last_recv_nonce {
            return Ok(());
        }
        let diff = self.last_recv_nonce - nonce_val;
        if diff >= REPLAY_WINDOW_SIZE {
            return Err(CryptoError::Replay(nonce_val));
        }
        if (self.recv_nonce_bitmap >> diff) & 1 == 1 {
            return Err(CryptoError::Replay(nonce_val));
        }
        Ok(())
    }

    fn commit_nonce(&mut self, nonce_val: u64) {
        if nonce_val > self.last_recv_nonce {
            let shift = nonce_val - self.last_recv_nonce;
            if shift >= REPLAY_WINDOW_SIZE {
                self.recv_nonce_bitmap = 1;
            } else {
                self.recv_nonce_bitmap = (self.recv_nonce_bitmap << shift) | 1;
            }
            self.last_recv_nonce = nonce_val;
        } else {
            self.recv_nonce_bitmap |= 1 << (self.last_recv_nonce - nonce_val);
        }
    }
}

impl Encryptor for AeadEncryptor {
    fn encrypt(&mut self, buf: &mut [u8], len: usize) -> Result<usize, CryptoError> {
        let nonce_val = self.send_nonce;
        let ciphertext = self
            .send_cipher
            .encrypt(&Self::full_nonce(nonce_val), &buf[..len])
            .map_err(|_| CryptoError::Encrypt)?;

        let total = WIRE_NONCE_SIZE + ciphertext.len();
        if total > buf.len() {
            return Err(CryptoError::Overflow);
        }
        buf[..WIRE_NONCE_SIZE].copy_from_slice(&nonce_val.to_le_bytes());
        buf[WIRE_NONCE_SIZE..total].copy_from_slice(&ciphertext);
        self.send_nonce += 1;
        Ok(total)
    }

    fn decrypt(&mut self, buf: &mut [u8], len: usize) -> Result<usize, CryptoError> {
        if len < WIRE_NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::TooShort);
        }
        let nonce_val = u64::from_le_bytes(
            buf[..WIRE_NONCE_SIZE].try_into().expect("8-byte slice"),
        );
        self.check_replay(nonce_val)?;

        let plaintext = self
            .recv_cipher
            .decrypt(&Self::full_nonce(nonce_val), &buf[WIRE_NONCE_SIZE..len])
            .map_err(|_| CryptoError::Decrypt)?;
        self.commit_nonce(nonce_val);

        buf[..plaintext.len()].copy_from_slice(&plaintext);
        Ok(plaintext.len())
    }
}

/// Pads payloads up to a fixed size so message lengths do not leak. The
/// original length travels in a 4-byte prefix; run this before the AEAD in
/// the chain so the prefix is covered by the tag.
pub struct PaddingEncryptor {
    padding_to: usize,
}

impl PaddingEncryptor {
    pub fn new(padding_to: usize) -> PaddingEncryptor {
        PaddingEncryptor { padding_to }
    }
}

impl Encryptor for PaddingEncryptor {
    fn encrypt(&mut self, buf: &mut [u8], len: usize) -> Result<usize, CryptoError> {
        let padded = (4 + len).max(self.padding_to);
        if padded > buf.len() {
            return Err(CryptoError::Overflow);
        }
        buf.copy_within(..len, 4);
        buf[..4].copy_from_slice(&(len as u32).to_le_bytes());
        buf[4 + len..padded].fill(0);
        Ok(padded)
    }

    fn decrypt(&mut self, buf: &mut [u8], len: usize) -> Result<usize, CryptoError> {
        if len < 4 {
            return Err(CryptoError::TooShort);
        }
        let original = u32::from_le_bytes(buf[..4].try_into().expect("4-byte slice")) as usize;
        if 4 + original > len {
            return Err(CryptoError::Decrypt);
        }
        buf.copy_within(4..4 + original, 0);
        Ok(original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(tag: &str) -> (AeadEncryptor, AeadEncryptor) {
        (
            AeadEncryptor::for_channel("test-secret", tag.as_bytes(), true).unwrap(),
            AeadEncryptor::for_channel("test-secret", tag.as_bytes(), false).unwrap(),
        )
    }

    #[test]
    fn aead_round_trip() {
        let (mut tx, mut rx) = endpoints("pipe-0");

        let mut buf = [0u8; 256];
        buf[..5].copy_from_slice(b"hello");
        let len = tx.encrypt(&mut buf, 5).unwrap();
        assert_eq!(len, 5 + AEAD_OVERHEAD);
        assert_ne!(&buf[WIRE_NONCE_SIZE..WIRE_NONCE_SIZE + 5], b"hello");

        let len = rx.decrypt(&mut buf, len).unwrap();
        assert_eq!(&buf[..len], b"hello");
    }

    #[test]
    fn replayed_packet_is_rejected() {
        let (mut tx, mut rx) = endpoints("pipe-1");

        let mut buf = [0u8; 256];
        buf[..4].copy_from_slice(b"data");
        let len = tx.encrypt(&mut buf, 4).unwrap();
        let replayed = buf;

        rx.decrypt(&mut buf, len).unwrap();
        let mut again = replayed;
        assert!(matches!(rx.decrypt(&mut again, len), Err(CryptoError::Replay(_))));
    }

    #[test]
    fn out_of_order_within_window_is_accepted() {
        let (mut tx, mut rx) = endpoints("pipe-2");

        let mut first = [0u8; 64];
        first[..1].copy_from_slice(b"a");
        let first_len = tx.encrypt(&mut first, 1).unwrap();

        let mut second = [0u8; 64];
        second[..1].copy_from_slice(b"b");
        let second_len = tx.encrypt(&mut second, 1).unwrap();

        rx.decrypt(&mut second, second_len).unwrap();
        let len = rx.decrypt(&mut first, first_len).unwrap();
        assert_eq!(&first[..len], b"a");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (mut tx, mut rx) = endpoints("pipe-3");

        let mut buf = [0u8; 64];
        buf[..4].copy_from_slice(b"data");
        let len = tx.encrypt(&mut buf, 4).unwrap();
        buf[WIRE_NONCE_SIZE] ^= 0xff;
        assert!(matches!(rx.decrypt(&mut buf, len), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn padding_hides_length() {
        let mut pad = PaddingEncryptor::new(128);
        let mut buf = [0u8; 256];
        buf[..7].copy_from_slice(b"shorter");
        let len = pad.encrypt(&mut buf, 7).unwrap();
        assert_eq!(len, 128);
        let len = pad.decrypt(&mut buf, len).unwrap();
        assert_eq!(&buf[..len], b"shorter");
    }

    #[test]
    fn chain_inverts_in_reverse_order() {
        let (tx, rx) = endpoints("pipe-4");
        let mut send: Vec<Box<dyn Encryptor>> =
            vec![Box::new(PaddingEncryptor::new(64)), Box::new(tx)];
        let mut recv: Vec<Box<dyn Encryptor>> =
            vec![Box::new(PaddingEncryptor::new(64)), Box::new(rx)];

        let mut buf = [0u8; 256];
        buf[..9].copy_from_slice(b"chain msg");
        let len = encrypt_chain(&mut send, &mut buf, 9).unwrap();
        assert_eq!(len, 64 + AEAD_OVERHEAD);
        let len = decrypt_chain(&mut recv, &mut buf, len).unwrap();
        assert_eq!(&buf[..len], b"chain msg");
    }

    #[test]
    fn distinct_labels_derive_distinct_keys() {
        let a = derive_key("s", b"a").unwrap();
        let b = derive_key("s", b"b").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, derive_key("s", b"a").unwrap());

        let (send, recv) = derive_key_pair("s", b"a").unwrap();
        assert_ne!(send, recv);
    }
}
