//! Password-authenticated session encryption.
//!
//! Encryption is all-or-nothing per cluster: when a password is configured,
//! each connection runs an ephemeral secp256k1 Diffie-Hellman exchange right
//! after the greeting and derives two directional ChaCha20-Poly1305 keys via
//! HKDF-SHA256, salted with the hash of the shared password. Possession of
//! the password is what authenticates the exchange: a peer with the wrong
//! password derives different keys and its first sealed frame fails to open.
//!
//! Nonces are 96-bit: a 4-byte zero prefix then a per-direction 64-bit send
//! counter, never transmitted. Both TCP frames and UDP payloads of one
//! direction share that direction's counter; within one connection TCP
//! preserves order, and UDP heartbeats tolerate loss by trial decryption
//! against a small counter window.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// AEAD authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Serialized (compressed) ephemeral public key size.
pub const PUBKEY_SIZE: usize = 33;

/// How many consecutive lost datagrams a UDP receiver tolerates before
/// giving up on resynchronizing its receive counter.
const UDP_COUNTER_WINDOW: u64 = 32;

/// Errors from session key establishment or sealed-frame processing.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed ephemeral public key")]
    MalformedPublicKey,

    #[error("failed to open sealed message")]
    DecryptFailed,

    #[error("failed to seal message")]
    EncryptFailed,

    #[error("nonce counter exhausted")]
    NonceExhausted,
}

/// Ephemeral keypair for one connection's key exchange.
pub struct KeyExchange {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyExchange {
    /// Generate a fresh ephemeral keypair.
    pub fn new() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut OsRng);
        KeyExchange { secret, public }
    }

    /// Our public key, sent to the remote in plaintext.
    pub fn public_bytes(&self) -> [u8; PUBKEY_SIZE] {
        self.public.serialize()
    }

    /// Complete the exchange, consuming the ephemeral secret.
    ///
    /// `outbound` states whether we initiated the connection; it picks which
    /// derived key is used for sending and which for receiving, so that the
    /// two ends agree.
    pub fn establish(
        self,
        remote_public: &[u8],
        password: &[u8],
        outbound: bool,
    ) -> Result<SessionKeys, CryptoError> {
        let remote =
            PublicKey::from_slice(remote_public).map_err(|_| CryptoError::MalformedPublicKey)?;
        let shared = SharedSecret::new(&remote, &self.secret);

        let salt = Sha256::digest(password);
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_ref());
        let mut okm = [0u8; 64];
        hk.expand(b"weave session keys", &mut okm)
            .expect("64 bytes is a valid hkdf output length");

        let mut initiator_key = [0u8; 32];
        let mut responder_key = [0u8; 32];
        initiator_key.copy_from_slice(&okm[..32]);
        responder_key.copy_from_slice(&okm[32..]);

        let (send_key, recv_key) =
            if outbound { (initiator_key, responder_key) } else { (responder_key, initiator_key) };

        Ok(SessionKeys {
            send: CipherState::new(send_key),
            recv: CipherState::new(recv_key),
            udp_send: CipherState::new(send_key),
            udp_recv: CipherState::new(recv_key),
        })
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// The four directional cipher states of one established connection.
///
/// TCP and UDP run independent counters over the same directional keys;
/// TCP counters advance in lockstep on both ends, UDP receive counters
/// resynchronize across datagram loss.
pub struct SessionKeys {
    pub send: CipherState,
    pub recv: CipherState,
    pub udp_send: CipherState,
    pub udp_recv: CipherState,
}

/// One direction's AEAD key plus its monotonic nonce counter.
pub struct CipherState {
    key: [u8; 32],
    counter: u64,
}

impl CipherState {
    fn new(key: [u8; 32]) -> Self {
        CipherState { key, counter: 0 }
    }

    fn nonce(counter: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        Nonce::from(bytes)
    }

    /// Seal a message with the next counter value.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.counter;
        self.counter = self.counter.checked_add(1).ok_or(CryptoError::NonceExhausted)?;
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::EncryptFailed)?;
        cipher.encrypt(&Self::nonce(counter), plaintext).map_err(|_| CryptoError::EncryptFailed)
    }

    /// Open a message sealed with exactly the next counter value.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::DecryptFailed)?;
        let plaintext = cipher
            .decrypt(&Self::nonce(self.counter), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        self.counter = self.counter.checked_add(1).ok_or(CryptoError::NonceExhausted)?;
        Ok(plaintext)
    }

    /// Open a datagram that may have skipped counters due to packet loss.
    ///
    /// Tries the expected counter first, then a bounded window ahead. On
    /// success the receive counter jumps past the counter that worked, which
    /// also rejects replayed or reordered datagrams.
    pub fn open_lossy(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::DecryptFailed)?;
        for offset in 0..UDP_COUNTER_WINDOW {
            let counter = match self.counter.checked_add(offset) {
                Some(c) => c,
                None => break,
            };
            if let Ok(plaintext) = cipher.decrypt(&Self::nonce(counter), ciphertext) {
                self.counter = counter.checked_add(1).ok_or(CryptoError::NonceExhausted)?;
                return Ok(plaintext);
            }
        }
        Err(CryptoError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(pw_a: &[u8], pw_b: &[u8]) -> (SessionKeys, SessionKeys) {
        let a = KeyExchange::new();
        let b = KeyExchange::new();
        let a_pub = a.public_bytes();
        let b_pub = b.public_bytes();
        let keys_a = a.establish(&b_pub, pw_a, true).unwrap();
        let keys_b = b.establish(&a_pub, pw_b, false).unwrap();
        (keys_a, keys_b)
    }

    #[test]
    fn test_seal_open_both_directions() {
        let (mut a, mut b) = handshake(b"s3cret", b"s3cret");

        let sealed = a.send.seal(b"hello").unwrap();
        assert_eq!(b.recv.open(&sealed).unwrap(), b"hello");

        let sealed = b.send.seal(b"world").unwrap();
        assert_eq!(a.recv.open(&sealed).unwrap(), b"world");
    }

    #[test]
    fn test_wrong_password_fails_to_open() {
        let (mut a, mut b) = handshake(b"foo", b"bar");
        let sealed = a.send.seal(b"hello").unwrap();
        assert!(matches!(b.recv.open(&sealed), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn test_counter_mismatch_fails() {
        let (mut a, mut b) = handshake(b"pw", b"pw");
        let first = a.send.seal(b"one").unwrap();
        let second = a.send.seal(b"two").unwrap();
        // Strict opener refuses out-of-order delivery.
        assert!(b.recv.open(&second).is_err());
        assert_eq!(b.recv.open(&first).unwrap(), b"one");
    }

    #[test]
    fn test_lossy_open_skips_lost_datagrams() {
        let (mut a, mut b) = handshake(b"pw", b"pw");
        let _lost = a.udp_send.seal(b"lost").unwrap();
        let _lost = a.udp_send.seal(b"also lost").unwrap();
        let delivered = a.udp_send.seal(b"heartbeat").unwrap();
        assert_eq!(b.udp_recv.open_lossy(&delivered).unwrap(), b"heartbeat");

        // Replay of the same datagram is rejected: counter has moved on.
        assert!(b.udp_recv.open_lossy(&delivered).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (mut a, mut b) = handshake(b"pw", b"pw");
        let mut sealed = a.send.seal(b"hello").unwrap();
        sealed[0] ^= 0x80;
        assert!(b.recv.open(&sealed).is_err());
    }

    #[test]
    fn test_malformed_public_key() {
        let kx = KeyExchange::new();
        assert!(matches!(
            kx.establish(&[0u8; PUBKEY_SIZE], b"pw", true),
            Err(CryptoError::MalformedPublicKey)
        ));
    }
}
