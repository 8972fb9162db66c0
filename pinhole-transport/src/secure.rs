//! Datagram-security engine contract and the built-in PSK engine.
//!
//! The session core does not depend on any particular ciphersuite library;
//! it drives whatever implements [`SecurityEngine`], a push/pull codec in
//! place of BIO callbacks: ciphertext records go in, plaintext and records
//! to transmit come out, and the handshake suspends between ticks. Records
//! ride the reliable layer, so an engine may assume ordered, lossless
//! delivery.
//!
//! [`PskEngine`] is the reference engine: a two-round-trip pre-shared-key
//! handshake authenticated with HMAC-SHA256 and ChaCha20-Poly1305 record
//! protection. Certificate PKI is intentionally absent.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 32;
const TAG_CLIENT_HELLO: u8 = 1;
const TAG_SERVER_HELLO: u8 = 2;
const TAG_FINISHED: u8 = 3;
const TAG_DATA: u8 = 4;

/// Security-engine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecureError {
    #[error("record arrived in the wrong handshake state")]
    UnexpectedRecord,
    #[error("malformed record")]
    BadRecord,
    #[error("peer failed PSK authentication")]
    AuthFailed,
    #[error("record decryption failed")]
    DecryptFailed,
    #[error("plaintext offered before the handshake finished")]
    NotReady,
}

/// What one ciphertext offer produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    /// Application bytes decrypted from the record.
    pub plaintext: Vec<Vec<u8>>,
    /// Records the engine wants transmitted to the peer.
    pub transmit: Vec<Vec<u8>>,
}

/// Suspendable datagram-security engine: the session feeds it records and
/// plaintext and forwards whatever it asks to transmit.
pub trait SecurityEngine {
    /// Produce the opening flight (empty for the passive side).
    fn start(&mut self) -> Result<Vec<Vec<u8>>, SecureError>;
    /// Feed one record received from the peer.
    fn offer_ciphertext(&mut self, record: &[u8]) -> Result<EngineOutput, SecureError>;
    /// Protect application bytes into one record.
    fn offer_plaintext(&mut self, data: &[u8]) -> Result<Vec<u8>, SecureError>;
    /// True once application data may flow.
    fn handshake_done(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Start,
    /// Client: hello sent, waiting for the server hello.
    AwaitServerHello,
    /// Server: waiting for the client hello.
    AwaitClientHello,
    /// Server: hello sent, waiting for the client finished.
    AwaitFinished,
    Established,
}

/// Pre-shared-key engine. Both sides must be constructed with the same key
/// material; the handshake proves possession in both directions before any
/// data record is accepted.
pub struct PskEngine {
    is_server: bool,
    psk: Vec<u8>,
    state: HandshakeState,
    local_nonce: [u8; NONCE_LEN],
    remote_nonce: [u8; NONCE_LEN],
    send_key: Option<ChaCha20Poly1305>,
    recv_key: Option<ChaCha20Poly1305>,
    send_seq: u64,
    recv_seq: u64,
}

impl PskEngine {
    pub fn new(psk: &[u8], is_server: bool) -> Self {
        let mut local_nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut local_nonce);
        Self {
            is_server,
            psk: psk.to_vec(),
            state: HandshakeState::Start,
            local_nonce,
            remote_nonce: [0u8; NONCE_LEN],
            send_key: None,
            recv_key: None,
            send_seq: 0,
            recv_seq: 0,
        }
    }

    fn prf(&self, label: &str, client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
        // HMAC accepts keys of any length.
        #[allow(clippy::expect_used)]
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.psk).expect("hmac key");
        mac.update(label.as_bytes());
        mac.update(client_nonce);
        mac.update(server_nonce);
        mac.finalize().into_bytes().into()
    }

    fn derive_keys(&mut self) {
        let (client_nonce, server_nonce) = if self.is_server {
            (self.remote_nonce, self.local_nonce)
        } else {
            (self.local_nonce, self.remote_nonce)
        };
        let c2s = self.prf("client-data", &client_nonce, &server_nonce);
        let s2c = self.prf("server-data", &client_nonce, &server_nonce);
        let (send, recv) = if self.is_server { (s2c, c2s) } else { (c2s, s2c) };
        self.send_key = Some(ChaCha20Poly1305::new(Key::from_slice(&send)));
        self.recv_key = Some(ChaCha20Poly1305::new(Key::from_slice(&recv)));
    }

    fn verify_tag(&self, label: &str, client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
        self.prf(label, client_nonce, server_nonce)
    }

    fn record_nonce(seq: u64) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&seq.to_be_bytes());
        *Nonce::from_slice(&nonce)
    }
}

impl SecurityEngine for PskEngine {
    fn start(&mut self) -> Result<Vec<Vec<u8>>, SecureError> {
        if self.state != HandshakeState::Start {
            return Ok(Vec::new());
        }
        if self.is_server {
            self.state = HandshakeState::AwaitClientHello;
            return Ok(Vec::new());
        }
        self.state = HandshakeState::AwaitServerHello;
        let mut hello = Vec::with_capacity(1 + NONCE_LEN);
        hello.push(TAG_CLIENT_HELLO);
        hello.extend_from_slice(&self.local_nonce);
        Ok(vec![hello])
    }

    fn offer_ciphertext(&mut self, record: &[u8]) -> Result<EngineOutput, SecureError> {
        let (&tag, body) = record.split_first().ok_or(SecureError::BadRecord)?;
        let mut out = EngineOutput::default();
        match (tag, self.state) {
            (TAG_CLIENT_HELLO, HandshakeState::AwaitClientHello) => {
                if body.len() != NONCE_LEN {
                    return Err(SecureError::BadRecord);
                }
                self.remote_nonce.copy_from_slice(body);
                let verify =
                    self.verify_tag("server-verify", &self.remote_nonce, &self.local_nonce);
                let mut hello = Vec::with_capacity(1 + NONCE_LEN + 32);
                hello.push(TAG_SERVER_HELLO);
                hello.extend_from_slice(&self.local_nonce);
                hello.extend_from_slice(&verify);
                out.transmit.push(hello);
                self.state = HandshakeState::AwaitFinished;
            }
            (TAG_SERVER_HELLO, HandshakeState::AwaitServerHello) => {
                if body.len() != NONCE_LEN + 32 {
                    return Err(SecureError::BadRecord);
                }
                self.remote_nonce.copy_from_slice(&body[..NONCE_LEN]);
                let expected =
                    self.verify_tag("server-verify", &self.local_nonce, &self.remote_nonce);
                if body[NONCE_LEN..] != expected {
                    return Err(SecureError::AuthFailed);
                }
                let finished =
                    self.verify_tag("client-verify", &self.local_nonce, &self.remote_nonce);
                let mut record = Vec::with_capacity(1 + 32);
                record.push(TAG_FINISHED);
                record.extend_from_slice(&finished);
                out.transmit.push(record);
                self.derive_keys();
                self.state = HandshakeState::Established;
                debug!("psk handshake established (client)");
            }
            (TAG_FINISHED, HandshakeState::AwaitFinished) => {
                let expected =
                    self.verify_tag("client-verify", &self.remote_nonce, &self.local_nonce);
                if body != expected {
                    return Err(SecureError::AuthFailed);
                }
                self.derive_keys();
                self.state = HandshakeState::Established;
                debug!("psk handshake established (server)");
            }
            (TAG_DATA, HandshakeState::Established) => {
                if body.len() < 8 {
                    return Err(SecureError::BadRecord);
                }
                let seq = u64::from_be_bytes(body[..8].try_into().map_err(|_| SecureError::BadRecord)?);
                if seq != self.recv_seq {
                    return Err(SecureError::DecryptFailed);
                }
                let cipher = self.recv_key.as_ref().ok_or(SecureError::NotReady)?;
                let plaintext = cipher
                    .decrypt(&Self::record_nonce(seq), &body[8..])
                    .map_err(|_| SecureError::DecryptFailed)?;
                self.recv_seq += 1;
                out.plaintext.push(plaintext);
            }
            _ => return Err(SecureError::UnexpectedRecord),
        }
        Ok(out)
    }

    fn offer_plaintext(&mut self, data: &[u8]) -> Result<Vec<u8>, SecureError> {
        if self.state != HandshakeState::Established {
            return Err(SecureError::NotReady);
        }
        let cipher = self.send_key.as_ref().ok_or(SecureError::NotReady)?;
        let seq = self.send_seq;
        let ciphertext = cipher
            .encrypt(&Self::record_nonce(seq), data)
            .map_err(|_| SecureError::DecryptFailed)?;
        self.send_seq += 1;
        let mut record = Vec::with_capacity(1 + 8 + ciphertext.len());
        record.push(TAG_DATA);
        record.extend_from_slice(&seq.to_be_bytes());
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    fn handshake_done(&self) -> bool {
        self.state == HandshakeState::Established
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> (PskEngine, PskEngine) {
        let mut client = PskEngine::new(b"shared-secret", false);
        let mut server = PskEngine::new(b"shared-secret", true);

        assert!(server.start().unwrap().is_empty());
        let flight = client.start().unwrap();
        assert_eq!(flight.len(), 1);

        let out = server.offer_ciphertext(&flight[0]).unwrap();
        let out = client.offer_ciphertext(&out.transmit[0]).unwrap();
        assert!(client.handshake_done());
        server.offer_ciphertext(&out.transmit[0]).unwrap();
        assert!(server.handshake_done());
        (client, server)
    }

    #[test]
    fn full_handshake_and_bidirectional_data() {
        let (mut client, mut server) = handshake();

        let record = client.offer_plaintext(b"hello server").unwrap();
        let out = server.offer_ciphertext(&record).unwrap();
        assert_eq!(out.plaintext, vec![b"hello server".to_vec()]);

        let record = server.offer_plaintext(b"hello client").unwrap();
        let out = client.offer_ciphertext(&record).unwrap();
        assert_eq!(out.plaintext, vec![b"hello client".to_vec()]);
    }

    #[test]
    fn wrong_psk_fails_authentication() {
        let mut client = PskEngine::new(b"secret-a", false);
        let mut server = PskEngine::new(b"secret-b", true);
        server.start().unwrap();
        let flight = client.start().unwrap();
        let out = server.offer_ciphertext(&flight[0]).unwrap();
        assert_eq!(
            client.offer_ciphertext(&out.transmit[0]),
            Err(SecureError::AuthFailed)
        );
    }

    #[test]
    fn tampered_record_is_rejected() {
        let (mut client, mut server) = handshake();
        let mut record = client.offer_plaintext(b"payload").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xFF;
        assert_eq!(
            server.offer_ciphertext(&record),
            Err(SecureError::DecryptFailed)
        );
    }

    #[test]
    fn plaintext_before_handshake_is_refused() {
        let mut client = PskEngine::new(b"k", false);
        assert_eq!(client.offer_plaintext(b"x"), Err(SecureError::NotReady));
    }

    #[test]
    fn replayed_record_is_rejected() {
        let (mut client, mut server) = handshake();
        let record = client.offer_plaintext(b"once").unwrap();
        server.offer_ciphertext(&record).unwrap();
        assert_eq!(
            server.offer_ciphertext(&record),
            Err(SecureError::DecryptFailed)
        );
    }
}
