//! Pubsub signaling: offer/answer exchange through a key-value document on
//! an external HTTP store (a GitHub gist). The payload is the common offer
//! format, DES-CBC encrypted under a key derived from the configured auth
//! key, then Base64 wrapped so it survives as document text.
//!
//! The publisher (active side) waits until a server-reflexive candidate is
//! known before the first publish; the subscriber polls, adopts the first
//! valid sender it sees and answers with its own candidates.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use pinhole_core::{Error, PeerId, Result, TimestampMs};
use pinhole_transport::{CandidateKind, CandidateList};

use crate::offer::Offer;
use crate::SignalEvent;

type DesCbcEnc = cbc::Encryptor<des::Des>;
type DesCbcDec = cbc::Decryptor<des::Des>;

/// Poll the store this often.
const POLL_INTERVAL_MS: u64 = 3_000;
/// Key used when no auth key is configured.
const DEFAULT_KEY: &str = "pinhole";

const OFFER_FIELD: &str = "offer";
const ANSWER_FIELD: &str = "answer";

/// Storage abstraction over the HTTP document store so the protocol logic
/// stays testable offline.
pub trait KvStore {
    fn load(&mut self, field: &str) -> Result<Option<String>>;
    fn store(&mut self, field: &str, value: &str) -> Result<()>;
}

/// GitHub gist backed store.
pub struct GistStore {
    agent: ureq::Agent,
    token: String,
    gist_id: String,
}

impl GistStore {
    pub fn new(token: &str, gist_id: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(4))
            .build();
        Self {
            agent,
            token: token.to_string(),
            gist_id: gist_id.to_string(),
        }
    }

    fn url(&self) -> String {
        format!("https://api.github.com/gists/{}", self.gist_id)
    }
}

impl KvStore for GistStore {
    fn load(&mut self, field: &str) -> Result<Option<String>> {
        let body: serde_json::Value = self
            .agent
            .get(&self.url())
            .set("Authorization", &format!("token {}", self.token))
            .set("User-Agent", "pinhole")
            .call()
            .map_err(|e| Error::signaling(e.to_string()))?
            .into_json()
            .map_err(|e| Error::signaling(e.to_string()))?;
        Ok(body["files"][field]["content"]
            .as_str()
            .map(|s| s.to_string()))
    }

    fn store(&mut self, field: &str, value: &str) -> Result<()> {
        let body = serde_json::json!({ "files": { field: { "content": value } } });
        self.agent
            .request("PATCH", &self.url())
            .set("Authorization", &format!("token {}", self.token))
            .set("User-Agent", "pinhole")
            .send_json(body)
            .map_err(|e| Error::signaling(e.to_string()))?;
        Ok(())
    }
}

fn derive_key_iv(auth_key: &str) -> ([u8; 8], [u8; 8]) {
    let digest = Sha256::digest(auth_key.as_bytes());
    let mut key = [0u8; 8];
    let mut iv = [0u8; 8];
    key.copy_from_slice(&digest[..8]);
    iv.copy_from_slice(&digest[8..16]);
    (key, iv)
}

/// Encrypt and wrap an offer payload for the document store.
pub fn seal(auth_key: &str, data: &[u8]) -> String {
    let (key, iv) = derive_key_iv(auth_key);
    // Key and IV lengths are fixed above.
    #[allow(clippy::expect_used)]
    let enc = DesCbcEnc::new_from_slices(&key, &iv).expect("des key/iv length");
    let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(data);
    BASE64.encode(ciphertext)
}

/// Unwrap and decrypt a document payload.
pub fn open(auth_key: &str, text: &str) -> Result<Vec<u8>> {
    let (key, iv) = derive_key_iv(auth_key);
    let ciphertext = BASE64
        .decode(text.trim())
        .map_err(|e| Error::signaling(format!("bad base64: {e}")))?;
    #[allow(clippy::expect_used)]
    let dec = DesCbcDec::new_from_slices(&key, &iv).expect("des key/iv length");
    dec.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Error::signaling("payload decryption failed"))
}

/// Which side of the exchange we play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Active: publishes the offer, polls for the answer.
    Publisher,
    /// Passive: polls for the offer, publishes the answer.
    Subscriber,
}

/// Pubsub signaling context for one session.
pub struct PubsubSignaling {
    store: Box<dyn KvStore + Send>,
    auth_key: String,
    local_id: PeerId,
    remote_id: Option<PeerId>,
    role: Role,
    published: bool,
    last_poll_ms: u64,
    /// `(sender, timestamp)` of the last processed payload, for dedup
    /// against re-delivery.
    last_processed: Option<(PeerId, u32)>,
}

impl PubsubSignaling {
    pub fn new(
        store: Box<dyn KvStore + Send>,
        local_id: PeerId,
        remote_id: Option<PeerId>,
        auth_key: Option<&str>,
    ) -> Self {
        Self {
            store,
            auth_key: auth_key.unwrap_or(DEFAULT_KEY).to_string(),
            local_id,
            remote_id,
            role: if remote_id.is_some() {
                Role::Publisher
            } else {
                Role::Subscriber
            },
            published: false,
            last_poll_ms: 0,
            last_processed: None,
        }
    }

    pub fn remote_id(&self) -> Option<PeerId> {
        self.remote_id
    }

    /// One tick: publish when ready, poll at the configured cadence.
    pub fn tick(&mut self, now_ms: u64, locals: &CandidateList) -> Vec<SignalEvent> {
        let mut events = Vec::new();

        if self.role == Role::Publisher && !self.published {
            let has_srflx = locals
                .iter()
                .any(|c| c.kind == CandidateKind::ServerReflexive);
            if has_srflx {
                if let Err(e) = self.publish(OFFER_FIELD, locals) {
                    warn!(error = %e, "offer publish failed");
                } else {
                    debug!("offer published");
                    self.published = true;
                }
            }
        }

        if now_ms.saturating_sub(self.last_poll_ms) < POLL_INTERVAL_MS && self.last_poll_ms != 0 {
            return events;
        }
        self.last_poll_ms = now_ms;

        let field = match self.role {
            Role::Publisher => ANSWER_FIELD,
            Role::Subscriber => OFFER_FIELD,
        };
        let text = match self.store.load(field) {
            Ok(Some(text)) if !text.is_empty() => text,
            Ok(_) => return events,
            Err(e) => {
                warn!(error = %e, "store poll failed");
                return events;
            }
        };
        let offer = match open(&self.auth_key, &text).and_then(|d| Offer::decode(&d)) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable payload");
                return events;
            }
        };
        if offer.sender == self.local_id {
            return events;
        }
        if !offer.target.is_empty() && offer.target != self.local_id {
            return events;
        }
        if self.last_processed == Some((offer.sender, offer.timestamp)) {
            return events;
        }
        self.last_processed = Some((offer.sender, offer.timestamp));

        let reconnection = self.remote_id.is_some() && self.role == Role::Subscriber;
        if self.role == Role::Subscriber {
            self.remote_id = Some(offer.sender);
        }
        if reconnection {
            events.push(SignalEvent::PeerReset(offer.sender));
        } else {
            events.push(SignalEvent::PeerLearned(offer.sender));
        }
        for cand in &offer.candidates {
            events.push(SignalEvent::RemoteCandidate(*cand));
        }
        events.push(SignalEvent::RemoteCandidatesDone);

        // The subscriber answers each fresh offer with its own candidates.
        if self.role == Role::Subscriber {
            if let Err(e) = self.publish(ANSWER_FIELD, locals) {
                warn!(error = %e, "answer publish failed");
            }
        }
        events
    }

    fn publish(&mut self, field: &str, locals: &CandidateList) -> Result<()> {
        let offer = Offer {
            sender: self.local_id,
            target: self.remote_id.unwrap_or(PeerId([0u8; 32])),
            timestamp: (TimestampMs::now().0 / 1000) as u32,
            delay_trigger: 0,
            candidates: locals.iter().copied().collect(),
        };
        let sealed = seal(&self.auth_key, &offer.encode());
        self.store.store(field, &sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinhole_transport::Candidate;
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct MemStore(Arc<Mutex<HashMap<String, String>>>);

    impl KvStore for MemStore {
        fn load(&mut self, field: &str) -> Result<Option<String>> {
            Ok(self.0.lock().unwrap().get(field).cloned())
        }
        fn store(&mut self, field: &str, value: &str) -> Result<()> {
            self.0.lock().unwrap().insert(field.into(), value.into());
            Ok(())
        }
    }

    fn candidates(with_srflx: bool) -> CandidateList {
        let mut list = CandidateList::new();
        list.push(Candidate::host(
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 2), 5000),
            0,
        ));
        if with_srflx {
            list.push(Candidate::server_reflexive(
                SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 40000),
                SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 2), 5000),
            ));
        }
        list
    }

    #[test]
    fn seal_open_roundtrip() {
        let sealed = seal("secret", b"some payload bytes");
        assert_eq!(open("secret", &sealed).unwrap(), b"some payload bytes");
        assert!(open("other", &sealed).is_err() || open("other", &sealed).unwrap() != b"some payload bytes");
    }

    #[test]
    fn publisher_waits_for_srflx() {
        let store = MemStore::default();
        let mut pubsig = PubsubSignaling::new(
            Box::new(store.clone()),
            PeerId::from("alice"),
            Some(PeerId::from("bob")),
            Some("k"),
        );
        pubsig.tick(1, &candidates(false));
        assert!(store.0.lock().unwrap().get(OFFER_FIELD).is_none());

        pubsig.tick(2, &candidates(true));
        assert!(store.0.lock().unwrap().get(OFFER_FIELD).is_some());
    }

    #[test]
    fn subscriber_adopts_sender_and_answers() {
        let store = MemStore::default();
        let mut publisher = PubsubSignaling::new(
            Box::new(store.clone()),
            PeerId::from("alice"),
            Some(PeerId::from("bob")),
            Some("k"),
        );
        publisher.tick(1, &candidates(true));

        let mut subscriber = PubsubSignaling::new(
            Box::new(store.clone()),
            PeerId::from("bob"),
            None,
            Some("k"),
        );
        let events = subscriber.tick(10, &candidates(true));
        assert!(events.contains(&SignalEvent::PeerLearned(PeerId::from("alice"))));
        assert!(events
            .iter()
            .any(|e| matches!(e, SignalEvent::RemoteCandidate(_))));
        assert_eq!(subscriber.remote_id(), Some(PeerId::from("alice")));
        assert!(store.0.lock().unwrap().get(ANSWER_FIELD).is_some());

        // Re-delivery of the same document is deduplicated.
        let events = subscriber.tick(20_000, &candidates(true));
        assert!(events.is_empty());

        // And the publisher sees the answer.
        let events = publisher.tick(20_000, &candidates(true));
        assert!(events.contains(&SignalEvent::PeerLearned(PeerId::from("bob"))));
    }

    #[test]
    fn wrong_key_payload_is_ignored() {
        let store = MemStore::default();
        store
            .0
            .lock()
            .unwrap()
            .insert(OFFER_FIELD.into(), seal("other-key", b"garbage"));
        let mut subscriber = PubsubSignaling::new(
            Box::new(store.clone()),
            PeerId::from("bob"),
            None,
            Some("k"),
        );
        assert!(subscriber.tick(10, &candidates(true)).is_empty());
    }

    #[test]
    fn foreign_target_is_ignored() {
        let store = MemStore::default();
        let mut publisher = PubsubSignaling::new(
            Box::new(store.clone()),
            PeerId::from("alice"),
            Some(PeerId::from("carol")),
            Some("k"),
        );
        publisher.tick(1, &candidates(true));

        let mut subscriber = PubsubSignaling::new(
            Box::new(store.clone()),
            PeerId::from("bob"),
            None,
            Some("k"),
        );
        assert!(subscriber.tick(10, &candidates(true)).is_empty());
    }
}
