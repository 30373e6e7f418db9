//! Nostr event model.

use std::cmp::Ordering;

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind used by clients to request deletion of earlier events.
pub const KIND_DELETION: u32 = 5;
/// Kind of follow lists, consumed by the trust network.
pub const KIND_CONTACTS: u32 = 3;
/// Kind of NIP-42 authentication events.
pub const KIND_AUTH: u32 = 22242;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – unique identifier for addressable events
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, e.g. `"p"`.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Storage behavior implied by an event's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Regular,
    /// Only the newest event per author and kind is kept.
    Replaceable,
    /// Relayed to live subscribers, never stored.
    Ephemeral,
    /// Only the newest event per author, kind and `d` tag is kept.
    Addressable,
}

impl KindClass {
    pub fn of(kind: u32) -> Self {
        match kind {
            0 | 3 | 10_000..=19_999 => KindClass::Replaceable,
            20_000..=29_999 => KindClass::Ephemeral,
            30_000..=39_999 => KindClass::Addressable,
            _ => KindClass::Regular,
        }
    }
}

/// Core Nostr event received from clients and persisted by the storage engines.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "17162c92...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["p", "..."], ["d", "slug"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `d` (identifier) or `p` (pubkey reference).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    pub fn kind_class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// Values of every tag named `name`, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Value of the first `d` tag, used by addressable events.
    pub fn d_tag(&self) -> Option<&str> {
        self.tag_values("d").next()
    }

    /// Key under which newer events supersede older ones, if the kind is replaceable.
    pub fn replacement_key(&self) -> Option<String> {
        match self.kind_class() {
            KindClass::Replaceable => Some(format!("{}:{}", self.pubkey, self.kind)),
            KindClass::Addressable => Some(format!(
                "{}:{}:{}",
                self.pubkey,
                self.kind,
                self.d_tag().unwrap_or_default()
            )),
            KindClass::Regular | KindClass::Ephemeral => None,
        }
    }

    /// Whether `self` wins over `other` for the same replacement key: newer
    /// timestamp first, lowest id on ties.
    pub fn supersedes(&self, other: &Event) -> bool {
        self.outranks(other.created_at, &other.id)
    }

    /// [`Event::supersedes`] against a holder known only by timestamp and id.
    pub fn outranks(&self, created_at: u64, id: &str) -> bool {
        match self.created_at.cmp(&created_at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.id.as_str() < id,
        }
    }
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
