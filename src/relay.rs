//! Relay facade: binds the policy chains and the storage backend into the
//! hooks the transport calls for every connection, filter and event.

use std::{collections::HashSet, net::IpAddr, sync::Arc};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::{
    event::{Event, KindClass, KIND_DELETION},
    filter::Filter,
    policy::{Chain, Rejection, Session},
    server::RelayInfo,
    storage::{self, EventStream, StorageBackend, StorageError, StorageResult},
};

/// Accepted events buffered for slow live subscribers.
const LIVE_BUFFER: usize = 1024;

/// Policy chains consulted by the relay.
#[derive(Default)]
pub struct Chains {
    pub connection: Chain<()>,
    pub filter: Chain<Filter>,
    pub event: Chain<Event>,
}

/// Result of handing an accepted event to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stored {
    /// Persisted (or applied as a replacement) and fanned out.
    Saved,
    /// Already known; nothing changed.
    Duplicate,
    /// Fanned out to live subscribers only.
    Ephemeral,
}

pub struct Relay {
    backend: Arc<dyn StorageBackend>,
    chains: Chains,
    info: RelayInfo,
    live: broadcast::Sender<Event>,
    verify_sig: bool,
    trust_proxy_headers: bool,
    service_url: Option<Url>,
    closing: CancellationToken,
}

impl Relay {
    pub fn new(backend: Arc<dyn StorageBackend>, chains: Chains, info: RelayInfo) -> Self {
        let (live, _) = broadcast::channel(LIVE_BUFFER);
        Self {
            backend,
            chains,
            info,
            live,
            verify_sig: true,
            trust_proxy_headers: false,
            service_url: None,
            closing: CancellationToken::new(),
        }
    }

    pub fn verify_signatures(mut self, on: bool) -> Self {
        self.verify_sig = on;
        self
    }

    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP`.
    pub fn trust_proxy_headers(mut self, on: bool) -> Self {
        self.trust_proxy_headers = on;
        self
    }

    /// URL clients must name in the `relay` tag of their AUTH events.
    /// Without one no AUTH is accepted.
    pub fn service_url(mut self, url: Url) -> Self {
        self.service_url = Some(url);
        self
    }

    /// Open connections end when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.closing = token;
        self
    }

    pub fn info(&self) -> &RelayInfo {
        &self.info
    }

    pub fn verifies_signatures(&self) -> bool {
        self.verify_sig
    }

    pub fn trusts_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }

    /// Whether `relay` names this relay: same host and port, any scheme.
    pub fn is_service_url(&self, relay: &str) -> bool {
        let (Some(ours), Ok(theirs)) = (&self.service_url, Url::parse(relay)) else {
            return false;
        };
        ours.host_str().is_some()
            && theirs.host_str() == ours.host_str()
            && theirs.port() == ours.port()
    }

    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Live feed of accepted events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }

    /// Gate a new connection before any per-connection state exists.
    pub fn on_connect(&self, ip: IpAddr) -> Result<(), Rejection> {
        self.chains.connection.check(&(), &Session::new(ip))
    }

    pub fn reject_filter(&self, filter: &Filter, session: &Session) -> Result<(), Rejection> {
        self.chains.filter.check(filter, session)
    }

    pub fn reject_event(&self, ev: &Event, session: &Session) -> Result<(), Rejection> {
        self.chains.event.check(ev, session)
    }

    /// Persist an accepted event according to its kind and fan it out.
    pub async fn store_event(&self, ev: Event) -> StorageResult<Stored> {
        let outcome = match ev.kind_class() {
            KindClass::Ephemeral => Stored::Ephemeral,
            KindClass::Replaceable | KindClass::Addressable => {
                let stored = ev.clone();
                self.blocking(move |b| b.replace(&stored)).await?;
                Stored::Saved
            }
            KindClass::Regular => {
                if ev.kind == KIND_DELETION {
                    self.apply_deletion(&ev).await?;
                }
                let stored = ev.clone();
                match self.blocking(move |b| b.save(&stored)).await {
                    Ok(()) => Stored::Saved,
                    Err(StorageError::Duplicate(_)) => Stored::Duplicate,
                    Err(e) => return Err(e),
                }
            }
        };
        if outcome != Stored::Duplicate {
            // no receivers is fine
            let _ = self.live.send(ev);
        }
        Ok(outcome)
    }

    /// Remove the `e`-referenced events written by the deletion's author.
    async fn apply_deletion(&self, deletion: &Event) -> StorageResult<()> {
        let ids: Vec<String> = deletion
            .tag_values("e")
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let targets = storage::collect(self.backend.query(Filter {
            ids: Some(ids),
            ..Default::default()
        }))
        .await?;
        for target in targets {
            if target.pubkey != deletion.pubkey || target.kind == KIND_DELETION {
                debug!("ignoring deletion of {} by {}", target.id, deletion.pubkey);
                continue;
            }
            let id = target.id.clone();
            self.blocking(move |b| b.delete(&target)).await?;
            info!("deleted {id} on request of {}", deletion.id);
        }
        Ok(())
    }

    pub fn query_events(&self, filter: Filter) -> EventStream {
        self.backend.query(filter)
    }

    pub async fn count_events(&self, filter: Filter) -> StorageResult<u64> {
        self.blocking(move |b| b.count(&filter)).await
    }

    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StorageBackend) -> StorageResult<T> + Send + 'static,
    {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || f(backend.as_ref()))
            .await
            .map_err(StorageError::write)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        testing::{sample_event, signed_event},
        Tag,
    };
    use crate::policy::{Admission, RateLimitConfig, RateLimiter};
    use crate::storage::LogBackend;
    use std::time::Duration;
    use tempfile::TempDir;

    fn relay(dir: &TempDir, chains: Chains) -> Relay {
        let backend = Arc::new(LogBackend::new(dir.path().to_path_buf()));
        backend.init().unwrap();
        Relay::new(backend, chains, RelayInfo::default())
    }

    async fn all(relay: &Relay) -> Vec<Event> {
        storage::collect(relay.query_events(Filter::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn dispatches_by_kind() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir, Chains::default());
        let mut live = relay.subscribe();

        let note = sample_event("aa11", "p1", 1, None, 1);
        assert_eq!(relay.store_event(note.clone()).await.unwrap(), Stored::Saved);
        assert_eq!(relay.store_event(note).await.unwrap(), Stored::Duplicate);

        let old = sample_event("bb22", "p1", 0, None, 1);
        let new = sample_event("cc33", "p1", 0, None, 2);
        relay.store_event(new).await.unwrap();
        relay.store_event(old).await.unwrap();

        let ephemeral = sample_event("dd44", "p1", 20_001, None, 3);
        assert_eq!(
            relay.store_event(ephemeral).await.unwrap(),
            Stored::Ephemeral
        );

        let ids: Vec<String> = all(&relay).await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["cc33", "aa11"]);
        assert_eq!(relay.count_events(Filter::default()).await.unwrap(), 2);

        let mut seen = vec![];
        while let Ok(ev) = live.try_recv() {
            seen.push(ev.id);
        }
        assert_eq!(seen.first().map(String::as_str), Some("aa11"));
        assert_eq!(seen.iter().filter(|id| *id == "aa11").count(), 1);
        assert!(seen.iter().any(|id| id == "cc33"));
        assert_eq!(seen.last().map(String::as_str), Some("dd44"));
    }

    #[tokio::test]
    async fn deletion_only_removes_own_events() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir, Chains::default());
        let mine = sample_event("aa11", "p1", 1, None, 1);
        let theirs = sample_event("bb22", "p2", 1, None, 1);
        relay.store_event(mine).await.unwrap();
        relay.store_event(theirs).await.unwrap();

        let mut deletion = sample_event("ee55", "p1", KIND_DELETION, None, 2);
        deletion.tags = vec![
            Tag(vec!["e".into(), "aa11".into()]),
            Tag(vec!["e".into(), "bb22".into()]),
        ];
        relay.store_event(deletion).await.unwrap();

        let ids: Vec<String> = all(&relay).await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["ee55", "bb22"]);
    }

    #[test]
    fn service_url_matches_on_host() {
        let dir = TempDir::new().unwrap();
        let relay = relay(&dir, Chains::default());
        assert!(!relay.is_service_url("wss://relay.example.com"));

        let relay = relay.service_url(Url::parse("https://relay.example.com/relay").unwrap());
        assert!(relay.is_service_url("wss://relay.example.com"));
        assert!(relay.is_service_url("wss://relay.example.com/"));
        assert!(relay.is_service_url("https://relay.example.com/relay"));
        assert!(!relay.is_service_url("wss://evil.example.com"));
        assert!(!relay.is_service_url("wss://relay.example.com:8443"));
        assert!(!relay.is_service_url("relay.example.com"));
    }

    #[tokio::test]
    async fn hooks_consult_chains() {
        let dir = TempDir::new().unwrap();
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(
            1,
            Duration::from_secs(60),
            1,
        )));
        let chains = Chains {
            connection: crate::policy::connection_chain(limiter.clone()),
            filter: Chain::new().with(crate::policy::NoEmptyFilters),
            event: crate::policy::event_chain(limiter, Admission::Whitelist(Arc::default())),
        };
        let relay = relay(&dir, chains);
        let ip = IpAddr::from([127, 0, 0, 1]);
        assert!(relay.on_connect(ip).is_ok());
        assert!(relay.on_connect(ip).is_err());
        let session = Session::new(IpAddr::from([127, 0, 0, 2]));
        assert!(relay.reject_filter(&Filter::default(), &session).is_err());
        let ev = signed_event(1, 1, 1, vec![], "hi");
        assert_eq!(
            relay.reject_event(&ev, &session).unwrap_err().reason(),
            "blocked: pubkey not whitelisted"
        );
    }
}
