//! Trust network derived from the owner's contact lists.
//!
//! The graph is rebuilt wholesale on every refresh and installed with a single
//! pointer swap, so readers always see one complete generation.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    event::{verify_event, Event, KIND_CONTACTS},
    filter::Filter,
    identity::Identity,
    storage::{self, StorageBackend},
};

/// Authors requested per subscription when walking the graph.
const AUTHORS_PER_REQUEST: usize = 256;

/// One generation of trusted identities.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrustGraph {
    members: HashSet<Identity>,
}

impl TrustGraph {
    pub fn from_members(members: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.members.iter()
    }
}

/// Where contact lists are read from.
#[derive(Clone)]
pub enum FollowSource {
    /// Contact lists already stored by this relay.
    Store(Arc<dyn StorageBackend>),
    /// Upstream relays queried over websocket, optionally through SOCKS5.
    Relays {
        urls: Vec<String>,
        socks: Option<String>,
        timeout: Duration,
    },
}

impl FollowSource {
    /// Follows declared by the newest contact list of each author.
    async fn follows(&self, authors: &[Identity]) -> Result<HashMap<Identity, Vec<Identity>>> {
        let mut newest: HashMap<String, Event> = HashMap::new();
        for chunk in authors.chunks(AUTHORS_PER_REQUEST) {
            let filter = Filter {
                authors: Some(chunk.iter().map(Identity::to_hex).collect()),
                kinds: Some(vec![KIND_CONTACTS]),
                ..Default::default()
            };
            for ev in self.contact_lists(filter).await? {
                let keep = newest
                    .get(&ev.pubkey)
                    .map_or(true, |current| ev.supersedes(current));
                if keep {
                    newest.insert(ev.pubkey.clone(), ev);
                }
            }
        }
        let mut out = HashMap::new();
        for (pubkey, ev) in newest {
            let Ok(author) = Identity::from_hex(&pubkey) else {
                continue;
            };
            let follows = ev
                .tag_values("p")
                .filter_map(|p| Identity::from_hex(p).ok())
                .collect();
            out.insert(author, follows);
        }
        Ok(out)
    }

    async fn contact_lists(&self, filter: Filter) -> Result<Vec<Event>> {
        match self {
            FollowSource::Store(backend) => Ok(storage::collect(backend.query(filter)).await?),
            FollowSource::Relays {
                urls,
                socks,
                timeout,
            } => {
                let mut events = vec![];
                let mut reached = 0;
                for url in urls {
                    match fetch_events(url, socks.as_deref(), &filter, *timeout).await {
                        Ok(fetched) => {
                            reached += 1;
                            events.extend(fetched.into_iter().filter(|ev| {
                                let valid = ev.kind == KIND_CONTACTS && verify_event(ev).is_ok();
                                if !valid {
                                    debug!("dropping invalid contact list {} from {url}", ev.id);
                                }
                                valid
                            }));
                        }
                        Err(e) => warn!("trust fetch from {url} failed: {e}"),
                    }
                }
                if reached == 0 {
                    return Err(anyhow!("no trust relay reachable"));
                }
                Ok(events)
            }
        }
    }
}

/// Shared, atomically swapped trust graph for one owner.
pub struct TrustNetwork {
    owner: Identity,
    depth: u8,
    graph: RwLock<Option<Arc<TrustGraph>>>,
}

impl TrustNetwork {
    /// `depth` 1 trusts the owner's follows, 2 also their follows.
    pub fn new(owner: Identity, depth: u8) -> Self {
        Self {
            owner,
            depth: depth.clamp(1, 2),
            graph: RwLock::new(None),
        }
    }

    pub fn owner(&self) -> Identity {
        self.owner
    }

    /// Current generation, or `None` before the first successful refresh.
    pub fn snapshot(&self) -> Option<Arc<TrustGraph>> {
        let guard = self.graph.read().unwrap_or_else(|poisoned| {
            warn!("trust graph lock was poisoned, recovering");
            poisoned.into_inner()
        });
        guard.clone()
    }

    pub fn install(&self, graph: TrustGraph) {
        let next = Arc::new(graph);
        let mut guard = self.graph.write().unwrap_or_else(|poisoned| {
            warn!("trust graph lock was poisoned, recovering");
            poisoned.into_inner()
        });
        *guard = Some(next);
    }

    /// Walk contact lists outward from the owner.
    pub async fn build(&self, source: &FollowSource) -> Result<TrustGraph> {
        let mut members = HashSet::from([self.owner]);
        let mut frontier = vec![self.owner];
        for _ in 0..self.depth {
            let lists = source.follows(&frontier).await?;
            let mut next = vec![];
            for follows in lists.into_values() {
                for id in follows {
                    if members.insert(id) {
                        next.push(id);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(TrustGraph { members })
    }

    /// Rebuild and install a new generation; the old one stays on failure.
    pub async fn refresh(&self, source: &FollowSource) -> Result<usize> {
        let graph = self.build(source).await?;
        let size = graph.len();
        self.install(graph);
        Ok(size)
    }

    /// Refresh now and then every `interval` until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        source: FollowSource,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.refresh(&source) => match res {
                    Ok(size) => info!("trust network refreshed: {size} trusted pubkeys"),
                    Err(e) => warn!("trust network refresh failed, keeping previous snapshot: {e}"),
                },
            }
        }
        debug!("trust refresh loop stopped");
    }
}

/// Subscribe with `filter` on `relay` and collect events until EOSE.
async fn fetch_events(
    relay: &str,
    socks: Option<&str>,
    filter: &Filter,
    timeout: Duration,
) -> Result<Vec<Event>> {
    let fetch = async {
        let mut ws = connect_ws(relay, socks).await?;
        let sub = "trust";
        let req = serde_json::json!(["REQ", sub, filter.to_value()]);
        ws.send(Message::Text(req.to_string())).await?;
        let mut events = vec![];
        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Text(txt) => {
                    let Ok(val) = serde_json::from_str::<Value>(&txt) else {
                        continue;
                    };
                    match val.get(0).and_then(Value::as_str) {
                        Some("EVENT") => {
                            if let Some(Ok(ev)) =
                                val.get(2).map(|v| serde_json::from_value::<Event>(v.clone()))
                            {
                                events.push(ev);
                            }
                        }
                        Some("EOSE") => break,
                        Some("CLOSED") => {
                            let reason = val.get(2).and_then(Value::as_str).unwrap_or_default();
                            return Err(anyhow!("subscription closed by {relay}: {reason}"));
                        }
                        _ => {}
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        let close = serde_json::json!(["CLOSE", sub]);
        let _ = ws.send(Message::Text(close.to_string())).await;
        let _ = ws.close(None).await;
        Ok(events)
    };
    tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| anyhow!("timed out fetching from {relay}"))?
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
