//! NIP-01 websocket transport with NIP-42 authentication and NIP-45 counts.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{
    event::{verify_event, Event, KIND_AUTH},
    filter::Filter,
    identity::Identity,
    policy::Session,
    relay::{Relay, Stored},
    server,
};

/// Maximum clock skew accepted on AUTH events, in seconds.
const AUTH_WINDOW: u64 = 600;

/// Upgrade to a websocket, or describe the relay to plain HTTP clients.
pub async fn handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(relay): State<Arc<Relay>>,
) -> Response {
    let Ok(ws) = ws else {
        return server::describe(&headers, relay.info());
    };
    let ip = client_ip(&headers, peer, relay.trusts_proxy_headers());
    if let Err(rejection) = relay.on_connect(ip) {
        warn!("refusing connection from {ip}: {rejection}");
        return (StatusCode::TOO_MANY_REQUESTS, rejection.to_string()).into_response();
    }
    ws.on_upgrade(move |socket| Connection::new(relay, ip).run(socket))
}

/// Client address, honoring proxy headers only when configured to.
pub(crate) fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
        let real = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        if let Some(ip) = real {
            return ip;
        }
    }
    peer.ip()
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Per-socket state.
struct Connection {
    relay: Arc<Relay>,
    session: Session,
    challenge: String,
    subs: HashMap<String, Vec<Filter>>,
}

impl Connection {
    fn new(relay: Arc<Relay>, ip: IpAddr) -> Self {
        Self {
            relay,
            session: Session::new(ip),
            challenge: hex::encode(rand::random::<[u8; 16]>()),
            subs: HashMap::new(),
        }
    }

    async fn run(mut self, mut socket: WebSocket) {
        debug!("connection from {}", self.session.ip);
        let mut live = self.relay.subscribe();
        let closing = self.relay.closing().clone();
        if !send(&mut socket, json!(["AUTH", self.challenge])).await {
            return;
        }
        loop {
            tokio::select! {
                _ = closing.cancelled() => break,
                msg = socket.recv() => match msg {
                    Some(Ok(Message::Text(txt))) => {
                        if !self.handle(&mut socket, &txt).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("socket error from {}: {e}", self.session.ip);
                        break;
                    }
                },
                ev = live.recv() => match ev {
                    Ok(ev) => {
                        if !self.fan_out(&mut socket, &ev).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("{} lagged behind, {skipped} live events skipped", self.session.ip);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        let _ = socket.close().await;
        debug!("connection from {} closed", self.session.ip);
    }

    /// Forward a live event to every subscription it matches.
    async fn fan_out(&self, socket: &mut WebSocket, ev: &Event) -> bool {
        for (sub, filters) in &self.subs {
            if filters.iter().any(|f| f.matches(ev)) && !send(socket, json!(["EVENT", sub, ev])).await {
                return false;
            }
        }
        true
    }

    /// Handle one client message; `false` once the socket is unusable.
    async fn handle(&mut self, socket: &mut WebSocket, txt: &str) -> bool {
        let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(txt) else {
            return send(socket, json!(["NOTICE", "invalid: message is not a JSON array"])).await;
        };
        match arr.first().and_then(Value::as_str) {
            Some("EVENT") => self.on_event(socket, arr.get(1)).await,
            Some("REQ") => self.on_req(socket, &arr).await,
            Some("COUNT") => self.on_count(socket, &arr).await,
            Some("CLOSE") => {
                if let Some(sub) = arr.get(1).and_then(Value::as_str) {
                    self.subs.remove(sub);
                }
                true
            }
            Some("AUTH") => self.on_auth(socket, arr.get(1)).await,
            _ => send(socket, json!(["NOTICE", "invalid: unknown message type"])).await,
        }
    }

    async fn on_event(&mut self, socket: &mut WebSocket, raw: Option<&Value>) -> bool {
        let Some(Ok(ev)) = raw.map(|v| serde_json::from_value::<Event>(v.clone())) else {
            return send(socket, json!(["NOTICE", "invalid: malformed event"])).await;
        };
        let id = ev.id.clone();
        let (accepted, message) = self.accept(ev).await;
        send(socket, json!(["OK", id, accepted, message])).await
    }

    /// Verify, admit and store an event; the `OK` flag and message.
    async fn accept(&self, ev: Event) -> (bool, String) {
        if self.relay.verifies_signatures() && verify_event(&ev).is_err() {
            return (false, "invalid: bad event id or signature".into());
        }
        if let Err(rejection) = self.relay.reject_event(&ev, &self.session) {
            return (false, rejection.to_string());
        }
        let id = ev.id.clone();
        match self.relay.store_event(ev).await {
            Ok(Stored::Duplicate) => (true, "duplicate: already have this event".into()),
            Ok(_) => (true, String::new()),
            Err(e) => {
                warn!("storing {id} failed: {e}");
                (false, format!("error: {e}"))
            }
        }
    }

    /// Subscription id and filters of a REQ or COUNT message.
    fn parse_subscription(arr: &[Value]) -> Result<(String, Vec<Filter>), &'static str> {
        let sub = arr
            .get(1)
            .and_then(Value::as_str)
            .ok_or("invalid: missing subscription id")?;
        let filters = arr
            .get(2..)
            .unwrap_or_default()
            .iter()
            .map(Filter::from_value)
            .collect::<Option<Vec<_>>>()
            .ok_or("invalid: malformed filter")?;
        Ok((sub.to_string(), filters))
    }

    /// Run every filter through the filter chain.
    fn admit_filters(&self, filters: &[Filter]) -> Result<(), String> {
        for filter in filters {
            self.relay
                .reject_filter(filter, &self.session)
                .map_err(|r| r.to_string())?;
        }
        Ok(())
    }

    async fn on_req(&mut self, socket: &mut WebSocket, arr: &[Value]) -> bool {
        let (sub, filters) = match Self::parse_subscription(arr) {
            Ok(parsed) => parsed,
            Err(reason) => {
                let sub = arr.get(1).cloned().unwrap_or_default();
                return send(socket, json!(["CLOSED", sub, reason])).await;
            }
        };
        if let Err(reason) = self.admit_filters(&filters) {
            return send(socket, json!(["CLOSED", sub, reason])).await;
        }
        let mut seen = HashSet::new();
        for filter in &filters {
            let mut results = self.relay.query_events(filter.clone());
            while let Some(item) = results.next().await {
                match item {
                    Ok(ev) => {
                        if seen.insert(ev.id.clone()) && !send(socket, json!(["EVENT", sub, ev])).await {
                            return false;
                        }
                    }
                    Err(e) => {
                        warn!("query for {sub} failed: {e}");
                        self.subs.remove(&sub);
                        return send(socket, json!(["CLOSED", sub, format!("error: {e}")])).await;
                    }
                }
            }
        }
        self.subs.insert(sub.clone(), filters);
        send(socket, json!(["EOSE", sub])).await
    }

    async fn on_count(&mut self, socket: &mut WebSocket, arr: &[Value]) -> bool {
        let (sub, filters) = match Self::parse_subscription(arr) {
            Ok(parsed) => parsed,
            Err(reason) => {
                let sub = arr.get(1).cloned().unwrap_or_default();
                return send(socket, json!(["CLOSED", sub, reason])).await;
            }
        };
        if let Err(reason) = self.admit_filters(&filters) {
            return send(socket, json!(["CLOSED", sub, reason])).await;
        }
        let mut total = 0;
        for filter in filters {
            match self.relay.count_events(filter).await {
                Ok(n) => total += n,
                Err(e) => {
                    warn!("count for {sub} failed: {e}");
                    return send(socket, json!(["CLOSED", sub, format!("error: {e}")])).await;
                }
            }
        }
        send(socket, json!(["COUNT", sub, {"count": total}])).await
    }

    async fn on_auth(&mut self, socket: &mut WebSocket, raw: Option<&Value>) -> bool {
        let Some(Ok(ev)) = raw.map(|v| serde_json::from_value::<Event>(v.clone())) else {
            return send(socket, json!(["NOTICE", "invalid: malformed auth event"])).await;
        };
        let id = ev.id.clone();
        match self.check_auth(&ev) {
            Ok(identity) => {
                info!("{} authenticated as {identity}", self.session.ip);
                self.session.authed = Some(identity);
                send(socket, json!(["OK", id, true, ""])).await
            }
            Err(reason) => send(socket, json!(["OK", id, false, reason])).await,
        }
    }

    /// Validate a NIP-42 auth event against this connection's challenge.
    fn check_auth(&self, ev: &Event) -> Result<Identity, String> {
        if ev.kind != KIND_AUTH {
            return Err(format!("invalid: auth event must be kind {KIND_AUTH}"));
        }
        if ev.tag_values("challenge").next() != Some(self.challenge.as_str()) {
            return Err("invalid: challenge mismatch".into());
        }
        if !ev.tag_values("relay").any(|r| self.relay.is_service_url(r)) {
            return Err("invalid: auth event is for another relay".into());
        }
        if now().abs_diff(ev.created_at) > AUTH_WINDOW {
            return Err("invalid: auth event is too old or too far in the future".into());
        }
        verify_event(ev).map_err(|e| format!("invalid: {e}"))?;
        Identity::from_hex(&ev.pubkey).map_err(|e| format!("invalid: {e}"))
    }
}

async fn send(socket: &mut WebSocket, msg: Value) -> bool {
    socket.send(Message::Text(msg.to_string())).await.is_ok()
}
