//! Admission control: ordered chains of checks for connections, filters and
//! event writes.

pub mod rate_limit;
pub mod whitelist;

use std::{fmt, net::IpAddr, sync::Arc};

use tracing::debug;

use crate::{config::Limits, event::Event, filter::Filter, identity::Identity, trust::TrustNetwork};

pub use self::rate_limit::{RateLimitConfig, RateLimiter};
pub use self::whitelist::WhitelistSet;

/// Reason an operation was refused, prefixed per NIP-01 (`blocked:`,
/// `rate-limited:`, `invalid:`, `auth-required:`, `restricted:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection(String);

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Requester context available to every check.
#[derive(Debug, Clone)]
pub struct Session {
    pub ip: IpAddr,
    /// Identity proven through NIP-42, if any.
    pub authed: Option<Identity>,
}

impl Session {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip, authed: None }
    }
}

/// One admission check over subjects of type `T`.
pub trait Policy<T>: Send + Sync {
    fn check(&self, subject: &T, session: &Session) -> Result<(), Rejection>;
}

/// Checks evaluated in insertion order; the first rejection wins.
pub struct Chain<T> {
    checks: Vec<Box<dyn Policy<T>>>,
}

impl<T> Chain<T> {
    pub fn new() -> Self {
        Self { checks: vec![] }
    }

    pub fn with(mut self, check: impl Policy<T> + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    pub fn check(&self, subject: &T, session: &Session) -> Result<(), Rejection> {
        for check in &self.checks {
            if let Err(rejection) = check.check(subject, session) {
                debug!("rejected request from {}: {rejection}", session.ip);
                return Err(rejection);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn author(ev: &Event) -> Result<Identity, Rejection> {
    if ev.pubkey.trim().is_empty() {
        return Err(Rejection::new("invalid: missing author pubkey"));
    }
    Identity::from_hex(&ev.pubkey).map_err(|_| Rejection::new("invalid: malformed author pubkey"))
}

/// Connections per remote IP.
pub struct ConnectionRateLimit(pub Arc<RateLimiter>);

impl Policy<()> for ConnectionRateLimit {
    fn check(&self, _: &(), session: &Session) -> Result<(), Rejection> {
        if self.0.check(session.ip) {
            Ok(())
        } else {
            Err(Rejection::new("rate-limited: too many connections"))
        }
    }
}

/// Filters without any enumerated constraint would scan the whole store.
pub struct NoEmptyFilters;

impl Policy<Filter> for NoEmptyFilters {
    fn check(&self, filter: &Filter, _: &Session) -> Result<(), Rejection> {
        if filter.is_empty() {
            return Err(Rejection::new("blocked: can't handle empty filters"));
        }
        Ok(())
    }
}

pub struct NoComplexFilters;

impl Policy<Filter> for NoComplexFilters {
    fn check(&self, filter: &Filter, _: &Session) -> Result<(), Rejection> {
        if filter.is_complex() {
            return Err(Rejection::new("blocked: too many things to filter for"));
        }
        Ok(())
    }
}

/// Only the owner, authenticated through NIP-42, may read.
pub struct OwnerOnlyQueries(pub Identity);

impl Policy<Filter> for OwnerOnlyQueries {
    fn check(&self, _: &Filter, session: &Session) -> Result<(), Rejection> {
        if session.authed == Some(self.0) {
            return Ok(());
        }
        Err(Rejection::new(
            "auth-required: this query requires you to be authenticated",
        ))
    }
}

pub struct RequireAuthor;

impl Policy<Event> for RequireAuthor {
    fn check(&self, ev: &Event, _: &Session) -> Result<(), Rejection> {
        author(ev).map(|_| ())
    }
}

pub struct NoBase64Media;

impl Policy<Event> for NoBase64Media {
    fn check(&self, ev: &Event, _: &Session) -> Result<(), Rejection> {
        if ev.content.contains("data:image/") || ev.content.contains("data:video/") {
            return Err(Rejection::new("blocked: event with base64 media"));
        }
        Ok(())
    }
}

/// Event writes per remote IP.
pub struct EventRateLimit(pub Arc<RateLimiter>);

impl Policy<Event> for EventRateLimit {
    fn check(&self, _: &Event, session: &Session) -> Result<(), Rejection> {
        if self.0.check(session.ip) {
            Ok(())
        } else {
            Err(Rejection::new("rate-limited: slow down, please"))
        }
    }
}

/// Who may publish. Exactly one mode is active per deployment.
#[derive(Clone)]
pub enum Admission {
    /// Authors listed in a static file.
    Whitelist(Arc<WhitelistSet>),
    /// Authors inside the owner's trust network.
    Trust(Arc<TrustNetwork>),
    /// Only the owner, authenticated and signing their own events.
    Owner(Identity),
}

impl Admission {
    pub fn name(&self) -> &'static str {
        match self {
            Admission::Whitelist(_) => "whitelist",
            Admission::Trust(_) => "trust",
            Admission::Owner(_) => "owner",
        }
    }
}

impl Policy<Event> for Admission {
    fn check(&self, ev: &Event, session: &Session) -> Result<(), Rejection> {
        match self {
            Admission::Whitelist(set) => {
                if set.contains(&author(ev)?) {
                    Ok(())
                } else {
                    Err(Rejection::new("blocked: pubkey not whitelisted"))
                }
            }
            Admission::Trust(network) => {
                let Some(graph) = network.snapshot() else {
                    return Err(Rejection::new(
                        "blocked: trust network not yet initialized",
                    ));
                };
                if graph.contains(&author(ev)?) {
                    Ok(())
                } else {
                    Err(Rejection::new(
                        "blocked: pubkey not whitelisted by the trust network",
                    ))
                }
            }
            Admission::Owner(owner) => {
                let authed = match session.authed {
                    Some(id) if id == *owner => id,
                    _ => {
                        return Err(Rejection::new(
                            "auth-required: publishing this event requires authentication",
                        ))
                    }
                };
                if author(ev)? != authed {
                    return Err(Rejection::new(
                        "restricted: event author must match the authenticated pubkey",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Gate applied before the websocket upgrade.
pub fn connection_chain(limiter: Arc<RateLimiter>) -> Chain<()> {
    Chain::new().with(ConnectionRateLimit(limiter))
}

pub fn filter_chain(limits: &Limits, owner: Identity) -> Chain<Filter> {
    let mut chain = Chain::new();
    if !limits.allow_empty_filters {
        chain = chain.with(NoEmptyFilters);
    }
    if !limits.allow_complex_filters {
        chain = chain.with(NoComplexFilters);
    }
    if limits.query_auth_required {
        chain = chain.with(OwnerOnlyQueries(owner));
    }
    chain
}

pub fn event_chain(limiter: Arc<RateLimiter>, admission: Admission) -> Chain<Event> {
    Chain::new()
        .with(RequireAuthor)
        .with(NoBase64Media)
        .with(EventRateLimit(limiter))
        .with(admission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testing::{identity, sample_event};
    use crate::trust::TrustGraph;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(IpAddr::from([127, 0, 0, 1]))
    }

    fn generous() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitConfig::new(
            100,
            Duration::from_secs(60),
            100,
        )))
    }

    fn event_by(id: &Identity, content: &str) -> Event {
        let mut ev = sample_event("aa11", &id.to_hex(), 1, None, 1);
        ev.content = content.into();
        ev
    }

    fn reason(res: Result<(), Rejection>) -> String {
        res.unwrap_err().reason().to_string()
    }

    struct Fixed(&'static str);

    impl Policy<()> for Fixed {
        fn check(&self, _: &(), _: &Session) -> Result<(), Rejection> {
            Err(Rejection::new(self.0))
        }
    }

    #[test]
    fn chain_short_circuits_in_order() {
        let chain = Chain::new().with(Fixed("blocked: first")).with(Fixed("blocked: second"));
        assert_eq!(reason(chain.check(&(), &session())), "blocked: first");
        assert!(Chain::<()>::new().check(&(), &session()).is_ok());
    }

    #[test]
    fn empty_filter_toggle() {
        let strict = Limits {
            allow_empty_filters: false,
            ..Limits::default()
        };
        let owner = identity(1);
        let empty = Filter::default();
        assert_eq!(
            reason(filter_chain(&strict, owner).check(&empty, &session())),
            "blocked: can't handle empty filters"
        );
        assert!(filter_chain(&Limits::default(), owner)
            .check(&empty, &session())
            .is_ok());
    }

    #[test]
    fn complex_filters_blocked_when_disallowed() {
        let limits = Limits {
            allow_complex_filters: false,
            ..Limits::default()
        };
        let mut f = Filter {
            kinds: Some(vec![1, 2]),
            ..Default::default()
        };
        for letter in ['a', 'b', 'c'] {
            f.tags.insert(letter, vec!["x".into()]);
        }
        assert_eq!(
            reason(filter_chain(&limits, identity(1)).check(&f, &session())),
            "blocked: too many things to filter for"
        );
    }

    #[test]
    fn owner_only_queries() {
        let owner = identity(1);
        let limits = Limits {
            query_auth_required: true,
            ..Limits::default()
        };
        let chain = filter_chain(&limits, owner);
        let f = Filter {
            kinds: Some(vec![1]),
            ..Default::default()
        };
        let mut s = session();
        assert!(reason(chain.check(&f, &s)).starts_with("auth-required:"));
        s.authed = Some(identity(2));
        assert!(chain.check(&f, &s).is_err());
        s.authed = Some(owner);
        assert!(chain.check(&f, &s).is_ok());
    }

    #[test]
    fn whitelist_ordering() {
        let member = identity(1);
        let stranger = identity(2);
        let set: WhitelistSet = [member].into_iter().collect();
        let chain = event_chain(generous(), Admission::Whitelist(Arc::new(set)));
        let s = session();

        assert!(chain.check(&event_by(&member, "hi"), &s).is_ok());
        assert_eq!(
            reason(chain.check(&event_by(&stranger, "hi"), &s)),
            "blocked: pubkey not whitelisted"
        );
        // media check runs before membership
        assert_eq!(
            reason(chain.check(&event_by(&stranger, "data:image/png;base64,AAAA"), &s)),
            "blocked: event with base64 media"
        );
        let mut anonymous = event_by(&member, "hi");
        anonymous.pubkey.clear();
        assert_eq!(
            reason(chain.check(&anonymous, &s)),
            "invalid: missing author pubkey"
        );
        anonymous.pubkey = "xyz".into();
        assert_eq!(
            reason(chain.check(&anonymous, &s)),
            "invalid: malformed author pubkey"
        );
    }

    #[test]
    fn rate_limit_precedes_admission() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(
            1,
            Duration::from_secs(60),
            1,
        )));
        let chain = event_chain(limiter, Admission::Whitelist(Arc::default()));
        let ev = event_by(&identity(1), "hi");
        assert_eq!(
            reason(chain.check(&ev, &session())),
            "blocked: pubkey not whitelisted"
        );
        assert_eq!(
            reason(chain.check(&ev, &session())),
            "rate-limited: slow down, please"
        );
    }

    #[test]
    fn trust_mode_fails_closed_until_first_snapshot() {
        let owner = identity(1);
        let friend = identity(2);
        let network = Arc::new(TrustNetwork::new(owner, 1));
        let chain = event_chain(generous(), Admission::Trust(network.clone()));
        assert_eq!(
            reason(chain.check(&event_by(&owner, "hi"), &session())),
            "blocked: trust network not yet initialized"
        );
        network.install(TrustGraph::from_members([owner, friend]));
        assert!(chain.check(&event_by(&friend, "hi"), &session()).is_ok());
        assert_eq!(
            reason(chain.check(&event_by(&identity(3), "hi"), &session())),
            "blocked: pubkey not whitelisted by the trust network"
        );
    }

    #[test]
    fn owner_mode_requires_matching_auth() {
        let owner = identity(1);
        let chain = event_chain(generous(), Admission::Owner(owner));
        let mut s = session();
        let own = event_by(&owner, "hi");
        assert!(reason(chain.check(&own, &s)).starts_with("auth-required:"));
        s.authed = Some(identity(2));
        assert!(reason(chain.check(&event_by(&identity(2), "hi"), &s)).starts_with("auth-required:"));
        s.authed = Some(owner);
        assert!(chain.check(&own, &s).is_ok());
        assert_eq!(
            reason(chain.check(&event_by(&identity(2), "hi"), &s)),
            "restricted: event author must match the authenticated pubkey"
        );
    }

    #[test]
    fn connection_limiter_answers_with_reason() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(
            3,
            Duration::from_secs(300),
            9,
        )));
        let chain = connection_chain(limiter);
        for _ in 0..9 {
            assert!(chain.check(&(), &session()).is_ok());
        }
        assert_eq!(
            reason(chain.check(&(), &session())),
            "rate-limited: too many connections"
        );
    }
}
