//! Live view of the services announcing on the bus.
//!
//! Admission dedups by fingerprint plus identity and keeps only the
//! freshest timestamp among live entries. Entries expire after
//! `send_interval * multiplier` unless they came from a permanent source.
//! Expiry is evaluated lazily on every access and by
//! [`DiscoveryRegistry::purge_expired`]. Connection failures are tracked per
//! endpoint URI.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::access::Authorizer;
use super::action::ActionDescriptor;
use super::descriptor::{DescriptorError, ServiceDescriptor};
use crate::config::DiscoveryConfig;

/// Where a blob came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Periodic announcement; expires on silence.
    Broadcast,
    /// Authoritative feed such as a cache file; never expires on its own.
    Permanent,
}

/// Outcome of [`DiscoveryRegistry::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// New or fresher descriptor admitted and indexed.
    Admitted,
    /// Byte-identical to the live descriptor; expiry pushed back.
    Refreshed,
    /// Timestamp not newer than the live descriptor for this instance.
    Stale,
    /// Signature does not verify.
    Invalid,
    /// Blob could not be parsed.
    Malformed(DescriptorError),
}

/// A lookup result: one endpoint able to serve the requested action.
#[derive(Debug, Clone)]
pub struct ActionTarget {
    /// The action as the endpoint declared it. For CRUD aliases this is the
    /// concrete action, not the alias.
    pub action: ActionDescriptor,
    /// Announcing instance.
    pub descriptor: Arc<ServiceDescriptor>,
    /// Per-action timeout.
    pub timeout: Duration,
}

impl ActionTarget {
    /// Endpoint URI.
    pub fn uri(&self) -> &str {
        &self.descriptor.uri
    }

    /// Expected certificate fingerprint of the endpoint.
    pub fn fingerprint(&self) -> &str {
        self.descriptor.fingerprint()
    }

    /// Instance identity.
    pub fn identity(&self) -> &str {
        &self.descriptor.identity
    }
}

struct Entry {
    descriptor: Arc<ServiceDescriptor>,
    source: Source,
    expires: Option<Instant>,
}

#[derive(Default)]
struct Failures {
    at: VecDeque<Instant>,
    reactivate: Option<Instant>,
}

impl Failures {
    fn is_failed(&self, now: Instant) -> bool {
        self.reactivate.is_some_and(|at| now < at)
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .at
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            self.at.pop_front();
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    by_blob: HashMap<Bytes, String>,
    // index key -> dedup key -> declared action
    index: BTreeMap<String, BTreeMap<String, ActionDescriptor>>,
    // endpoint uri -> recent connection failures
    failures: HashMap<String, Failures>,
}

impl Inner {
    fn is_failed(&self, uri: &str, now: Instant) -> bool {
        self.failures.get(uri).is_some_and(|f| f.is_failed(now))
    }
}

struct Shared {
    config: DiscoveryConfig,
    authorizer: Arc<dyn Authorizer>,
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
}

/// Discovery registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DiscoveryRegistry {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DiscoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryRegistry")
            .field("sector", &self.shared.config.default_sector)
            .finish_non_exhaustive()
    }
}

impl DiscoveryRegistry {
    /// Empty registry for the configured sector.
    pub fn new(config: DiscoveryConfig, authorizer: impl Authorizer + 'static) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                config,
                authorizer: Arc::new(authorizer),
                inner: Mutex::new(Inner::default()),
                changes,
            }),
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.shared.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn changed(&self) {
        self.shared.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Receiver bumped on every change to the set of live descriptors.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// When an entry admitted at `now` lapses. `None` never lapses, which
    /// includes intervals too large to represent.
    fn expiry(&self, descriptor: &ServiceDescriptor, source: Source, now: Instant) -> Option<Instant> {
        match source {
            Source::Permanent => None,
            Source::Broadcast => {
                let secs = descriptor.send_interval.as_secs_f64() * self.shared.config.expiry_multiplier;
                let expires = Duration::try_from_secs_f64(secs)
                    .ok()
                    .and_then(|ttl| now.checked_add(ttl));
                if expires.is_none() {
                    debug!(identity = %descriptor.identity, secs, "announcement interval too large to expire");
                }
                expires
            }
        }
    }

    /// Parse, verify and admit one blob.
    pub fn ingest(&self, blob: &[u8], source: Source) -> Admission {
        let now = Instant::now();
        let purged = {
            let mut inner = self.lock();
            let purged = self.purge_locked(&mut inner, now);
            if let Some(key) = inner.by_blob.get(blob).cloned() {
                if let Some(entry) = inner.entries.get_mut(&key) {
                    if entry.source == Source::Broadcast {
                        entry.source = source;
                    }
                    entry.expires = self.expiry(&entry.descriptor, entry.source, now);
                    trace!(key = %key, "refreshed descriptor");
                    drop(inner);
                    if purged {
                        self.changed();
                    }
                    return Admission::Refreshed;
                }
            }
            purged
        };
        if purged {
            self.changed();
        }

        let descriptor = match ServiceDescriptor::parse(blob) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "dropping malformed announcement");
                return Admission::Malformed(e);
            }
        };
        if !descriptor.is_valid() {
            info!(identity = %descriptor.identity, "dropping announcement with invalid signature");
            return Admission::Invalid;
        }

        let outcome = {
            let mut inner = self.lock();
            self.admit_locked(&mut inner, Arc::new(descriptor), source, now)
        };
        if outcome == Admission::Admitted {
            self.changed();
        }
        outcome
    }

    fn admit_locked(
        &self,
        inner: &mut Inner,
        descriptor: Arc<ServiceDescriptor>,
        source: Source,
        now: Instant,
    ) -> Admission {
        let key = descriptor.dedup_key();
        if let Some(live) = inner.entries.get(&key) {
            if descriptor.timestamp <= live.descriptor.timestamp {
                debug!(
                    identity = %descriptor.identity,
                    timestamp = descriptor.timestamp,
                    live = live.descriptor.timestamp,
                    "dropping stale announcement"
                );
                return Admission::Stale;
            }
        }

        let expires = self.expiry(&descriptor, source, now);
        self.remove_locked(inner, &key);
        self.index_locked(inner, &key, &descriptor);
        inner.by_blob.insert(descriptor.raw().clone(), key.clone());
        debug!(
            identity = %descriptor.identity,
            uri = %descriptor.uri,
            actions = descriptor.actions.len(),
            "admitted descriptor"
        );
        inner.entries.insert(
            key,
            Entry {
                descriptor,
                source,
                expires,
            },
        );
        Admission::Admitted
    }

    fn index_locked(&self, inner: &mut Inner, key: &str, descriptor: &ServiceDescriptor) {
        let sector = &self.shared.config.default_sector;
        for action in &descriptor.actions {
            let name = &action.name;
            if !name.sector.eq_ignore_ascii_case(sector) {
                continue;
            }
            if name.sector.contains(':') || name.name.contains('.') {
                continue;
            }
            if !self
                .shared
                .authorizer
                .authorized(descriptor.fingerprint(), &name.sector, &name.qualified())
            {
                trace!(
                    fingerprint = %descriptor.fingerprint(),
                    action = %name,
                    "not authorized to serve action"
                );
                continue;
            }
            for alias in action.index_names() {
                inner
                    .index
                    .entry(alias.index_key())
                    .or_default()
                    .insert(key.to_string(), action.clone());
            }
        }
    }

    fn remove_locked(&self, inner: &mut Inner, key: &str) -> Option<Entry> {
        let entry = inner.entries.remove(key)?;
        inner.by_blob.remove(entry.descriptor.raw());
        inner.index.retain(|_, providers| {
            providers.remove(key);
            !providers.is_empty()
        });
        Some(entry)
    }

    fn purge_locked(&self, inner: &mut Inner, now: Instant) -> bool {
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = self.remove_locked(inner, key) {
                debug!(identity = %entry.descriptor.identity, "descriptor expired");
            }
        }

        let window = self.shared.config.failure_window;
        inner.failures.retain(|_, failures| {
            failures.prune(now, window);
            failures.is_failed(now) || !failures.at.is_empty()
        });
        !expired.is_empty()
    }

    /// Drop every descriptor whose expiry has passed.
    pub fn purge_expired(&self) {
        let removed = {
            let mut inner = self.lock();
            self.purge_locked(&mut inner, Instant::now())
        };
        if removed {
            self.changed();
        }
    }

    /// Replace the contents that came from `source` with `blobs`.
    ///
    /// Entries from `source` are set aside first. Blobs byte-identical to a
    /// set-aside descriptor are restored without re-parsing; anything still
    /// set aside at the end is dropped. Entries from other sources are left
    /// alone, except that a blob identical to one of them adopts `source`.
    pub fn reload<I, B>(&self, blobs: I, source: Source)
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let now = Instant::now();
        let mut stash: HashMap<String, Entry> = {
            let mut inner = self.lock();
            let keys: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.source == source)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| self.remove_locked(&mut inner, &k).map(|e| (k, e)))
                .collect()
        };
        let mut stash_by_blob: HashMap<Bytes, String> = stash
            .iter()
            .map(|(k, e)| (e.descriptor.raw().clone(), k.clone()))
            .collect();

        let mut restored = 0usize;
        let mut admitted = 0usize;
        for blob in blobs {
            let blob = blob.as_ref();
            if let Some(entry) = stash_by_blob.remove(blob).and_then(|k| stash.remove(&k)) {
                let mut inner = self.lock();
                let key = entry.descriptor.dedup_key();
                if inner.entries.contains_key(&key) {
                    // superseded by a live entry from another source
                    continue;
                }
                self.index_locked(&mut inner, &key, &entry.descriptor);
                inner.by_blob.insert(entry.descriptor.raw().clone(), key.clone());
                let expires = self.expiry(&entry.descriptor, source, now);
                inner.entries.insert(key, Entry { expires, ..entry });
                restored += 1;
                continue;
            }
            {
                let mut inner = self.lock();
                if let Some(key) = inner.by_blob.get(blob).cloned() {
                    if let Some(entry) = inner.entries.get_mut(&key) {
                        entry.source = source;
                        entry.expires = self.expiry(&entry.descriptor, source, now);
                        restored += 1;
                        continue;
                    }
                }
            }
            let descriptor = match ServiceDescriptor::parse(blob) {
                Ok(d) if d.is_valid() => d,
                Ok(d) => {
                    info!(identity = %d.identity, "dropping cached descriptor with invalid signature");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "dropping malformed cached descriptor");
                    continue;
                }
            };
            let mut inner = self.lock();
            if self.admit_locked(&mut inner, Arc::new(descriptor), source, now) == Admission::Admitted {
                admitted += 1;
            }
        }
        debug!(restored, admitted, dropped = stash.len(), "reloaded descriptors");
        self.changed();
    }

    /// Choose an endpoint for `action` (`namespace.name`) at `version`
    /// accepting `envelope`, optionally restricted to one instance.
    pub fn lookup(
        &self,
        action: &str,
        version: u32,
        envelope: &str,
        target: Option<&str>,
    ) -> Option<ActionTarget> {
        let now = Instant::now();
        let key = format!(
            "{}:{}.v{}",
            self.shared.config.default_sector,
            action,
            version.max(1)
        )
        .to_lowercase();

        let mut inner = self.lock();
        if self.purge_locked(&mut inner, now) {
            self.changed();
        }
        let providers = inner.index.get(&key)?;

        let mut healthy = Vec::new();
        let mut failing = Vec::new();
        for (dedup, declared) in providers {
            let Some(entry) = inner.entries.get(dedup) else {
                continue;
            };
            if !declared.accepts(envelope) {
                continue;
            }
            if target.is_some_and(|t| t != entry.descriptor.identity) {
                continue;
            }
            if !entry.descriptor.is_valid() {
                continue;
            }
            let candidate = (declared, entry);
            if inner.is_failed(&entry.descriptor.uri, now) {
                failing.push(candidate);
            } else {
                healthy.push(candidate);
            }
        }
        if healthy.is_empty() {
            healthy = failing;
        }

        let (declared, entry) = healthy.choose(&mut rand::thread_rng())?;
        Some(ActionTarget {
            action: (*declared).clone(),
            descriptor: Arc::clone(&entry.descriptor),
            timeout: declared.timeout(self.shared.config.default_timeout),
        })
    }

    /// Record that connecting to `descriptor`'s endpoint failed. The
    /// endpoint is avoided for one minute per failure in the failure
    /// window, up to the configured maximum.
    pub fn connect_failed(&self, descriptor: &ServiceDescriptor) {
        let now = Instant::now();
        let config = &self.shared.config;
        let mut inner = self.lock();
        let failures = inner.failures.entry(descriptor.uri.clone()).or_default();
        failures.prune(now, config.failure_window);
        failures.at.push_back(now);
        let minutes = u32::try_from(failures.at.len())
            .unwrap_or(u32::MAX)
            .min(config.max_quarantine_minutes);
        failures.reactivate = Some(now + Duration::from_secs(60 * u64::from(minutes)));
        warn!(identity = %descriptor.identity, uri = %descriptor.uri, minutes, "marking endpoint failed");
    }

    /// True while `descriptor`'s endpoint is quarantined.
    pub fn is_failed(&self, descriptor: &ServiceDescriptor) -> bool {
        self.lock().is_failed(&descriptor.uri, Instant::now())
    }

    /// All live descriptors, ordered by identity.
    pub fn snapshot(&self) -> Vec<Arc<ServiceDescriptor>> {
        let mut inner = self.lock();
        if self.purge_locked(&mut inner, Instant::now()) {
            self.changed();
        }
        let mut all: Vec<_> = inner
            .entries
            .values()
            .map(|e| Arc::clone(&e.descriptor))
            .collect();
        all.sort_by(|a, b| a.identity.cmp(&b.identity));
        all
    }

    /// Every indexed `(namespace.name, version)`, lowercased, sorted and
    /// without duplicates.
    pub fn list_actions(&self) -> Vec<(String, u32)> {
        let mut inner = self.lock();
        if self.purge_locked(&mut inner, Instant::now()) {
            self.changed();
        }
        let unique: BTreeSet<(String, u32)> = inner
            .index
            .values()
            .flat_map(|providers| providers.values())
            .map(|a| (a.name.qualified().to_lowercase(), a.name.version))
            .collect();
        unique.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::access::{AccessFilter, AllowAll};
    use crate::discovery::action::{ActionFlags, ActionName};
    use crate::discovery::descriptor::{sign_descriptor, Announcement};
    use crate::identity::ServiceIdentity;

    fn announcement(identity: &str, actions: Vec<ActionDescriptor>) -> Announcement {
        Announcement {
            identity: identity.to_string(),
            sector: "main".to_string(),
            weight: 1.0,
            send_interval: Duration::from_secs(5),
            envelopes: vec!["json".to_string()],
            actions,
        }
    }

    fn act(qualified: &str, version: u32) -> ActionDescriptor {
        ActionDescriptor::new(ActionName::from_qualified("main", qualified, version))
    }

    fn blob(id: &ServiceIdentity, ident: &str, ts: f64, actions: Vec<ActionDescriptor>) -> Bytes {
        let uri = format!("scamp+tls://{}:30100", ident.to_lowercase());
        blob_at(id, ident, &uri, ts, actions)
    }

    fn blob_at(id: &ServiceIdentity, ident: &str, uri: &str, ts: f64, actions: Vec<ActionDescriptor>) -> Bytes {
        sign_descriptor(id, &announcement(ident, actions), uri, false, ts)
            .unwrap()
            .raw()
            .clone()
    }

    #[tokio::test]
    async fn test_older_timestamp_is_stale() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        assert_eq!(reg.ingest(&blob(&id, "X", 100.0, vec![]), Source::Broadcast), Admission::Admitted);
        assert_eq!(reg.ingest(&blob(&id, "X", 99.0, vec![]), Source::Broadcast), Admission::Stale);
        assert_eq!(reg.ingest(&blob(&id, "X", 100.0, vec![act("a.b", 1)]), Source::Broadcast), Admission::Stale);
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].timestamp, 100.0);
    }

    #[tokio::test]
    async fn test_identical_blob_refreshes() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        let b = blob(&id, "X", 1.0, vec![]);
        let rx = reg.subscribe();
        assert_eq!(reg.ingest(&b, Source::Broadcast), Admission::Admitted);
        assert_eq!(reg.ingest(&b, Source::Broadcast), Admission::Refreshed);
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_bad_blobs_are_dropped() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        assert!(matches!(reg.ingest(b"garbage", Source::Broadcast), Admission::Malformed(_)));

        let id = ServiceIdentity::generate().unwrap();
        let good = blob(&id, "X", 1.0, vec![]);
        let tampered = String::from_utf8(good.to_vec()).unwrap().replacen("\"X\"", "\"Y\"", 1);
        assert_eq!(reg.ingest(tampered.as_bytes(), Source::Broadcast), Admission::Invalid);
        assert!(reg.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_with_aliases_and_envelopes() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        let actions = vec![
            act("shop.cart.fetch", 1).flags(ActionFlags::READ).timeout_secs(9),
            act("shop.cart.add", 2),
        ];
        reg.ingest(&blob(&id, "X", 1.0, actions), Source::Broadcast);

        let hit = reg.lookup("Shop.Cart._read", 1, "json", None).unwrap();
        assert_eq!(hit.action.name.qualified(), "shop.cart.fetch");
        assert_eq!(hit.timeout, Duration::from_secs(9));
        assert_eq!(hit.uri(), "scamp+tls://x:30100");

        let hit = reg.lookup("shop.cart.add", 2, "json", None).unwrap();
        assert_eq!(hit.timeout, Duration::from_secs(75));
        assert!(reg.lookup("shop.cart.add", 1, "json", None).is_none());
        assert!(reg.lookup("shop.cart.add", 2, "extdirect", None).is_none());
        assert!(reg.lookup("shop.cart.add", 2, "json", Some("other")).is_none());
        assert!(reg.lookup("shop.cart.add", 2, "json", Some("X")).is_some());

        assert_eq!(
            reg.list_actions(),
            vec![
                ("shop.cart.add".to_string(), 2),
                ("shop.cart.fetch".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_unauthorized_fingerprint_not_indexed() {
        let id = ServiceIdentity::generate().unwrap();
        let filter = AccessFilter::parse("11:22:33 ns\n");
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), filter);
        assert_eq!(
            reg.ingest(&blob(&id, "X", 1.0, vec![act("ns.act", 1)]), Source::Broadcast),
            Admission::Admitted
        );
        assert!(reg.lookup("ns.act", 1, "json", None).is_none());
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_other_sector_not_indexed() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        let other = ActionDescriptor::new(ActionName::new("web", "site", "render", 1));
        reg.ingest(&blob(&id, "X", 1.0, vec![other]), Source::Broadcast);
        assert!(reg.list_actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        reg.ingest(&blob(&id, "X", 1.0, vec![act("a.b", 1)]), Source::Broadcast);
        reg.ingest(&blob(&id, "P", 1.0, vec![act("a.b", 1)]), Source::Permanent);

        tokio::time::advance(Duration::from_millis(10_400)).await;
        assert_eq!(reg.snapshot().len(), 2);
        tokio::time::advance(Duration::from_millis(200)).await;
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].identity, "P");
        assert_eq!(reg.lookup("a.b", 1, "json", None).unwrap().identity(), "P");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_endpoints_deprioritized() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        reg.ingest(&blob(&id, "A", 1.0, vec![act("a.b", 1)]), Source::Permanent);
        reg.ingest(&blob(&id, "B", 1.0, vec![act("a.b", 1)]), Source::Permanent);
        let a = reg
            .snapshot()
            .into_iter()
            .find(|d| d.identity == "A")
            .unwrap();

        reg.connect_failed(&a);
        assert!(reg.is_failed(&a));
        for _ in 0..20 {
            assert_eq!(reg.lookup("a.b", 1, "json", None).unwrap().identity(), "B");
        }
        // only failed candidates left: still served
        assert_eq!(reg.lookup("a.b", 1, "json", Some("A")).unwrap().identity(), "A");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!reg.is_failed(&a));

        reg.connect_failed(&a);
        reg.connect_failed(&a);
        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(reg.is_failed(&a));
        tokio::time::advance(Duration::from_secs(62)).await;
        assert!(!reg.is_failed(&a));
    }

    #[tokio::test]
    async fn test_reload_restores_and_drops() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        let keep = blob(&id, "keep", 1.0, vec![act("a.b", 1)]);
        let gone = blob(&id, "gone", 1.0, vec![act("c.d", 1)]);
        reg.reload([keep.clone(), gone], Source::Permanent);
        assert_eq!(reg.snapshot().len(), 2);
        let before = Arc::clone(&reg.snapshot()[1]);
        assert_eq!(before.identity, "keep");

        let fresh = blob(&id, "new", 1.0, vec![]);
        reg.reload([keep, fresh], Source::Permanent);
        let snap = reg.snapshot();
        let names: Vec<_> = snap.iter().map(|d| d.identity.as_str()).collect();
        assert_eq!(names, vec!["keep", "new"]);
        assert!(Arc::ptr_eq(&before, &snap[0]));
        assert!(reg.lookup("c.d", 1, "json", None).is_none());
        assert!(reg.lookup("a.b", 1, "json", None).is_some());
    }

    #[tokio::test]
    async fn test_reload_leaves_broadcast_entries() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        let live = blob(&id, "live", 1.0, vec![act("a.b", 1)]);
        assert_eq!(reg.ingest(&live, Source::Broadcast), Admission::Admitted);

        reg.reload(Vec::<Bytes>::new(), Source::Permanent);
        assert_eq!(reg.snapshot().len(), 1);
        assert!(reg.lookup("a.b", 1, "json", None).is_some());
        assert_eq!(reg.ingest(&live, Source::Broadcast), Admission::Refreshed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reannounce_after_expiry_is_admitted() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        let cached = blob(&id, "X", 1.0, vec![act("a.b", 1)]);
        assert_eq!(reg.ingest(&cached, Source::Broadcast), Admission::Admitted);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(reg.snapshot().is_empty());
        // same bytes, same timestamp: nothing live to be stale against
        assert_eq!(reg.ingest(&cached, Source::Broadcast), Admission::Admitted);
        assert_eq!(reg.ingest(&blob(&id, "X", 0.5, vec![]), Source::Broadcast), Admission::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_follows_send_interval() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        let mut ann = announcement("fast", vec![act("a.b", 1)]);
        ann.send_interval = Duration::from_secs(2);
        let fast = sign_descriptor(&id, &ann, "scamp+tls://fast:1", false, 1.0).unwrap();
        reg.ingest(fast.raw(), Source::Broadcast);

        // 2s * 2.1
        tokio::time::advance(Duration::from_millis(4_150)).await;
        assert_eq!(reg.snapshot().len(), 1);
        assert_eq!(reg.ingest(fast.raw(), Source::Broadcast), Admission::Refreshed);
        tokio::time::advance(Duration::from_millis(4_150)).await;
        assert_eq!(reg.snapshot().len(), 1);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(reg.snapshot().is_empty());
        assert!(reg.lookup("a.b", 1, "json", None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_send_interval_never_expires() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        let body = r#"[3,"slow","main",1,1e22,"scamp+tls://slow:1",["json"],[["a",["b"]]],1]"#;
        let raw = format!("{body}\n\n{}\n{}", id.cert_pem(), id.sign_folded(body.as_bytes()));

        assert_eq!(reg.ingest(raw.as_bytes(), Source::Broadcast), Admission::Admitted);
        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        assert_eq!(reg.lookup("a.b", 1, "json", None).unwrap().identity(), "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantine_grows_and_caps() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        reg.ingest(&blob(&id, "A", 1.0, vec![act("a.b", 1)]), Source::Permanent);
        let a = Arc::clone(&reg.snapshot()[0]);

        for _ in 0..75 {
            reg.connect_failed(&a);
        }
        tokio::time::advance(Duration::from_secs(60 * 60 - 1)).await;
        assert!(reg.is_failed(&a));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!reg.is_failed(&a));

        // failures older than the window no longer count
        tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;
        reg.connect_failed(&a);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(reg.is_failed(&a));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!reg.is_failed(&a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_belong_to_the_endpoint() {
        let reg = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let id = ServiceIdentity::generate().unwrap();
        let shared = "scamp+tls://10.0.0.9:30100";
        reg.ingest(&blob_at(&id, "old", shared, 1.0, vec![act("a.b", 1)]), Source::Permanent);
        reg.ingest(&blob_at(&id, "new", shared, 1.0, vec![act("a.b", 1)]), Source::Permanent);
        reg.ingest(&blob(&id, "other", 1.0, vec![act("a.b", 1)]), Source::Permanent);
        let snap = reg.snapshot();
        let by_name = |name: &str| snap.iter().find(|d| d.identity == name).unwrap();

        reg.connect_failed(by_name("old"));
        assert!(reg.is_failed(by_name("new")));
        assert!(!reg.is_failed(by_name("other")));
        for _ in 0..20 {
            assert_eq!(reg.lookup("a.b", 1, "json", None).unwrap().identity(), "other");
        }
    }
}
