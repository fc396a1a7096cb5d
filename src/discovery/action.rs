//! Action names, flags and descriptors.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// Capability flags an action advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ActionFlags: u8 {
        /// CRUD create; also indexed as `_create`.
        const CREATE = 1 << 0;
        /// CRUD read; also indexed as `_read`.
        const READ = 1 << 1;
        /// CRUD update; also indexed as `_update`.
        const UPDATE = 1 << 2;
        /// CRUD destroy; also indexed as `_destroy`.
        const DESTROY = 1 << 3;
        /// Reachable from public frontends.
        const PUBLIC = 1 << 4;
        /// No ticket required.
        const NOAUTH = 1 << 5;
    }
}

const FLAG_NAMES: [(ActionFlags, &str); 6] = [
    (ActionFlags::CREATE, "create"),
    (ActionFlags::READ, "read"),
    (ActionFlags::UPDATE, "update"),
    (ActionFlags::DESTROY, "destroy"),
    (ActionFlags::PUBLIC, "public"),
    (ActionFlags::NOAUTH, "noauth"),
];

/// CRUD flags and the synthetic action names they alias to.
pub const CRUD_ALIASES: [(ActionFlags, &str); 4] = [
    (ActionFlags::CREATE, "_create"),
    (ActionFlags::READ, "_read"),
    (ActionFlags::UPDATE, "_update"),
    (ActionFlags::DESTROY, "_destroy"),
];

/// Parse a comma-separated flag string. Returns the flags and a `tN`
/// timeout override in seconds. Unknown flags are ignored.
pub fn parse_flags(text: &str) -> (ActionFlags, Option<u32>) {
    let mut flags = ActionFlags::empty();
    let mut timeout = None;
    for token in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some((flag, _)) = FLAG_NAMES.iter().find(|(_, name)| *name == token) {
            flags |= *flag;
        } else if let Some(secs) = token
            .strip_prefix('t')
            .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|d| d.parse().ok())
        {
            timeout = Some(secs);
        }
    }
    (flags, timeout)
}

/// Inverse of [`parse_flags`].
pub fn format_flags(flags: ActionFlags, timeout: Option<u32>) -> String {
    let mut parts: Vec<String> = FLAG_NAMES
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| name.to_string())
        .collect();
    if let Some(secs) = timeout {
        parts.push(format!("t{secs}"));
    }
    parts.join(",")
}

/// Fully qualified action identity. Comparison ignores ASCII case.
#[derive(Debug, Clone)]
pub struct ActionName {
    /// Sector the action lives in.
    pub sector: String,
    /// Dotted namespace.
    pub namespace: String,
    /// Final name component.
    pub name: String,
    /// Version, at least 1.
    pub version: u32,
}

impl ActionName {
    /// Build from parts.
    pub fn new(
        sector: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: u32,
    ) -> Self {
        Self {
            sector: sector.into(),
            namespace: namespace.into(),
            name: name.into(),
            version: version.max(1),
        }
    }

    /// Split a dotted `namespace.name` at its last dot.
    pub fn from_qualified(sector: impl Into<String>, qualified: &str, version: u32) -> Self {
        let (namespace, name) = qualified.rsplit_once('.').unwrap_or(("", qualified));
        Self::new(sector, namespace, name, version)
    }

    /// `namespace.name`.
    pub fn qualified(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Lowercased `sector:namespace.name.vN` registry key.
    pub fn index_key(&self) -> String {
        format!("{}:{}.v{}", self.sector, self.qualified(), self.version).to_lowercase()
    }

    /// Lowercased `namespace.name.vN` handler-table key.
    pub fn handler_key(&self) -> String {
        format!("{}.v{}", self.qualified(), self.version).to_lowercase()
    }

    /// Same namespace and version under a different final name.
    pub fn with_name(&self, name: &str) -> Self {
        Self::new(&self.sector, &self.namespace, name, self.version)
    }
}

impl PartialEq for ActionName {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.sector.eq_ignore_ascii_case(&other.sector)
            && self.namespace.eq_ignore_ascii_case(&other.namespace)
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for ActionName {}

impl Hash for ActionName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index_key().hash(state);
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.v{}", self.sector, self.qualified(), self.version)
    }
}

/// One action served by a service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    /// Identity.
    pub name: ActionName,
    /// Capability flags.
    pub flags: ActionFlags,
    /// Timeout override in seconds (`tN` flag).
    pub timeout_secs: Option<u32>,
    /// Envelopes this action accepts.
    pub envelopes: Vec<String>,
}

impl ActionDescriptor {
    /// Descriptor with no flags and a `json` envelope.
    pub fn new(name: ActionName) -> Self {
        Self {
            name,
            flags: ActionFlags::empty(),
            timeout_secs: None,
            envelopes: vec!["json".to_string()],
        }
    }

    /// Set flags.
    pub fn flags(mut self, flags: ActionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the timeout override.
    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set envelopes.
    pub fn envelopes<I, S>(mut self, envelopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.envelopes = envelopes.into_iter().map(Into::into).collect();
        self
    }

    /// Effective timeout given a default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs
            .map(|secs| Duration::from_secs(u64::from(secs)))
            .unwrap_or(default)
    }

    /// Flag string as it appears on the wire.
    pub fn flag_string(&self) -> String {
        format_flags(self.flags, self.timeout_secs)
    }

    /// True when the envelope list names `envelope`.
    pub fn accepts(&self, envelope: &str) -> bool {
        self.envelopes.iter().any(|e| e == envelope)
    }

    /// Names this action is indexed under: its own plus any CRUD aliases.
    pub fn index_names(&self) -> Vec<ActionName> {
        let mut names = vec![self.name.clone()];
        for (flag, alias) in CRUD_ALIASES {
            if self.flags.contains(flag) {
                names.push(self.name.with_name(alias));
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_flags() {
        let (flags, timeout) = parse_flags("read, noauth,t30,bogus");
        assert_eq!(flags, ActionFlags::READ | ActionFlags::NOAUTH);
        assert_eq!(timeout, Some(30));
        assert_eq!(parse_flags(""), (ActionFlags::empty(), None));
        assert_eq!(parse_flags("t"), (ActionFlags::empty(), None));
        assert_eq!(format_flags(flags, timeout), "read,noauth,t30");
    }

    #[test]
    fn test_case_insensitive_identity() {
        let a = ActionName::from_qualified("main", "Auth.getTicket", 1);
        let b = ActionName::from_qualified("MAIN", "auth.GETTICKET", 1);
        let c = ActionName::from_qualified("main", "auth.getticket", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_eq!(a.index_key(), "main:auth.getticket.v1");
        assert_eq!(a.handler_key(), "auth.getticket.v1");
    }

    #[test]
    fn test_qualified_split() {
        let name = ActionName::from_qualified("main", "api.user.profile.get", 3);
        assert_eq!(name.namespace, "api.user.profile");
        assert_eq!(name.name, "get");
        assert_eq!(name.qualified(), "api.user.profile.get");
        assert_eq!(name.to_string(), "main:api.user.profile.get.v3");
    }

    #[test]
    fn test_crud_aliases() {
        let action = ActionDescriptor::new(ActionName::from_qualified("main", "shop.cart.fetch", 1))
            .flags(ActionFlags::READ | ActionFlags::UPDATE | ActionFlags::PUBLIC);
        let keys: Vec<_> = action.index_names().iter().map(ActionName::index_key).collect();
        assert_eq!(
            keys,
            vec![
                "main:shop.cart.fetch.v1",
                "main:shop.cart._read.v1",
                "main:shop.cart._update.v1",
            ]
        );
    }

    #[test]
    fn test_timeout_override() {
        let action = ActionDescriptor::new(ActionName::from_qualified("main", "a.b", 1));
        assert_eq!(action.timeout(Duration::from_secs(75)), Duration::from_secs(75));
        assert_eq!(
            action.timeout_secs(5).timeout(Duration::from_secs(75)),
            Duration::from_secs(5)
        );
    }
}
