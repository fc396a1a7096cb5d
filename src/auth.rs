//! Ticket and privilege checks for served actions.
//!
//! The ticket format and the authorization service live elsewhere; this
//! module only consumes them through [`TicketVerifier`] and
//! [`PrivilegeTable`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discovery::{ActionDescriptor, ActionFlags};
use crate::error::{ErrorCode, RpcError};

/// Who a verified ticket speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// User id.
    pub user_id: u64,
    /// Client id.
    pub client_id: u64,
    /// Start of validity, seconds since the epoch.
    pub validity_start: u64,
    /// Validity length in seconds.
    pub validity_length: u64,
    /// Granted privileges.
    pub privileges: BTreeSet<String>,
}

impl Principal {
    /// Seconds of validity left at `now` (negative once expired).
    pub fn ttl_at(&self, now: u64) -> i64 {
        self.validity_length as i64 - (now as i64 - self.validity_start as i64)
    }

    /// True if not yet valid or no longer valid at `now`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        now < self.validity_start || self.ttl_at(now) <= 0
    }

    /// [`Self::is_expired_at`] for the current time.
    pub fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.is_expired_at(now)
    }

    /// True if the principal holds `privilege`.
    pub fn has(&self, privilege: &str) -> bool {
        self.privileges.contains(privilege)
    }
}

/// Checks ticket strings.
#[async_trait]
pub trait TicketVerifier: Send + Sync + 'static {
    /// The principal for a valid ticket, `None` otherwise.
    async fn verify(&self, ticket: &str) -> Option<Principal>;
}

/// Privileges each action requires.
#[async_trait]
pub trait PrivilegeTable: Send + Sync + 'static {
    /// Required privileges for `action` (lowercased `namespace.name`), or
    /// `None` if the action is not configured.
    async fn requirement(&self, action: &str) -> Option<Vec<String>>;
}

/// Fixed privilege table.
#[derive(Debug, Clone, Default)]
pub struct StaticPrivileges {
    table: HashMap<String, Vec<String>>,
}

impl StaticPrivileges {
    /// Empty table: every non-`noauth` action is unconfigured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `privileges` for `action`.
    pub fn require<I, S>(mut self, action: &str, privileges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.table.insert(
            action.to_lowercase(),
            privileges.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Table from the JSON object an authorization service returns:
    /// `{"ns.action": ["priv", null, ...], ...}`. Null entries are skipped.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, RpcError> {
        let invalid = || RpcError::new(ErrorCode::Internal, "Authz server returned invalid table");
        let object = value.as_object().ok_or_else(invalid)?;
        let mut table = HashMap::new();
        for (action, needs) in object {
            if action.starts_with('_') {
                continue;
            }
            let needs = needs.as_array().ok_or_else(invalid)?;
            let mut privileges = Vec::with_capacity(needs.len());
            for need in needs {
                match need {
                    serde_json::Value::Null => {}
                    serde_json::Value::String(s) => privileges.push(s.clone()),
                    _ => return Err(invalid()),
                }
            }
            table.insert(action.to_lowercase(), privileges);
        }
        Ok(Self { table })
    }
}

#[async_trait]
impl PrivilegeTable for StaticPrivileges {
    async fn requirement(&self, action: &str) -> Option<Vec<String>> {
        self.table.get(&action.to_lowercase()).cloned()
    }
}

/// Combines a verifier and a privilege table.
#[derive(Clone)]
pub struct AccessPolicy {
    verifier: Arc<dyn TicketVerifier>,
    privileges: Arc<dyn PrivilegeTable>,
}

impl std::fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPolicy").finish_non_exhaustive()
    }
}

impl AccessPolicy {
    /// Policy from its collaborators.
    pub fn new(verifier: impl TicketVerifier, privileges: impl PrivilegeTable) -> Self {
        Self {
            verifier: Arc::new(verifier),
            privileges: Arc::new(privileges),
        }
    }

    /// Check a request for `action` carrying `ticket`.
    ///
    /// `noauth` actions pass without a ticket. Otherwise the ticket must
    /// verify and not be expired, the action must be configured, and every
    /// required privilege must be held.
    pub async fn check(
        &self,
        action: &ActionDescriptor,
        ticket: Option<&str>,
    ) -> Result<Option<Principal>, RpcError> {
        let name = action.name.qualified();
        if action.flags.contains(ActionFlags::NOAUTH) {
            return Ok(None);
        }

        let principal = match ticket.filter(|t| !t.is_empty()) {
            Some(ticket) => self.verifier.verify(ticket).await,
            None => None,
        };
        let Some(principal) = principal.filter(|p| !p.is_expired()) else {
            return Err(RpcError::new(
                ErrorCode::Authn,
                format!("Need valid ticket for {name}"),
            ));
        };

        let Some(needs) = self.privileges.requirement(&name.to_lowercase()).await else {
            return Err(RpcError::new(
                ErrorCode::Authz,
                format!("Unconfigured action {name}"),
            ));
        };
        if let Some(missing) = needs.iter().find(|need| !principal.has(need)) {
            debug!(action = %name, user_id = principal.user_id, privilege = %missing, "access denied");
            return Err(RpcError::new(
                ErrorCode::Authz,
                format!("Access denied - action {name} requires privilege {missing}"),
            ));
        }
        Ok(Some(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ActionName;

    struct Tickets;

    #[async_trait]
    impl TicketVerifier for Tickets {
        async fn verify(&self, ticket: &str) -> Option<Principal> {
            let privileges = match ticket {
                "admin" => ["read", "write"].iter().map(|s| s.to_string()).collect(),
                "reader" => ["read"].iter().map(|s| s.to_string()).collect(),
                "expired" => BTreeSet::new(),
                _ => return None,
            };
            let (validity_start, validity_length) = if ticket == "expired" {
                (10, 1)
            } else {
                (0, 1 << 40)
            };
            Some(Principal {
                user_id: 7,
                client_id: 1,
                validity_start,
                validity_length,
                privileges,
            })
        }
    }

    fn policy() -> AccessPolicy {
        AccessPolicy::new(
            Tickets,
            StaticPrivileges::new().require("Store.Item.put", ["write"]).require("store.item.get", ["read"]),
        )
    }

    fn action(name: &str, flags: ActionFlags) -> ActionDescriptor {
        ActionDescriptor::new(ActionName::from_qualified("main", name, 1)).flags(flags)
    }

    #[tokio::test]
    async fn test_noauth_skips_ticket() {
        let ok = policy().check(&action("store.item.peek", ActionFlags::NOAUTH), None).await;
        assert_eq!(ok, Ok(None));
    }

    #[tokio::test]
    async fn test_ticket_required() {
        let p = policy();
        let a = action("store.item.get", ActionFlags::empty());
        for ticket in [None, Some(""), Some("forged"), Some("expired")] {
            let err = p.check(&a, ticket).await.unwrap_err();
            assert_eq!(err.code, ErrorCode::Authn, "{ticket:?}");
            assert_eq!(err.message, "Need valid ticket for store.item.get");
        }
    }

    #[tokio::test]
    async fn test_privileges() {
        let p = policy();
        let put = action("store.item.put", ActionFlags::empty());
        let err = p.check(&put, Some("reader")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Authz);
        assert_eq!(err.message, "Access denied - action store.item.put requires privilege write");
        assert_eq!(p.check(&put, Some("admin")).await.unwrap().unwrap().user_id, 7);

        let err = p.check(&action("store.other", ActionFlags::empty()), Some("admin")).await.unwrap_err();
        assert_eq!(err.message, "Unconfigured action store.other");
    }

    #[test]
    fn test_table_from_json() {
        let table = StaticPrivileges::from_json(&serde_json::json!({
            "Auth.thing": ["a", null],
            "_NAMES": {"a": "Alpha"},
        }))
        .unwrap();
        assert_eq!(table.table["auth.thing"], vec!["a".to_string()]);
        assert!(StaticPrivileges::from_json(&serde_json::json!({"x": [1]})).is_err());
        assert!(StaticPrivileges::from_json(&serde_json::json!([])).is_err());
    }

    #[test]
    fn test_expiry() {
        let p = Principal {
            user_id: 1,
            client_id: 1,
            validity_start: 100,
            validity_length: 50,
            privileges: BTreeSet::new(),
        };
        assert!(p.is_expired_at(99));
        assert!(!p.is_expired_at(100));
        assert_eq!(p.ttl_at(120), 30);
        assert!(p.is_expired_at(150));
    }
}
