//! Signed service descriptor blobs.
//!
//! A blob is `<json array>\n\n<PEM certificate>\n<base64 signature folded at 76>\n`.
//! The array has nine elements:
//!
//! ```text
//! [3, identity, sector, weight, send_interval_ms, uri,
//!  [envelope, ..., {extension}?], [[namespace, [name, flags, version?], ...], ...],
//!  timestamp]
//! ```
//!
//! Signature validity is computed lazily on first use and memoized.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use rand::RngCore;
use serde_json::{Map, Value};
use thiserror::Error;

use super::action::{parse_flags, ActionDescriptor, ActionName};
use super::rle;
use crate::identity::{self, ServiceIdentity};

/// The only wire version understood.
pub const WIRE_VERSION: u64 = 3;

/// Why a blob was rejected. Rejected blobs are logged and dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// Blob does not split into body, certificate and signature.
    #[error("malformed blob layout: {0}")]
    Layout(&'static str),
    /// Body is not JSON.
    #[error("body is not valid JSON: {0}")]
    Json(String),
    /// Body is not a nine-element array.
    #[error("expected a 9-element array, got {0}")]
    Arity(String),
    /// Version field is not 3.
    #[error("unsupported descriptor version {0}")]
    Version(String),
    /// A field has the wrong JSON type.
    #[error("field {0} has the wrong type")]
    Field(&'static str),
    /// Action list could not be decoded.
    #[error("invalid action list: {0}")]
    Actions(String),
}

/// One announcing service instance, as parsed from (or built into) a blob.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    /// Instance identity, unique per process.
    pub identity: String,
    /// Default sector of the v3 action list.
    pub sector: String,
    /// Relative capacity. Zero means withdrawing.
    pub weight: f64,
    /// Announcement interval.
    pub send_interval: Duration,
    /// Endpoint URI.
    pub uri: String,
    /// Default envelopes of the v3 action list.
    pub envelopes: Vec<String>,
    /// Extension object, including any RLE columns.
    pub extension: Map<String, Value>,
    /// All actions, v3 list first, RLE rows after.
    pub actions: Vec<ActionDescriptor>,
    /// Publish time in milliseconds since the epoch.
    pub timestamp: f64,
    raw: Bytes,
    body: String,
    certificate: String,
    signature: String,
    fingerprint: String,
    valid: OnceLock<bool>,
}

impl PartialEq for ServiceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
            && self.sector == other.sector
            && self.weight == other.weight
            && self.send_interval == other.send_interval
            && self.uri == other.uri
            && self.envelopes == other.envelopes
            && self.extension == other.extension
            && self.actions == other.actions
            && self.timestamp == other.timestamp
            && self.raw == other.raw
            && self.certificate == other.certificate
            && self.signature == other.signature
    }
}

fn split_blob(blob: &[u8]) -> Result<(&str, &str, &str), DescriptorError> {
    let text = std::str::from_utf8(blob).map_err(|_| DescriptorError::Layout("not UTF-8"))?;
    let (body, rest) = text
        .split_once("\n\n")
        .ok_or(DescriptorError::Layout("no blank line after body"))?;
    let end = rest
        .find("-----END")
        .ok_or(DescriptorError::Layout("no certificate"))?;
    let cert_end = rest[end..]
        .find('\n')
        .map(|i| end + i + 1)
        .ok_or(DescriptorError::Layout("no signature"))?;
    let (cert, signature) = rest.split_at(cert_end);
    if signature.trim().is_empty() {
        return Err(DescriptorError::Layout("no signature"));
    }
    Ok((body, cert, signature))
}

fn field<'a>(array: &'a [Value], index: usize, name: &'static str) -> Result<&'a Value, DescriptorError> {
    array.get(index).ok_or(DescriptorError::Field(name))
}

fn string_field(array: &[Value], index: usize, name: &'static str) -> Result<String, DescriptorError> {
    field(array, index, name)?
        .as_str()
        .map(str::to_string)
        .ok_or(DescriptorError::Field(name))
}

fn number_field(array: &[Value], index: usize, name: &'static str) -> Result<f64, DescriptorError> {
    field(array, index, name)?
        .as_f64()
        .filter(|n| n.is_finite())
        .ok_or(DescriptorError::Field(name))
}

fn parse_v3_actions(
    list: &Value,
    sector: &str,
    envelopes: &[String],
) -> Result<Vec<ActionDescriptor>, DescriptorError> {
    let groups = list.as_array().ok_or(DescriptorError::Field("actions"))?;
    let mut out = Vec::new();
    for group in groups {
        let group = group
            .as_array()
            .ok_or_else(|| DescriptorError::Actions("namespace group must be array".into()))?;
        let (namespace, entries) = group
            .split_first()
            .ok_or_else(|| DescriptorError::Actions("empty namespace group".into()))?;
        let namespace = namespace
            .as_str()
            .ok_or_else(|| DescriptorError::Actions("namespace must be string".into()))?;
        for entry in entries {
            let entry = entry
                .as_array()
                .filter(|e| !e.is_empty())
                .ok_or_else(|| DescriptorError::Actions("action must be array >0 length".into()))?;
            let name = match &entry[0] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let flags = entry.get(1).and_then(Value::as_str).unwrap_or("");
            let (flags, timeout_secs) = parse_flags(flags);
            let version = match entry.get(2) {
                None => 1,
                Some(v) => v
                    .as_u64()
                    .filter(|v| *v >= 1)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| DescriptorError::Actions(format!("bad version for {name}")))?,
            };
            out.push(ActionDescriptor {
                name: ActionName::new(sector, namespace, name, version),
                flags,
                timeout_secs,
                envelopes: envelopes.to_vec(),
            });
        }
    }
    Ok(out)
}

impl ServiceDescriptor {
    /// Parse a blob. Signature checking is deferred to [`Self::is_valid`].
    pub fn parse(blob: &[u8]) -> Result<Self, DescriptorError> {
        let (body, certificate, signature) = split_blob(blob)?;
        let value: Value =
            serde_json::from_str(body).map_err(|e| DescriptorError::Json(e.to_string()))?;
        let array = match value {
            Value::Array(array) if array.len() == 9 => array,
            Value::Array(array) => return Err(DescriptorError::Arity(array.len().to_string())),
            other => return Err(DescriptorError::Arity(other.to_string())),
        };
        if array[0].as_u64() != Some(WIRE_VERSION) {
            return Err(DescriptorError::Version(array[0].to_string()));
        }

        let identity = string_field(&array, 1, "identity")?;
        let sector = string_field(&array, 2, "sector")?;
        let weight = number_field(&array, 3, "weight")?;
        let send_interval = number_field(&array, 4, "send_interval")
            .ok()
            .filter(|ms| *ms >= 0.0)
            .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
            .ok_or(DescriptorError::Field("send_interval"))?;
        let uri = string_field(&array, 5, "uri")?;

        let mut envelope_list = field(&array, 6, "envelopes")?
            .as_array()
            .cloned()
            .ok_or(DescriptorError::Field("envelopes"))?;
        let extension = match envelope_list.last() {
            Some(Value::Object(_)) => match envelope_list.pop() {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        };
        let envelopes = envelope_list
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(DescriptorError::Field("envelopes")),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let timestamp = number_field(&array, 8, "timestamp")?;

        let mut actions = parse_v3_actions(&array[7], &sector, &envelopes)?;
        if rle::present(&extension) {
            actions.extend(rle::decode(&extension)?);
        }

        Ok(Self {
            identity,
            sector,
            weight,
            send_interval,
            uri,
            envelopes,
            extension,
            actions,
            timestamp,
            raw: Bytes::copy_from_slice(blob),
            body: body.to_string(),
            fingerprint: identity::fingerprint_pem(certificate).unwrap_or_default(),
            certificate: certificate.to_string(),
            signature: signature.to_string(),
            valid: OnceLock::new(),
        })
    }

    /// Signature check, computed at most once.
    pub fn is_valid(&self) -> bool {
        *self
            .valid
            .get_or_init(|| identity::verify(&self.certificate, self.body.as_bytes(), &self.signature))
    }

    /// Certificate fingerprint, empty if the certificate does not decode.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Registry dedup key: fingerprint plus identity.
    pub fn dedup_key(&self) -> String {
        format!("{}${}", self.fingerprint, self.identity)
    }

    /// The exact bytes this descriptor was parsed from or signed as.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// PEM certificate.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// Weight zero and no actions: the instance is shutting down.
    pub fn is_withdrawing(&self) -> bool {
        self.weight == 0.0 && self.actions.is_empty()
    }
}

fn timestamp_value(ts: f64) -> Value {
    if ts.fract() == 0.0 && ts.abs() < 9.007_199_254_740_992e15 {
        Value::from(ts as i64)
    } else {
        Value::from(ts)
    }
}

fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or_default()
}

/// `tag-<24 chars of base64>` instance identity.
pub fn generate_identity(tag: &str) -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{tag}-{}", STANDARD.encode(bytes))
}

/// Inputs describing what a service announces.
#[derive(Clone, Debug)]
pub struct Announcement {
    /// Instance identity.
    pub identity: String,
    /// Sector of the v3 action list.
    pub sector: String,
    /// Relative capacity.
    pub weight: f64,
    /// Announcement interval.
    pub send_interval: Duration,
    /// Envelopes of the v3 action list.
    pub envelopes: Vec<String>,
    /// Served actions.
    pub actions: Vec<ActionDescriptor>,
}

fn body_json(ann: &Announcement, uri: &str, withdrawing: bool, timestamp: f64) -> String {
    let actions: &[ActionDescriptor] = if withdrawing || uri.is_empty() {
        &[]
    } else {
        &ann.actions
    };
    let fits_v3 = actions
        .iter()
        .all(|a| a.name.sector == ann.sector && a.envelopes == ann.envelopes);

    let mut envelopes: Vec<Value> = ann.envelopes.iter().cloned().map(Value::from).collect();
    let mut v3 = Vec::new();
    if fits_v3 {
        let mut groups: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for action in actions {
            let mut entry = vec![
                Value::from(action.name.name.clone()),
                Value::from(action.flag_string()),
            ];
            if action.name.version != 1 {
                entry.push(Value::from(action.name.version));
            }
            groups
                .entry(action.name.namespace.as_str())
                .or_default()
                .push(Value::Array(entry));
        }
        for (namespace, entries) in groups {
            let mut group = vec![Value::from(namespace)];
            group.extend(entries);
            v3.push(Value::Array(group));
        }
    } else {
        let mut ext = Map::new();
        rle::encode(actions, &mut ext);
        envelopes.push(Value::Object(ext));
    }

    let weight = if withdrawing { 0.0 } else { ann.weight };
    let body = Value::Array(vec![
        Value::from(WIRE_VERSION),
        Value::from(ann.identity.clone()),
        Value::from(ann.sector.clone()),
        timestamp_value(weight),
        Value::from(ann.send_interval.as_millis() as u64),
        Value::from(uri),
        Value::Array(envelopes),
        Value::Array(v3),
        timestamp_value(timestamp),
    ]);
    body.to_string()
}

/// Sign a descriptor for `uri` at `timestamp`.
pub fn sign_descriptor(
    identity: &ServiceIdentity,
    ann: &Announcement,
    uri: &str,
    withdrawing: bool,
    timestamp: f64,
) -> Result<ServiceDescriptor, DescriptorError> {
    let body = body_json(ann, uri, withdrawing, timestamp);
    let blob = format!(
        "{body}\n\n{}\n{}",
        identity.cert_pem(),
        identity.sign_folded(body.as_bytes())
    );
    let descriptor = ServiceDescriptor::parse(blob.as_bytes())?;
    // we just signed it
    let _ = descriptor.valid.set(true);
    Ok(descriptor)
}

/// Builds and caches one signed blob per interface URI.
///
/// The cache is cleared whenever an input changes, so a blob and its
/// timestamp are reused across announcement rounds until then. Receivers
/// treat a repeat of the live blob as a refresh, and a blob arriving after
/// its predecessor expired as new.
pub struct DescriptorBuilder {
    identity: ServiceIdentity,
    state: Mutex<BuilderState>,
}

struct BuilderState {
    announcement: Announcement,
    uris: BTreeMap<String, String>,
    cache: HashMap<(String, bool), Bytes>,
}

impl DescriptorBuilder {
    /// Builder for `announcement` signed by `identity`.
    pub fn new(identity: ServiceIdentity, announcement: Announcement) -> Self {
        Self {
            identity,
            state: Mutex::new(BuilderState {
                announcement,
                uris: BTreeMap::new(),
                cache: HashMap::new(),
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BuilderState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// Signing identity.
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Instance identity string.
    pub fn instance(&self) -> String {
        self.with_state(|s| s.announcement.identity.clone())
    }

    /// Register the URI served on `interface`.
    pub fn add_address(&self, interface: impl Into<String>, uri: impl Into<String>) {
        self.with_state(|s| {
            s.uris.insert(interface.into(), uri.into());
            s.cache.clear();
        });
    }

    /// Replace the advertised weight.
    pub fn set_weight(&self, weight: f64) {
        self.with_state(|s| {
            s.announcement.weight = weight;
            s.cache.clear();
        });
    }

    /// Replace the action list.
    pub fn set_actions(&self, actions: Vec<ActionDescriptor>) {
        self.with_state(|s| {
            s.announcement.actions = actions;
            s.cache.clear();
        });
    }

    /// Replace the announcement interval.
    pub fn set_send_interval(&self, interval: Duration) {
        self.with_state(|s| {
            s.announcement.send_interval = interval;
            s.cache.clear();
        });
    }

    /// Interfaces with a registered URI.
    pub fn interfaces(&self) -> Vec<String> {
        self.with_state(|s| s.uris.keys().cloned().collect())
    }

    /// Signed blob for `interface`, built on first use after any change.
    pub fn blob_for(&self, interface: &str, withdrawing: bool) -> Result<Bytes, DescriptorError> {
        self.with_state(|s| {
            let key = (interface.to_string(), withdrawing);
            if let Some(blob) = s.cache.get(&key) {
                return Ok(blob.clone());
            }
            let uri = s.uris.get(interface).cloned().unwrap_or_default();
            let descriptor = sign_descriptor(
                &self.identity,
                &s.announcement,
                &uri,
                withdrawing,
                now_millis(),
            )?;
            let blob = descriptor.raw().clone();
            s.cache.insert(key, blob.clone());
            Ok(blob)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::action::ActionFlags;

    fn announcement(identity: &str) -> Announcement {
        Announcement {
            identity: identity.to_string(),
            sector: "main".to_string(),
            weight: 1.0,
            send_interval: Duration::from_millis(5000),
            envelopes: vec!["json".to_string()],
            actions: vec![
                ActionDescriptor::new(ActionName::new("main", "shop.cart", "get", 1))
                    .flags(ActionFlags::READ),
                ActionDescriptor::new(ActionName::new("main", "shop.cart", "put", 2))
                    .flags(ActionFlags::UPDATE | ActionFlags::NOAUTH)
                    .timeout_secs(30),
            ],
        }
    }

    #[test]
    fn test_sign_parse_round_trip() {
        let id = ServiceIdentity::generate().unwrap();
        let signed = sign_descriptor(&id, &announcement("svc-1"), "scamp+tls://1.2.3.4:30100", false, 100.0)
            .unwrap();
        let parsed = ServiceDescriptor::parse(signed.raw()).unwrap();
        assert_eq!(parsed, signed);
        assert!(parsed.is_valid());
        assert_eq!(parsed.identity, "svc-1");
        assert_eq!(parsed.actions.len(), 2);
        assert_eq!(parsed.actions[1].timeout_secs, Some(30));
        assert_eq!(parsed.fingerprint(), id.fingerprint());
        assert_eq!(parsed.send_interval, Duration::from_millis(5000));
    }

    #[test]
    fn test_mixed_sectors_use_rle() {
        let id = ServiceIdentity::generate().unwrap();
        let mut ann = announcement("svc-2");
        ann.actions.push(
            ActionDescriptor::new(ActionName::new("web", "site", "render", 1))
                .envelopes(["json", "extdirect"]),
        );
        let signed = sign_descriptor(&id, &ann, "scamp+tls://1.2.3.4:30100", false, 1.5).unwrap();
        assert!(signed.extension.contains_key("acname"));
        let parsed = ServiceDescriptor::parse(signed.raw()).unwrap();
        assert_eq!(parsed.actions, ann.actions);
        assert_eq!(parsed.timestamp, 1.5);
    }

    #[test]
    fn test_signature_bit_flip_is_invalid() {
        let id = ServiceIdentity::generate().unwrap();
        let signed = sign_descriptor(&id, &announcement("svc-3"), "u", false, 7.0).unwrap();
        let raw = signed.raw().to_vec();
        let text = String::from_utf8(raw.clone()).unwrap();
        let sig_start = text.find("-----END").and_then(|i| text[i..].find('\n').map(|j| i + j + 1)).unwrap();

        for bit in 0..8 {
            let mut blob = raw.clone();
            // flip inside the decoded signature by swapping one base64 digit
            let pos = sig_start + 2;
            blob[pos] = if blob[pos] == b'A' + bit { b'B' + bit } else { b'A' + bit };
            let parsed = ServiceDescriptor::parse(&blob).unwrap();
            assert!(!parsed.is_valid());
        }
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let id = ServiceIdentity::generate().unwrap();
        let cert = id.cert_pem().to_string();
        let wrap = |body: &str| format!("{body}\n\n{cert}\nAAAA\n").into_bytes();

        assert!(matches!(
            ServiceDescriptor::parse(&wrap("[3,\"a\"]")),
            Err(DescriptorError::Arity(_))
        ));
        assert!(matches!(
            ServiceDescriptor::parse(&wrap(r#"[4,"a","main",1,5000,"u",["json"],[],1]"#)),
            Err(DescriptorError::Version(_))
        ));
        assert!(matches!(
            ServiceDescriptor::parse(&wrap(r#"[3,"a","main",1,5000,"u",["json"],[],"x"]"#)),
            Err(DescriptorError::Field("timestamp"))
        ));
        assert!(matches!(
            ServiceDescriptor::parse(b"no layout at all"),
            Err(DescriptorError::Layout(_))
        ));

        // malformed signature is a validity problem, not a parse failure
        let parsed =
            ServiceDescriptor::parse(&wrap(r#"[3,"a","main",1,5000,"u",["json"],[["ns",["x"]]],1]"#))
                .unwrap();
        assert!(!parsed.is_valid());
        assert_eq!(parsed.actions[0].name.version, 1);
    }

    #[test]
    fn test_unrepresentable_send_interval_is_rejected() {
        let id = ServiceIdentity::generate().unwrap();
        for interval in ["1e30", "-5", "1.8e300"] {
            let body = format!(r#"[3,"x","main",1,{interval},"scamp+tls://1.2.3.4:1",["json"],[],1]"#);
            let blob = format!("{body}\n\n{}\n{}", id.cert_pem(), id.sign_folded(body.as_bytes()));
            assert_eq!(
                ServiceDescriptor::parse(blob.as_bytes()).unwrap_err(),
                DescriptorError::Field("send_interval"),
                "{interval}"
            );
        }
    }

    #[test]
    fn test_builder_caches_until_change() {
        let builder = DescriptorBuilder::new(ServiceIdentity::generate().unwrap(), announcement("svc-4"));
        builder.add_address("10.0.0.1", "scamp+tls://10.0.0.1:30100");
        let first = builder.blob_for("10.0.0.1", false).unwrap();
        assert_eq!(builder.blob_for("10.0.0.1", false).unwrap(), first);

        builder.set_weight(3.0);
        let second = builder.blob_for("10.0.0.1", false).unwrap();
        assert_eq!(ServiceDescriptor::parse(&second).unwrap().weight, 3.0);

        let withdraw = ServiceDescriptor::parse(&builder.blob_for("10.0.0.1", true).unwrap()).unwrap();
        assert!(withdraw.is_withdrawing());
        assert_eq!(withdraw.identity, "svc-4");
    }

    #[test]
    fn test_generate_identity() {
        let a = generate_identity("auth");
        assert!(a.starts_with("auth-"));
        assert_eq!(a.len(), "auth-".len() + 24);
        assert_ne!(a, generate_identity("auth"));
    }
}
