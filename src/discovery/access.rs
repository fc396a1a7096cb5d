//! Which certificate fingerprints may serve which actions.
//!
//! Rule file format, one service per line:
//!
//! ```text
//! # comment
//! AA:BB:...:FF  auth, web:site.render, billing:ALL
//! ```
//!
//! A bare token means sector `main`. `ALL` as the pattern grants every
//! action in its sector. Patterns match case-insensitively on a namespace
//! dot boundary, so `auth` grants `auth` and `auth.getTicket` but not
//! `authority.x`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{debug, warn};

const DEFAULT_SECTOR: &str = "main";

/// Decides whether a certificate may serve an action.
pub trait Authorizer: Send + Sync {
    /// True if `fingerprint` may serve `action` (`namespace.name`) in `sector`.
    fn authorized(&self, fingerprint: &str, sector: &str, action: &str) -> bool;
}

/// Authorizes everything. For closed test networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorized(&self, _fingerprint: &str, _sector: &str, _action: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    sector: String,
    // None grants the whole sector
    pattern: Option<String>,
}

impl Rule {
    fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        let (sector, pattern) = token.split_once(':').unwrap_or((DEFAULT_SECTOR, token));
        let pattern = if pattern == "ALL" {
            None
        } else {
            Some(pattern.to_ascii_lowercase())
        };
        Some(Self {
            sector: sector.to_ascii_lowercase(),
            pattern,
        })
    }

    fn matches(&self, sector: &str, action: &str) -> bool {
        if !self.sector.eq_ignore_ascii_case(sector) {
            return false;
        }
        let Some(pattern) = &self.pattern else {
            return true;
        };
        let action = action.to_ascii_lowercase();
        match action.strip_prefix(pattern.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }
}

/// Compiled rule file.
#[derive(Debug, Clone, Default)]
pub struct AccessFilter {
    rules: HashMap<String, Vec<Rule>>,
}

impl AccessFilter {
    /// Compile rule text. Unparseable lines grant nothing.
    pub fn parse(text: &str) -> Self {
        let mut rules = HashMap::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (fingerprint, tokens) = line
                .split_once(char::is_whitespace)
                .unwrap_or((line, ""));
            let compiled: Vec<Rule> = tokens.split(',').filter_map(Rule::parse).collect();
            rules.insert(fingerprint.to_string(), compiled);
        }
        Self { rules }
    }

    /// Number of fingerprints with a rule line.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True if no fingerprint has a rule line.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Authorizer for AccessFilter {
    fn authorized(&self, fingerprint: &str, sector: &str, action: &str) -> bool {
        if action.starts_with("_meta.") {
            return true;
        }
        if sector.contains(':') || action.contains(':') {
            return false;
        }
        let Some(rules) = self.rules.get(fingerprint) else {
            return false;
        };
        rules.iter().any(|rule| rule.matches(sector, action))
    }
}

/// Rule file on disk, recompiled whenever its modification time changes.
#[derive(Debug)]
pub struct AccessFile {
    path: PathBuf,
    cached: Mutex<Option<(SystemTime, Arc<AccessFilter>)>>,
}

impl AccessFile {
    /// Watch the rule file at `path`. Nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    /// Rule file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current compiled filter. If the file cannot be read the previous
    /// filter stays in effect; with no previous filter nothing is authorized.
    pub fn current(&self) -> Arc<AccessFilter> {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot stat authorized services file");
                return cached
                    .as_ref()
                    .map(|(_, filter)| Arc::clone(filter))
                    .unwrap_or_default();
            }
        };

        if let Some((seen, filter)) = cached.as_ref() {
            if *seen == mtime {
                return Arc::clone(filter);
            }
        }

        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let filter = Arc::new(AccessFilter::parse(&text));
                debug!(path = %self.path.display(), services = filter.len(), "loaded authorized services");
                *cached = Some((mtime, Arc::clone(&filter)));
                filter
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read authorized services file");
                cached
                    .as_ref()
                    .map(|(_, filter)| Arc::clone(filter))
                    .unwrap_or_default()
            }
        }
    }
}

impl Authorizer for AccessFile {
    fn authorized(&self, fingerprint: &str, sector: &str, action: &str) -> bool {
        self.current().authorized(fingerprint, sector, action)
    }
}

impl<A: Authorizer + ?Sized> Authorizer for Arc<A> {
    fn authorized(&self, fingerprint: &str, sector: &str, action: &str) -> bool {
        (**self).authorized(fingerprint, sector, action)
    }
}
