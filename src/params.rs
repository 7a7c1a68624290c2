//! Component parameters with interned keys and shared-set overlays.
//!
//! A [`Params`] is a string key/value map consulted local-first, then
//! through an ordered list of attached shared parameter sets; the first
//! hit wins. Keys are interned to `u32` ids in a process-wide table so a
//! lookup costs one hash plus one probe per layer. Shared sets are also
//! process-wide, which gives every partition the same view of them.
//!
//! Verification is a diagnostic layer: when enabled, a lookup outside the
//! declared allowed-key sets logs a warning. It never fails.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Process-wide key interning table.
#[derive(Default)]
struct KeyTable {
    forward: HashMap<String, u32>,
    // Index 0 is reserved; real ids start at 1.
    reverse: Vec<String>,
}

impl KeyTable {
    fn new() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: vec!["<reserved>".to_string()],
        }
    }
}

fn key_table() -> &'static RwLock<KeyTable> {
    static TABLE: OnceLock<RwLock<KeyTable>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(KeyTable::new()))
}

/// Interns a key, returning its process-wide id.
fn intern(key: &str) -> u32 {
    if let Some(&id) = key_table().read().forward.get(key) {
        return id;
    }
    let mut table = key_table().write();
    if let Some(&id) = table.forward.get(key) {
        return id;
    }
    let id = table.reverse.len() as u32;
    table.reverse.push(key.to_string());
    table.forward.insert(key.to_string(), id);
    id
}

/// Resolves an interned id back to its key string.
fn key_name(id: u32) -> String {
    key_table().read().reverse[id as usize].clone()
}

/// Process-wide shared parameter sets, keyed by set name.
#[derive(Default)]
struct SharedSets {
    sets: HashMap<String, HashMap<u32, String>>,
}

fn shared_sets() -> &'static RwLock<SharedSets> {
    static SETS: OnceLock<RwLock<SharedSets>> = OnceLock::new();
    SETS.get_or_init(|| RwLock::new(SharedSets::default()))
}

/// Global verification toggle; individual `Params` can also opt out.
fn global_verify() -> &'static RwLock<bool> {
    static FLAG: OnceLock<RwLock<bool>> = OnceLock::new();
    FLAG.get_or_init(|| RwLock::new(false))
}

/// Enables or disables parameter-verification warnings process-wide.
pub fn enable_verify(enabled: bool) {
    *global_verify().write() = enabled;
}

/// Inserts a key/value into a named shared set, creating the set if
/// needed.
pub fn insert_shared(set: &str, key: &str, value: &str, overwrite: bool) {
    let id = intern(key);
    let mut sets = shared_sets().write();
    let entries = sets.sets.entry(set.to_string()).or_default();
    if overwrite {
        entries.insert(id, value.to_string());
    } else {
        entries.entry(id).or_insert_with(|| value.to_string());
    }
}

/// Returns a snapshot of a shared set as plain strings.
pub fn shared_set(name: &str) -> BTreeMap<String, String> {
    let sets = shared_sets().read();
    let mut out = BTreeMap::new();
    if let Some(entries) = sets.sets.get(name) {
        for (&id, v) in entries {
            out.insert(key_name(id), v.clone());
        }
    }
    out
}

/// Names of every shared set defined in this process.
pub fn shared_set_names() -> Vec<String> {
    let mut names: Vec<_> = shared_sets().read().sets.keys().cloned().collect();
    names.sort();
    names
}

/// Semantic string key/value map with shared-set fallbacks.
#[derive(Clone, Debug, Default)]
pub struct Params {
    local: HashMap<u32, String>,
    /// Attached shared set names, in attachment order.
    shared: Vec<String>,
    allowed_keys: Vec<HashSet<String>>,
    verify_enabled: bool,
}

impl Params {
    pub fn new() -> Self {
        Self {
            local: HashMap::new(),
            shared: Vec::new(),
            allowed_keys: Vec::new(),
            verify_enabled: true,
        }
    }

    /// Inserts a local key/value. With `overwrite == false` an existing
    /// local value is kept.
    pub fn insert(&mut self, key: &str, value: impl Into<String>, overwrite: bool) {
        let id = intern(key);
        if overwrite {
            self.local.insert(id, value.into());
        } else {
            self.local.entry(id).or_insert_with(|| value.into());
        }
    }

    /// Merges another `Params`: local entries are copied (existing keys
    /// kept) and its shared sets are appended, skipping duplicates.
    pub fn merge(&mut self, other: &Params) {
        for (&id, v) in &other.local {
            self.local.entry(id).or_insert_with(|| v.clone());
        }
        for set in &other.shared {
            if !self.shared.contains(set) {
                self.shared.push(set.clone());
            }
        }
    }

    /// Attaches a shared parameter set as the next fallback layer.
    ///
    /// Attachment order is lookup order and survives serialization.
    pub fn attach_shared_set(&mut self, name: &str) {
        shared_sets()
            .write()
            .sets
            .entry(name.to_string())
            .or_default();
        if !self.shared.contains(&name.to_string()) {
            self.shared.push(name.to_string());
        }
    }

    /// Raw lookup: local first, then shared sets in attachment order.
    pub fn get(&self, key: &str) -> Option<String> {
        self.verify_key(key);
        let Some(&id) = key_table().read().forward.get(key) else {
            return None;
        };
        if let Some(v) = self.local.get(&id) {
            return Some(v.clone());
        }
        let sets = shared_sets().read();
        for name in &self.shared {
            if let Some(v) = sets.sets.get(name).and_then(|s| s.get(&id)) {
                return Some(v.clone());
            }
        }
        None
    }

    /// Typed lookup with a default. A present-but-unparsable value falls
    /// back to the default with a warning.
    pub fn get_typed<T: FromStr + Clone>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(raw) => match raw.parse() {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(key, value = %raw, "parameter value failed to parse, using default");
                    default
                }
            },
            None => default,
        }
    }

    /// Splits an array-valued parameter on commas, honoring quoted tokens
    /// and backslash escapes, e.g. `a, "b, c", d` yields three tokens.
    pub fn get_array(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(raw) => split_delimited(&raw, ','),
            None => Vec::new(),
        }
    }

    /// Returns a new `Params` containing only keys starting with
    /// `"<scope>."`, with the prefix stripped. Shared layers are flattened
    /// into the result.
    pub fn get_scoped(&self, scope: &str) -> Params {
        let prefix = format!("{scope}.");
        let mut out = Params::new();
        out.verify_enabled = false;
        for key in self.keys() {
            if let Some(stripped) = key.strip_prefix(&prefix) {
                if let Some(value) = self.lookup_no_verify(&key) {
                    out.insert(stripped, value, false);
                }
            }
        }
        out.allowed_keys = self.allowed_keys.clone();
        out.verify_enabled = self.verify_enabled;
        out
    }

    fn lookup_no_verify(&self, key: &str) -> Option<String> {
        let Some(&id) = key_table().read().forward.get(key) else {
            return None;
        };
        if let Some(v) = self.local.get(&id) {
            return Some(v.clone());
        }
        let sets = shared_sets().read();
        for name in &self.shared {
            if let Some(v) = sets.sets.get(name).and_then(|s| s.get(&id)) {
                return Some(v.clone());
            }
        }
        None
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup_no_verify(key).is_some()
    }

    /// All visible keys across local and shared layers.
    pub fn keys(&self) -> Vec<String> {
        let mut set = HashSet::new();
        for &id in self.local.keys() {
            set.insert(key_name(id));
        }
        let sets = shared_sets().read();
        for name in &self.shared {
            if let Some(entries) = sets.sets.get(name) {
                for &id in entries.keys() {
                    set.insert(key_name(id));
                }
            }
        }
        let mut out: Vec<_> = set.into_iter().collect();
        out.sort();
        out
    }

    /// Keys present in the local layer only.
    pub fn local_keys(&self) -> Vec<String> {
        let mut out: Vec<_> = self.local.keys().map(|&id| key_name(id)).collect();
        out.sort();
        out
    }

    /// Shared set names attached to this `Params`, in attachment order.
    pub fn subscribed_shared_sets(&self) -> &[String] {
        &self.shared
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.shared.iter().all(|s| shared_set(s).is_empty())
    }

    /// Declares a set of documented keys; lookups outside the union of
    /// pushed sets warn when verification is on.
    pub fn push_allowed_keys(&mut self, keys: &[&str]) {
        self.allowed_keys
            .push(keys.iter().map(|s| s.to_string()).collect());
    }

    pub fn pop_allowed_keys(&mut self) {
        self.allowed_keys.pop();
    }

    pub fn enable_verify(&mut self, enabled: bool) {
        self.verify_enabled = enabled;
    }

    fn verify_key(&self, key: &str) {
        if !self.verify_enabled || !*global_verify().read() {
            return;
        }
        if self.allowed_keys.is_empty() {
            return;
        }
        for set in self.allowed_keys.iter().rev() {
            if set.contains(key) {
                return;
            }
        }
        tracing::warn!(key, "parameter is undocumented");
    }
}

/// Serialized form: interned ids resolved back to strings so the layout is
/// stable across processes with different interning histories.
#[derive(Serialize, Deserialize)]
struct ParamsRepr {
    local: BTreeMap<String, String>,
    shared: Vec<String>,
}

impl Serialize for Params {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = ParamsRepr {
            local: self
                .local
                .iter()
                .map(|(&id, v)| (key_name(id), v.clone()))
                .collect(),
            shared: self.shared.clone(),
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Params {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = ParamsRepr::deserialize(deserializer)?;
        let mut p = Params::new();
        for (k, v) in repr.local {
            p.insert(&k, v, true);
        }
        for set in repr.shared {
            p.attach_shared_set(&set);
        }
        Ok(p)
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut p = Params::new();
        for (k, v) in iter {
            p.insert(&k, v, true);
        }
        p
    }
}

/// Quote- and escape-aware delimiter split for array-valued parameters.
fn split_delimited(value: &str, delim: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;
    let mut escape = false;

    for c in value.chars() {
        if escape {
            current.push(c);
            escape = false;
            continue;
        }
        match in_quote {
            Some(q) => {
                if c == '\\' {
                    escape = true;
                } else if c == q {
                    in_quote = None;
                } else {
                    current.push(c);
                }
            }
            None => {
                if c == delim {
                    let t = current.trim().to_string();
                    if !t.is_empty() {
                        tokens.push(t);
                    }
                    current.clear();
                } else if c == '"' || c == '\'' {
                    in_quote = Some(c);
                } else {
                    current.push(c);
                }
            }
        }
    }
    let t = current.trim().to_string();
    if !t.is_empty() {
        tokens.push(t);
    }
    tokens
}
