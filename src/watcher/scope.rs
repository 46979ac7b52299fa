//! Monitored directory set
//!
//! Scopes are compared as normalized strings: absolute, `/` separated,
//! lowercased, with exactly one trailing separator. Containment is then a
//! plain prefix test that ignores case and separator style.

use std::path::{Path, PathBuf};
use tracing::warn;

/// One monitored directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Directory as given (made absolute)
    pub path: PathBuf,
    /// Normalized comparison key
    key: String,
}

impl Scope {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Set of monitored directories
#[derive(Debug, Clone, Default)]
pub struct ScopeSet {
    scopes: Vec<Scope>,
}

impl ScopeSet {
    /// Build from candidate directories, skipping any that do not exist
    pub fn from_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut set = Self::default();
        for dir in dirs {
            let dir = dir.as_ref();
            if !dir.is_dir() {
                warn!("Monitored directory not found, skipping: {:?}", dir);
                continue;
            }
            set.insert(dir);
        }
        set
    }

    /// Add a directory without checking that it exists
    pub fn insert(&mut self, dir: &Path) -> bool {
        let path = absolute(dir);
        let key = scope_key(&path);
        if self.scopes.iter().any(|s| s.key == key) {
            return false;
        }
        self.scopes.push(Scope { path, key });
        true
    }

    /// Whether a file path lies under any scope
    pub fn contains(&self, path: &Path) -> bool {
        let candidate = normalize(&path.to_string_lossy());
        self.scopes.iter().any(|s| candidate.starts_with(&s.key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.scopes.iter().map(|s| s.path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

fn absolute(dir: &Path) -> PathBuf {
    if let Ok(canonical) = dir.canonicalize() {
        return canonical;
    }
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(dir))
            .unwrap_or_else(|_| dir.to_path_buf())
    }
}

fn scope_key(path: &Path) -> String {
    let mut key = normalize(&path.to_string_lossy());
    while key.len() > 1 && key.ends_with('/') {
        key.pop();
    }
    if !key.ends_with('/') {
        key.push('/');
    }
    key
}

/// Lowercase, unify separators and collapse repeated ones
pub fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.extend(c.to_lowercase());
    }
    out
}
