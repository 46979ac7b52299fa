//! Rename-to-ransom-extension detection
//!
//! A file renamed to `.locked`, `.wncry` and the like is a stronger signal
//! than any event rate, and it arrives before a window could fill. Matches
//! go straight to the response path.

use crate::config::SentinelConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// A rename whose destination extension is on the list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastAlert {
    /// Matched extension, lowercase with leading dot
    pub extension: String,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

/// Inspects renames against the suspicious extension set
#[derive(Debug, Clone)]
pub struct ExtensionSentinel {
    extensions: HashSet<String>,
}

impl ExtensionSentinel {
    pub fn new(config: &SentinelConfig) -> Self {
        let extensions = config
            .suspicious_extensions
            .iter()
            .map(|e| format!(".{}", e.trim().trim_start_matches('.').to_lowercase()))
            .collect();
        Self { extensions }
    }

    /// Check the destination of a rename
    pub fn inspect_rename(&self, old_path: &Path, new_path: &Path) -> Option<FastAlert> {
        let extension = extension_of(new_path)?;
        if !self.extensions.contains(&extension) {
            return None;
        }

        Some(FastAlert {
            extension,
            old_path: old_path.to_path_buf(),
            new_path: new_path.to_path_buf(),
        })
    }

    pub fn is_suspicious(&self, old_path: &Path, new_path: &Path) -> bool {
        self.inspect_rename(old_path, new_path).is_some()
    }
}

/// Lowercased final extension with a leading dot
fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel() -> ExtensionSentinel {
        ExtensionSentinel::new(&SentinelConfig::default())
    }

    #[test]
    fn test_locked_rename_matches() {
        let alert = sentinel()
            .inspect_rename(
                Path::new("/home/user/report.docx"),
                Path::new("/home/user/report.docx.locked"),
            )
            .unwrap();

        assert_eq!(alert.extension, ".locked");
        assert_eq!(alert.new_path, Path::new("/home/user/report.docx.locked"));
    }

    #[test]
    fn test_case_insensitive() {
        assert!(sentinel().is_suspicious(Path::new("/d/a.jpg"), Path::new("/d/a.jpg.WNCRY")));
    }

    #[test]
    fn test_benign_renames() {
        let s = sentinel();
        assert!(!s.is_suspicious(Path::new("/d/a.docx"), Path::new("/d/b.docx")));
        assert!(!s.is_suspicious(Path::new("/d/a.docx"), Path::new("/d/locked")));
        // Only the final extension counts
        assert!(!s.is_suspicious(Path::new("/d/a"), Path::new("/d/a.locked.bak")));
    }

    #[test]
    fn test_custom_extensions_normalized() {
        let config = SentinelConfig {
            suspicious_extensions: vec!["LockBit".into(), ".ryk".into()],
        };
        let s = ExtensionSentinel::new(&config);
        assert!(s.is_suspicious(Path::new("/d/a"), Path::new("/d/a.lockbit")));
        assert!(s.is_suspicious(Path::new("/d/a"), Path::new("/d/a.RYK")));
        assert!(!s.is_suspicious(Path::new("/d/a"), Path::new("/d/a.locked")));
    }
}
