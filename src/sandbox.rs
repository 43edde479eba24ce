//! Sandbox Guard
//!
//! Path allow/deny decisions against the trust-boundary root. Every
//! mutation target in the pipeline passes through here before any write.
//! Rejections never panic; each one is recorded with a reason and
//! timestamp and is visible through the observability accessors.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use crate::types::{SandboxViolation, ViolationReason};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Case-insensitive substrings that mark a path off-limits regardless of
/// where it resolves. Credential stores, key material, shell and cloud
/// configuration.
pub static BLOCKED_PATH_PATTERNS: &[&str] = &[
    ".env",
    "wallet.json",
    "credentials",
    "secrets",
    ".ssh",
    "id_rsa",
    "id_ed25519",
    ".aws",
    ".kube",
    ".gnupg",
    ".netrc",
    ".npmrc",
    ".bashrc",
    ".zshrc",
    ".profile",
    "authorized_keys",
];

/// File extensions that are never writable (private-key formats).
pub static BLOCKED_EXTENSIONS: &[&str] = &["pem", "key", "p12", "pfx", "crt", "der"];

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Constructor-injected path guard. One instance per orchestrator; tests
/// construct their own over scratch roots.
pub struct SandboxGuard {
    root: PathBuf,
    violations: Mutex<Vec<SandboxViolation>>,
}

impl SandboxGuard {
    /// Create a guard rooted at `root`. The root itself is normalized so
    /// containment checks compare like with like.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = normalize(root.as_ref(), None);
        Self {
            root,
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Returns `true` when `path` may be mutated: it normalizes inside
    /// the sandbox root, matches no blocklist entry, and carries no
    /// blocked extension. Never panics; every rejection is recorded.
    pub fn is_path_allowed(&self, path: &str) -> bool {
        self.check(path).is_ok()
    }

    /// Returns the normalized absolute path only if it is allowed.
    pub fn resolve_path(&self, path: &str) -> Option<PathBuf> {
        self.check(path).ok()
    }

    /// The trust-boundary root this guard enforces.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of rejections recorded since construction.
    pub fn violation_count(&self) -> usize {
        self.violations.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// Snapshot of all recorded violations.
    pub fn violations(&self) -> Vec<SandboxViolation> {
        self.violations
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    // --- internals ---

    fn check(&self, path: &str) -> Result<PathBuf, ViolationReason> {
        if path.is_empty() {
            self.record(path, ViolationReason::Unresolvable);
            return Err(ViolationReason::Unresolvable);
        }

        let candidate = normalize(Path::new(path), Some(&self.root));

        // Containment first: traversal-obfuscated escapes fail here no
        // matter what the raw string looked like.
        if !candidate.starts_with(&self.root) {
            self.record(path, ViolationReason::EscapesRoot);
            return Err(ViolationReason::EscapesRoot);
        }

        // Blocklist match is case-insensitive over the normalized form.
        let lower = candidate.to_string_lossy().to_lowercase();
        if BLOCKED_PATH_PATTERNS.iter().any(|p| lower.contains(p)) {
            self.record(path, ViolationReason::BlockedName);
            return Err(ViolationReason::BlockedName);
        }

        if let Some(ext) = candidate.extension().and_then(|e| e.to_str()) {
            let ext = ext.to_lowercase();
            if BLOCKED_EXTENSIONS.iter().any(|b| *b == ext) {
                self.record(path, ViolationReason::BlockedExtension);
                return Err(ViolationReason::BlockedExtension);
            }
        }

        Ok(candidate)
    }

    fn record(&self, path: &str, reason: ViolationReason) {
        let violation = SandboxViolation {
            path: path.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            reason,
        };
        warn!(
            "Sandbox violation: {} ({:?})",
            violation.path, violation.reason
        );
        if let Ok(mut violations) = self.violations.lock() {
            violations.push(violation);
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Resolve `path` to an absolute, lexically-normalized form. Relative
/// paths are joined onto `base` (or the current directory). Symlinked
/// ancestors are resolved through `fs::canonicalize` when they exist;
/// the not-yet-existing tail is normalized component by component so
/// `..` can never smuggle the result outside its parent.
fn normalize(path: &Path, base: Option<&Path>) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match base {
            Some(b) => b.join(path),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("/"))
                .join(path),
        }
    };

    // Canonicalize the deepest existing ancestor, then re-append the
    // remaining components lexically.
    let mut existing = absolute.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                existing.pop();
            }
            None => break,
        }
    }

    let mut result = fs::canonicalize(&existing).unwrap_or(existing);
    for name in tail.iter().rev() {
        result.push(name);
    }

    lexical_resolve(&result)
}

/// Collapse `.` and `..` components without touching the filesystem.
fn lexical_resolve(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("metamorph-sandbox-{}-{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_allows_path_inside_root() {
        let root = scratch_root("inside");
        let guard = SandboxGuard::new(&root);
        let target = root.join("src/perf/cache.rs");
        assert!(guard.is_path_allowed(target.to_str().unwrap()));
        assert_eq!(guard.violation_count(), 0);
    }

    #[test]
    fn test_rejects_traversal_escape() {
        let root = scratch_root("traversal");
        let guard = SandboxGuard::new(&root);
        let sneaky = root.join("src/../../outside.rs");
        assert!(!guard.is_path_allowed(sneaky.to_str().unwrap()));
        assert!(!guard.is_path_allowed("../../../etc/passwd"));
        assert_eq!(guard.violations()[0].reason, ViolationReason::EscapesRoot);
    }

    #[test]
    fn test_rejects_blocklisted_names_inside_root() {
        let root = scratch_root("blocklist");
        let guard = SandboxGuard::new(&root);
        let env_file = root.join(".env");
        assert!(!guard.is_path_allowed(env_file.to_str().unwrap()));
        let upper = root.join("config/.ENV");
        assert!(!guard.is_path_allowed(upper.to_str().unwrap()));
        assert!(guard
            .violations()
            .iter()
            .all(|v| v.reason == ViolationReason::BlockedName));
    }

    #[test]
    fn test_rejects_private_key_extensions() {
        let root = scratch_root("ext");
        let guard = SandboxGuard::new(&root);
        let pem = root.join("certs/server.pem");
        assert!(!guard.is_path_allowed(pem.to_str().unwrap()));
    }

    #[test]
    fn test_resolve_path_returns_absolute_only_when_allowed() {
        let root = scratch_root("resolve");
        let guard = SandboxGuard::new(&root);
        let resolved = guard.resolve_path("src/new.rs").unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.starts_with(guard.root()));
        assert!(guard.resolve_path("/etc/passwd").is_none());
    }

    #[test]
    fn test_violations_are_recorded_with_timestamps() {
        let root = scratch_root("record");
        let guard = SandboxGuard::new(&root);
        let _ = guard.is_path_allowed("/etc/shadow");
        let violations = guard.violations();
        assert_eq!(violations.len(), 1);
        assert!(!violations[0].timestamp.is_empty());
    }
}
