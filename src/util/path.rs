use std::path::Path;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};

/// Compute the relative path from `base` to `full` as a forward-slash string.
pub fn relative_path(base: &Path, full: &Path) -> Result<String> {
    let rel = full
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", full.display(), base.display()))?;

    let s = rel.to_string_lossy().replace('\\', "/");
    Ok(s)
}

/// Normalize a remote path: collapse duplicate slashes, drop the trailing
/// slash, and map the store root (`/`) to the empty string.
pub fn normalize_remote(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return String::new();
    }
    format!("/{}", segments.join("/"))
}

/// Remote paths compare case-insensitively.
pub fn path_lower(path: &str) -> String {
    normalize_remote(path).to_lowercase()
}

/// Fixed-width digest of the lower-cased remote path (40 hex chars).
pub fn path_hash(path: &str) -> String {
    let digest = Sha1::digest(path_lower(path).as_bytes());
    crate::util::hash::hex_encode(&digest)
}

/// Number of separators in a normalized path: `/a` is 1, `/a/b` is 2.
pub fn depth(path: &str) -> usize {
    normalize_remote(path).matches('/').count()
}

/// Parent of a normalized remote path; `None` for the store root.
pub fn parent(path: &str) -> Option<String> {
    let norm = normalize_remote(path);
    if norm.is_empty() {
        return None;
    }
    norm.rsplit_once('/').map(|(p, _)| p.to_string())
}

/// Last segment of a remote path.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

pub fn join(parent: &str, name: &str) -> String {
    normalize_remote(&format!("{parent}/{name}"))
}

/// Whether `path` is `root` or lies below it (case-insensitive).
pub fn is_under(root: &str, path: &str) -> bool {
    let root = path_lower(root);
    let path = path_lower(path);
    root.is_empty() || path == root || path.starts_with(&format!("{root}/"))
}

/// Whether any segment of `path` below `root` starts with the hidden prefix.
pub fn is_hidden(root: &str, path: &str, hidden_prefix: &str) -> bool {
    if hidden_prefix.is_empty() {
        return false;
    }
    let norm = normalize_remote(path);
    let root_len = normalize_remote(root).len();
    norm.get(root_len..)
        .unwrap_or("")
        .split('/')
        .any(|seg| seg.starts_with(hidden_prefix))
}

/// Whether a single local name should be ignored.
pub fn is_hidden_name(name: &str, hidden_prefix: &str) -> bool {
    !hidden_prefix.is_empty() && name.starts_with(hidden_prefix)
}

/// Replace the `old_prefix` of `path` with `new_prefix`. The caller must
/// have checked that `path` is under `old_prefix`.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> String {
    let old_len = normalize_remote(old_prefix).chars().count();
    let rest: String = normalize_remote(path).chars().skip(old_len).collect();
    normalize_remote(&format!("{new_prefix}{rest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path() {
        let base = Path::new("/home/user/sync");
        let full = Path::new("/home/user/sync/docs/report.pdf");
        assert_eq!(relative_path(base, full).unwrap(), "docs/report.pdf");
    }

    #[test]
    fn normalize_collapses_slashes() {
        assert_eq!(normalize_remote("/a//b/"), "/a/b");
        assert_eq!(normalize_remote("/"), "");
        assert_eq!(normalize_remote("a/b"), "/a/b");
    }

    #[test]
    fn path_hash_is_case_insensitive_and_fixed_width() {
        let a = path_hash("/Root/Docs");
        let b = path_hash("/root/docs/");
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn depth_counts_separators() {
        assert_eq!(depth("/a"), 1);
        assert_eq!(depth("/a/b"), 2);
        assert_eq!(depth("/a/b/c.txt"), 3);
    }

    #[test]
    fn parent_and_name() {
        assert_eq!(parent("/a/b/c.txt").as_deref(), Some("/a/b"));
        assert_eq!(parent("/a").as_deref(), Some(""));
        assert_eq!(parent("/"), None);
        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(join("", "b"), "/b");
    }

    #[test]
    fn under_root() {
        assert!(is_under("/Root", "/root/Docs"));
        assert!(is_under("/root", "/root"));
        assert!(!is_under("/root", "/rootless/x"));
        assert!(is_under("", "/anything"));
    }

    #[test]
    fn hidden_segments_below_root() {
        assert!(is_hidden("/root", "/root/.git/config", "."));
        assert!(is_hidden("/root", "/root/a/.DS_Store", "."));
        assert!(!is_hidden("/.apps/root", "/.apps/root/a.txt", "."));
        assert!(!is_hidden("/root", "/root/a.txt", ""));
    }

    #[test]
    fn rebase_keeps_suffix() {
        assert_eq!(rebase("/r/old/x/y.txt", "/r/old", "/r/new"), "/r/new/x/y.txt");
        assert_eq!(rebase("/r/Old", "/r/old", "/r/new"), "/r/new");
    }
}
