//! Path canonicalization and allow-list matching.
//!
//! Filesystem allow-lists are compared against canonical absolute paths: the
//! longest existing ancestor is resolved through the filesystem (symlinks
//! followed), the remainder is normalized lexically. The leaf never has to
//! exist, so write targets can be checked before creation.

use globset::{Glob, GlobBuilder, GlobMatcher};
use std::path::{Component, Path, PathBuf};

/// Resolve `path` to a canonical absolute path without requiring the leaf to
/// exist. Inputs containing NUL bytes fail. `..` components are consumed
/// during normalization; at the root they are absorbed (POSIX `/..` = `/`).
pub fn canonicalize_lenient(path: &Path) -> Result<PathBuf, String> {
    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.contains(&0) {
        return Err("path contains NUL byte".to_string());
    }
    if bytes.is_empty() {
        return Err("empty path".to_string());
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| format!("cannot resolve working directory: {}", e))?
            .join(path)
    };

    let normalized = normalize_lexically(&absolute);

    // Fast path: the whole thing exists.
    if let Ok(resolved) = std::fs::canonicalize(&normalized) {
        return Ok(resolved);
    }

    // Resolve the deepest existing ancestor, then append the rest verbatim
    // (already free of `.` and `..`).
    let mut existing = normalized.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.as_os_str().is_empty() {
        if let Ok(resolved) = std::fs::canonicalize(&existing) {
            let mut out = resolved;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return Ok(out);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }

    Ok(normalized)
}

/// Remove `.` and resolve `..` against preceding components, without touching
/// the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push("/");
    }
    out
}

/// True when `candidate` lies under `prefix`, comparing canonical strings and
/// requiring the character at the prefix boundary to be end-of-string or a
/// path separator. Never matches partial components: `/app/data-x` is not
/// under `/app/data`.
pub fn prefix_matches(candidate: &Path, prefix: &Path) -> bool {
    let candidate = candidate.to_string_lossy();
    let mut prefix = prefix.to_string_lossy().into_owned();
    while prefix.len() > 1 && prefix.ends_with('/') {
        prefix.pop();
    }
    if !candidate.starts_with(&prefix) {
        return false;
    }
    if prefix == "/" {
        return true;
    }
    match candidate.as_bytes().get(prefix.len()) {
        None => true,
        Some(b'/') => true,
        Some(_) => false,
    }
}

/// One compiled allow-list entry: a glob when the pattern carries
/// metacharacters, a boundary-checked prefix otherwise.
#[derive(Debug, Clone)]
pub enum AllowEntry {
    Prefix(PathBuf),
    Glob { pattern: String, matcher: GlobMatcher },
}

impl AllowEntry {
    pub fn compile(pattern: &str) -> Result<Self, String> {
        if pattern.contains(['*', '?', '[']) {
            // Trailing `/` on a glob entry means "everything under here".
            let expanded = if let Some(stripped) = pattern.strip_suffix('/') {
                format!("{}/**", stripped)
            } else {
                pattern.to_string()
            };
            // literal_separator keeps `*` within one segment; `**` still
            // spans segments.
            let glob = GlobBuilder::new(&expanded)
                .literal_separator(true)
                .build()
                .map_err(|e| format!("invalid glob '{}': {}", pattern, e))?;
            let matcher = glob.compile_matcher();
            Ok(Self::Glob {
                pattern: pattern.to_string(),
                matcher,
            })
        } else {
            Ok(Self::Prefix(PathBuf::from(pattern)))
        }
    }

    pub fn matches(&self, canonical: &Path) -> bool {
        match self {
            Self::Prefix(prefix) => prefix_matches(canonical, prefix),
            Self::Glob { matcher, .. } => matcher.is_match(canonical),
        }
    }

    pub fn pattern(&self) -> String {
        match self {
            Self::Prefix(prefix) => prefix.to_string_lossy().into_owned(),
            Self::Glob { pattern, .. } => pattern.clone(),
        }
    }
}

/// Collection-name patterns for the vector policy. Same `*`/`**` syntax, but
/// collection names have no separator semantics.
pub fn compile_name_pattern(pattern: &str) -> Result<GlobMatcher, String> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| format!("invalid pattern '{}': {}", pattern, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_parent_components() {
        let p = canonicalize_lenient(Path::new("/app/data/../../etc/shadow")).unwrap();
        assert_eq!(p, PathBuf::from("/etc/shadow"));
    }

    #[test]
    fn parent_at_root_is_absorbed() {
        let p = canonicalize_lenient(Path::new("/../../etc/hosts")).unwrap();
        assert_eq!(p, PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn rejects_nul_bytes() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        let raw = OsStr::from_bytes(b"/tmp/x\0y");
        assert!(canonicalize_lenient(Path::new(raw)).is_err());
    }

    #[test]
    fn nonexistent_leaf_resolves_under_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new/deep/file.txt");
        let resolved = canonicalize_lenient(&target).unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(resolved, base.join("new/deep/file.txt"));
    }

    #[test]
    fn resolves_symlinked_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let resolved = canonicalize_lenient(&link.join("file.txt")).unwrap();
        let canonical_real = std::fs::canonicalize(&real).unwrap();
        assert_eq!(resolved, canonical_real.join("file.txt"));
    }

    #[test]
    fn prefix_requires_component_boundary() {
        assert!(prefix_matches(
            Path::new("/app/data/file.txt"),
            Path::new("/app/data")
        ));
        assert!(prefix_matches(
            Path::new("/app/data/file.txt"),
            Path::new("/app/data/")
        ));
        assert!(prefix_matches(Path::new("/app/data"), Path::new("/app/data")));
        assert!(!prefix_matches(
            Path::new("/app/database/file.txt"),
            Path::new("/app/data")
        ));
        assert!(prefix_matches(Path::new("/etc/hosts"), Path::new("/")));
    }

    #[test]
    fn glob_star_stays_within_segment() {
        let entry = AllowEntry::compile("/logs/*.txt").unwrap();
        assert!(entry.matches(Path::new("/logs/app.txt")));
        assert!(!entry.matches(Path::new("/logs/nested/app.txt")));
    }

    #[test]
    fn double_star_spans_segments() {
        let entry = AllowEntry::compile("/logs/**/*.txt").unwrap();
        assert!(entry.matches(Path::new("/logs/a/b/app.txt")));
    }

    #[test]
    fn trailing_slash_glob_is_recursive() {
        let entry = AllowEntry::compile("/data/*/staging/").unwrap();
        assert!(entry.matches(Path::new("/data/alpha/staging/x/y.bin")));
        assert!(!entry.matches(Path::new("/data/alpha/prod/x.bin")));
    }
}
