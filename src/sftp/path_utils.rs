//! Remote path utilities
//!
//! SFTP paths always use `/` as separator, even on Windows servers.

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Resolve a cursor-relative path.
///
/// `~` and `~/x` resolve against `root` (the canonical home), absolute paths
/// stay as they are and everything else is relative to `cwd`.
pub fn resolve_remote_path(root: &str, cwd: &str, path: &str) -> String {
    if path.is_empty() || path == "." {
        cwd.to_string()
    } else if path == "~" {
        root.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        join_remote_path(root, rest)
    } else if is_absolute_remote_path(path) {
        path.to_string()
    } else {
        join_remote_path(cwd, path)
    }
}

/// Parent directory; `/` is its own parent.
pub fn parent_remote_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Lexically collapse `.`, `..` and repeated separators of an absolute path.
pub fn normalize_remote_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_absolute_remote_path() {
        assert!(is_absolute_remote_path("/home/user"));
        assert!(is_absolute_remote_path("/"));
        assert!(!is_absolute_remote_path("relative/path"));
        assert!(!is_absolute_remote_path("C:\\Windows"));
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/", "home"), "/home");
    }

    #[test]
    fn test_resolve_remote_path() {
        let root = "/home/alice";
        let cwd = "/var/log";
        assert_eq!(resolve_remote_path(root, cwd, "~"), "/home/alice");
        assert_eq!(resolve_remote_path(root, cwd, "~/src"), "/home/alice/src");
        assert_eq!(resolve_remote_path(root, cwd, "/etc"), "/etc");
        assert_eq!(resolve_remote_path(root, cwd, "nginx"), "/var/log/nginx");
        assert_eq!(resolve_remote_path(root, cwd, "."), "/var/log");
    }

    #[test]
    fn test_parent_and_normalize() {
        assert_eq!(parent_remote_path("/a/b/c"), "/a/b");
        assert_eq!(parent_remote_path("/a"), "/");
        assert_eq!(parent_remote_path("/"), "/");
        assert_eq!(normalize_remote_path("/a/./b/../c//d/"), "/a/c/d");
        assert_eq!(normalize_remote_path("/.."), "/");
    }
}
