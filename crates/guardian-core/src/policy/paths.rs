//! Protected-file semantics — spec §4.3.6 / §9.
//!
//! Matching is on path segments (basename equality or protected-directory
//! prefix), never substring, and is case-insensitive everywhere (spec §9
//! open question 4: the teacher's case-sensitivity is inconsistent across
//! call sites; this spec requires case-insensitive matching uniformly).

const PROTECTED_BASENAMES: &[&str] = &[
    "wallet.json",
    ".env",
    "config.json",
    "soul.json",
    "identity.json",
    "policy_engine.rs",
    "policy_rules.rs",
    "sandbox_defense.rs",
    "private-key.pem",
];

const PROTECTED_DIR_SEGMENTS: &[&str] = &[".ssh", ".gnupg"];

const PROTECTED_DIR_PREFIXES: &[&str] = &["/etc/systemd/system/", "/proc/self/"];

fn segments_lower(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

/// True if `path` names (by basename or directory segment) a protected
/// artifact.
pub fn is_protected(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    if PROTECTED_DIR_PREFIXES.iter().any(|p| lower.starts_with(&p.to_ascii_lowercase())) {
        return true;
    }
    let segments = segments_lower(path);
    let Some(basename) = segments.last() else { return false };

    if PROTECTED_BASENAMES.iter().any(|b| b.eq_ignore_ascii_case(basename)) {
        return true;
    }
    if segments.iter().any(|s| PROTECTED_DIR_SEGMENTS.contains(&s.as_str())) {
        return true;
    }
    false
}

/// True if `path` names a sensitive-read target: wallet, env, config,
/// `*.key`, `*.pem`, `private-key*`.
pub fn is_sensitive_read(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let segments = segments_lower(path);
    let Some(basename) = segments.last() else { return false };

    if basename.contains("wallet")
        || basename == ".env"
        || basename.contains("config")
        || basename.ends_with(".key")
        || basename.ends_with(".pem")
        || basename.starts_with("private-key")
    {
        return true;
    }
    let _ = lower;
    false
}

/// True if `path` contains a `..` segment that would resolve outside the
/// current working directory, or a `//` sequence.
pub fn has_traversal(path: &str) -> bool {
    if path.contains("//") {
        return true;
    }
    // Count net directory depth; any point where depth would go negative
    // means the path escapes its starting root.
    let mut depth: i64 = 0;
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_exact_basename_not_substring() {
        assert!(is_protected("wallet.json"));
        assert!(is_protected("/home/agent/.automaton/wallet.json"));
        assert!(!is_protected("test-wallet.json"));
        assert!(!is_protected("my-config.json"));
    }

    #[test]
    fn case_insensitive() {
        assert!(is_protected("WALLET.JSON"));
        assert!(is_protected("/root/.SSH/id_rsa"));
    }

    #[test]
    fn blocked_directories() {
        assert!(is_protected("/etc/systemd/system/evil.service"));
        assert!(is_protected("/proc/self/mem"));
        assert!(is_protected("/home/agent/.ssh/id_rsa"));
    }

    #[test]
    fn sensitive_read_targets() {
        assert!(is_sensitive_read("wallet.json"));
        assert!(is_sensitive_read(".env"));
        assert!(is_sensitive_read("id_rsa.pem"));
        assert!(is_sensitive_read("api.key"));
        assert!(is_sensitive_read("private-key-backup.txt"));
        assert!(!is_sensitive_read("readme.md"));
    }

    #[test]
    fn traversal_detection() {
        assert!(has_traversal("../../etc/passwd"));
        assert!(has_traversal("a//b"));
        assert!(!has_traversal("a/../b"));
        assert!(!has_traversal("a/b/c"));
    }
}
