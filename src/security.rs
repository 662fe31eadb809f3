//! Safety kernel: allowlist, rate limiting, path containment, command policy.
//!
//! The agent runs with platform permission prompts bypassed, so every tool
//! event it emits is checked here instead. Path checks resolve symlinks; the
//! command check is defense in depth on top of the system-prompt rules.

use crate::UserId;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

/// Allowlist membership is the primary authentication.
pub fn is_authorized(user_id: Option<UserId>, allowed_users: &[i64]) -> bool {
    match user_id {
        Some(id) if !allowed_users.is_empty() => allowed_users.contains(&id.0),
        _ => false,
    }
}

// ---- Rate limiter (token bucket) ----

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-user token bucket with continuous refill at `capacity / window`.
///
/// Buckets are created lazily on first use. Wrap in a mutex for shared use;
/// checks are cheap enough that one coarse lock over the map is fine.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    enabled: bool,
    capacity: f64,
    refill_per_sec: f64,
    buckets: HashMap<UserId, Bucket>,
}

impl RateLimiter {
    pub fn new(enabled: bool, capacity: u32, window: Duration) -> Self {
        let capacity = capacity as f64;
        Self {
            enabled,
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(1e-9),
            buckets: HashMap::new(),
        }
    }

    /// Consume one token. Returns `(allowed, retry_after)`.
    pub fn check(&mut self, user_id: UserId) -> (bool, Option<Duration>) {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&mut self, user_id: UserId, now: Instant) -> (bool, Option<Duration>) {
        if !self.enabled {
            return (true, None);
        }

        let bucket = self.buckets.entry(user_id).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return (true, None);
        }

        let secs = (1.0 - bucket.tokens) / self.refill_per_sec;
        (false, Some(Duration::from_secs_f64(secs.max(0.0))))
    }

    /// Snapshot of remaining tokens, for `/status`.
    pub fn remaining(&self, user_id: UserId) -> f64 {
        self.buckets
            .get(&user_id)
            .map(|b| b.tokens)
            .unwrap_or(self.capacity)
    }
}

// ---- Path containment ----

/// Immutable path policy snapshot.
#[derive(Clone, Debug)]
pub struct PathPolicy {
    pub allowed_paths: Vec<PathBuf>,
    pub temp_paths: Vec<PathBuf>,
    pub home_dir: Option<PathBuf>,
    /// Base for resolving relative paths (the agent's working dir).
    pub base_dir: Option<PathBuf>,
}

impl PathPolicy {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            allowed_paths: cfg.allowed_paths.clone(),
            temp_paths: cfg.temp_paths.clone(),
            home_dir: dirs::home_dir(),
            base_dir: Some(cfg.working_dir.clone()),
        }
    }

    /// Directory-containment check with symlink resolution.
    ///
    /// Accepts when the canonical path equals an allowed root or lies strictly
    /// beneath one, or when it starts with a temp prefix. `Path::starts_with`
    /// compares whole components, so `/foo-bar` never matches root `/foo`.
    pub fn is_path_allowed(&self, raw: &str) -> bool {
        let Some(resolved) = self.resolve(raw) else {
            return false;
        };

        if self.temp_paths.iter().any(|tmp| resolved.starts_with(tmp)) {
            return true;
        }

        self.allowed_paths.iter().any(|allowed| {
            let allowed = self.expand_tilde(allowed);
            match canonicalize_or_normalize(&allowed, self.base_dir.as_deref()) {
                Some(root) => resolved == root || resolved.starts_with(&root),
                None => false,
            }
        })
    }

    fn resolve(&self, raw: &str) -> Option<PathBuf> {
        let expanded = match (&self.home_dir, raw) {
            (Some(home), "~") => home.clone(),
            (Some(home), s) if s.starts_with("~/") => home.join(&s[2..]),
            _ => PathBuf::from(raw),
        };
        canonicalize_or_normalize(&expanded, self.base_dir.as_deref())
    }

    fn expand_tilde(&self, p: &Path) -> PathBuf {
        let Some(home) = &self.home_dir else {
            return p.to_path_buf();
        };
        let mut comps = p.components();
        match comps.next() {
            Some(Component::Normal(os)) if os == "~" => {
                let mut out = home.clone();
                out.extend(comps.map(|c| PathBuf::from(c.as_os_str())));
                out
            }
            _ => p.to_path_buf(),
        }
    }
}

/// Resolve symlinks on the full path, or on the deepest existing prefix when
/// the leaf does not exist yet (re-appending the unresolved tail), falling
/// back to lexical normalization.
fn canonicalize_or_normalize(p: &Path, base_dir: Option<&Path>) -> Option<PathBuf> {
    if let Ok(canon) = std::fs::canonicalize(p) {
        return Some(canon);
    }

    let absolute = if p.is_absolute() {
        p.to_path_buf()
    } else {
        let base = match base_dir {
            Some(b) => b.to_path_buf(),
            None => std::env::current_dir().ok()?,
        };
        base.join(p)
    };
    let absolute = normalize_lexically(&absolute);

    // Walk up until a prefix exists, canonicalize it, then re-append the tail.
    let mut prefix = absolute.as_path();
    let mut tail = Vec::new();
    while let Some(parent) = prefix.parent() {
        if prefix.exists() {
            break;
        }
        if let Some(name) = prefix.file_name() {
            tail.push(name.to_os_string());
        }
        prefix = parent;
    }

    let mut out = std::fs::canonicalize(prefix).unwrap_or_else(|_| prefix.to_path_buf());
    for name in tail.into_iter().rev() {
        out.push(name);
    }
    Some(out)
}

fn normalize_lexically(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---- Command policy ----

/// Check a Bash command against blocked patterns and the `rm` target policy.
///
/// Returns `Ok(())` or the human-readable denial reason.
pub fn check_command(
    command: &str,
    blocked_patterns: &[String],
    paths: &PathPolicy,
) -> std::result::Result<(), String> {
    let lower = command.to_lowercase();
    for pat in blocked_patterns {
        if lower.contains(&pat.to_lowercase()) {
            return Err(format!("blocked pattern: {pat}"));
        }
    }

    let args = shell_args(command);

    // First token after env assignments; `rm` gets its targets validated.
    let first = args
        .iter()
        .position(|w| !w.contains('=') || w.starts_with('='))
        .map(|i| (i, args[i].as_str()));

    if let Some((idx, name)) = first {
        if name == "rm" || name == "/bin/rm" {
            for arg in args.iter().skip(idx + 1) {
                if arg.starts_with('-') {
                    continue;
                }
                if !paths.is_path_allowed(arg) {
                    return Err(format!("rm target outside allowed paths: {arg}"));
                }
            }
        }
    }

    Ok(())
}

/// Minimal shell argument splitter: quoting and backslash escapes, no
/// expansion. A backslash is literal inside single quotes, an escape
/// everywhere else.
fn shell_args(command: &str) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote = Quote::None;
    let mut escaped = false;

    for ch in command.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        match (ch, quote) {
            ('\\', Quote::Single) => current.push('\\'),
            ('\\', _) => escaped = true,
            ('\'', Quote::None) => quote = Quote::Single,
            ('\'', Quote::Single) => quote = Quote::None,
            ('"', Quote::None) => quote = Quote::Double,
            ('"', Quote::Double) => quote = Quote::None,
            (c, Quote::None) if c.is_whitespace() => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            (c, _) => current.push(c),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        PathBuf::from(format!("/tmp/{prefix}-{}-{ts}", std::process::id()))
    }

    fn policy(allowed: Vec<PathBuf>) -> PathPolicy {
        PathPolicy {
            allowed_paths: allowed,
            temp_paths: vec![],
            home_dir: None,
            base_dir: None,
        }
    }

    #[test]
    fn test_allowlist() {
        assert!(is_authorized(Some(UserId(42)), &[42, 7]));
        assert!(!is_authorized(Some(UserId(99)), &[42, 7]));
        assert!(!is_authorized(None, &[42]));
        assert!(!is_authorized(Some(UserId(42)), &[]));
    }

    #[test]
    fn test_rate_limiter_refill() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(true, 2, Duration::from_secs(10));
        let u = UserId(1);

        assert!(rl.check_at(u, start).0);
        assert!(rl.check_at(u, start).0);
        let (ok, retry) = rl.check_at(u, start);
        assert!(!ok);
        assert!(retry.unwrap() > Duration::from_secs(0));

        // 2 tokens / 10s: one token back after 5 seconds.
        assert!(rl.check_at(u, start + Duration::from_secs(5)).0);
    }

    #[test]
    fn test_rate_limiter_disabled_always_allows() {
        let mut rl = RateLimiter::new(false, 1, Duration::from_secs(60));
        for _ in 0..10 {
            assert!(rl.check(UserId(1)).0);
        }
    }

    #[test]
    fn test_no_string_prefix_false_positive() {
        let base = tmp("foo");
        let sibling = PathBuf::from(format!("{}-bar", base.display()));
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&sibling).unwrap();

        let p = policy(vec![base]);
        assert!(!p.is_path_allowed(&format!("{}/x", sibling.display())));
    }

    #[test]
    fn test_temp_prefix_always_allowed() {
        let p = PathPolicy {
            allowed_paths: vec![],
            temp_paths: vec![PathBuf::from("/tmp/")],
            home_dir: None,
            base_dir: None,
        };
        assert!(p.is_path_allowed("/tmp/some-file.txt"));
        assert!(!p.is_path_allowed("/etc/passwd"));
    }

    #[test]
    fn test_traversal_resolves_outside() {
        let base = tmp("allowed");
        let outside = tmp("outside");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&outside).unwrap();

        let p = policy(vec![base.clone()]);
        let raw = format!(
            "{}/../{}",
            base.display(),
            outside.file_name().unwrap().to_string_lossy()
        );
        assert!(!p.is_path_allowed(&raw));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_blocked() {
        let base = tmp("allowed");
        let outside = tmp("outside");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(outside.join("secret")).unwrap();
        std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();

        let p = policy(vec![base.clone()]);
        assert!(!p.is_path_allowed(base.join("link/secret").to_str().unwrap()));
    }

    #[test]
    fn test_nonexistent_leaf_resolves_through_existing_prefix() {
        let base = tmp("allowed");
        fs::create_dir_all(&base).unwrap();

        let p = policy(vec![base.clone()]);
        assert!(p.is_path_allowed(&format!("{}/new-dir/new-file.txt", base.display())));
    }

    #[test]
    fn test_tilde_expansion_in_allowed_paths() {
        let home = tmp("home");
        fs::create_dir_all(home.join("allowed")).unwrap();

        let p = PathPolicy {
            allowed_paths: vec![PathBuf::from("~/allowed")],
            temp_paths: vec![],
            home_dir: Some(home),
            base_dir: None,
        };
        assert!(p.is_path_allowed("~/allowed/file.txt"));
    }

    #[test]
    fn test_blocked_pattern_match() {
        let p = policy(vec![]);
        let blocked = vec!["rm -rf /".to_string()];
        let err = check_command("bash -c 'rm -rf /tmp/../..'", &blocked, &p);
        assert!(err.is_err());
        assert!(err.unwrap_err().contains("rm -rf /"));
    }

    #[test]
    fn test_rm_outside_allowed_denied() {
        let base = tmp("allowed");
        fs::create_dir_all(&base).unwrap();

        let p = policy(vec![base]);
        let err = check_command("rm /etc/passwd", &[], &p).unwrap_err();
        assert!(err.contains("/etc/passwd"));
    }

    #[test]
    fn test_rm_inside_allowed_with_quotes() {
        let base = tmp("allowed");
        fs::create_dir_all(&base).unwrap();

        let p = policy(vec![base.clone()]);
        let cmd = format!("rm -f \"{}/file with space.txt\"", base.display());
        assert!(check_command(&cmd, &[], &p).is_ok());
    }

    #[test]
    fn test_rm_after_env_assignment() {
        let p = policy(vec![]);
        let err = check_command("FOO=1 rm /etc/hosts", &[], &p).unwrap_err();
        assert!(err.contains("/etc/hosts"));
    }

    #[test]
    fn test_harmless_command_allowed() {
        let p = policy(vec![]);
        assert!(check_command("ls -la && git status", &[], &p).is_ok());
    }

    #[test]
    fn test_shell_args_quoting() {
        assert_eq!(shell_args("a b  c"), ["a", "b", "c"]);
        assert_eq!(shell_args("rm 'a b' \"c d\""), ["rm", "a b", "c d"]);
        assert_eq!(shell_args(r"one\ word"), ["one word"]);
        // Backslash is literal inside single quotes.
        assert_eq!(shell_args(r"'a\b'"), [r"a\b"]);
        assert_eq!(shell_args("  "), Vec::<String>::new());
    }
}
