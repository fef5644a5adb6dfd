//! Gitignore-style path filtering.
//!
//! Supported subset: blank lines and `#` comments, `!` negation, trailing
//! `/` for directory-only patterns, `?`, `*` (single segment), `**` (across
//! segments), and character classes. Patterns containing `/` anchor at the
//! matcher root; a bare name matches at any depth. The LAST matching rule
//! wins, so negations can re-include.
//!
//! Rule sets compile once; [`IgnoreRules::cached`] memoizes compiled sets by
//! the SHA-256 of the rule text so a poll cycle never recompiles an
//! unchanged `.hqignore`.

use globset::{GlobBuilder, GlobMatcher};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{Result, SyncError};

/// Built-in rules applied before any user rules.
pub const DEFAULT_RULES: &[&str] = &[
    ".env",
    ".env.*",
    "*.secret",
    "credentials/",
    "node_modules/",
    ".git/",
    "dist/",
    ".DS_Store",
    "Thumbs.db",
    ".hq-sync.pid",
    ".hq-sync.log",
];

struct Rule {
    negated: bool,
    dir_only: bool,
    /// Matchers for the path itself.
    self_matchers: Vec<GlobMatcher>,
    /// Matchers for anything beneath a matched directory.
    content_matchers: Vec<GlobMatcher>,
}

/// A compiled, ordered rule set.
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    /// Compile a rule set from ignore-file text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for raw_line in text.lines() {
            let line = raw_line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negated, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let (dir_only, pattern) = match pattern.strip_suffix('/') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            if pattern.is_empty() {
                continue;
            }
            // A leading slash anchors; so does any interior slash.
            let anchored = pattern.starts_with('/') || pattern.contains('/');
            let pattern = pattern.strip_prefix('/').unwrap_or(pattern);

            let mut bases = vec![pattern.to_string()];
            if !anchored {
                bases.push(format!("**/{pattern}"));
            }
            let mut self_matchers = Vec::with_capacity(bases.len());
            let mut content_matchers = Vec::with_capacity(bases.len());
            for base in &bases {
                self_matchers.push(compile(base)?);
                content_matchers.push(compile(&format!("{base}/**"))?);
            }
            rules.push(Rule {
                negated,
                dir_only,
                self_matchers,
                content_matchers,
            });
        }
        Ok(Self { rules })
    }

    /// Compile with memoization keyed by the rule-text hash.
    pub fn cached(text: &str) -> Result<Arc<Self>> {
        static CACHE: Mutex<Option<HashMap<[u8; 32], Arc<IgnoreRules>>>> = Mutex::new(None);

        let digest: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        let mut guard = CACHE.lock();
        let cache = guard.get_or_insert_with(HashMap::new);
        if let Some(compiled) = cache.get(&digest) {
            return Ok(Arc::clone(compiled));
        }
        let compiled = Arc::new(Self::parse(text)?);
        let _ = cache.insert(digest, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Whether `path` is ignored. `is_dir` gates directory-only patterns.
    ///
    /// Backslashes are normalized to `/` before matching; leading `./` and
    /// `/` are stripped.
    pub fn is_ignored(&self, path: &str, is_dir: bool) -> bool {
        let normalized = path.replace('\\', "/");
        let normalized = normalized
            .strip_prefix("./")
            .unwrap_or(&normalized)
            .trim_start_matches('/');

        let mut decision = false;
        for rule in &self.rules {
            let self_hit = rule.self_matchers.iter().any(|m| m.is_match(normalized));
            let content_hit = rule
                .content_matchers
                .iter()
                .any(|m| m.is_match(normalized));
            let hit = if rule.dir_only {
                content_hit || (self_hit && is_dir)
            } else {
                self_hit || content_hit
            };
            if hit {
                decision = !rule.negated;
            }
        }
        decision
    }

    /// Number of compiled rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the rule set is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| SyncError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rules(text: &str) -> IgnoreRules {
        IgnoreRules::parse(text).unwrap()
    }

    #[test]
    fn blank_lines_and_comments_are_skipped() {
        let r = rules("\n# comment\n\n*.log\n");
        assert_eq!(r.len(), 1);
        assert!(r.is_ignored("debug.log", false));
    }

    #[test]
    fn bare_names_match_at_any_depth() {
        let r = rules("*.log");
        assert!(r.is_ignored("a.log", false));
        assert!(r.is_ignored("deep/nested/b.log", false));
        assert!(!r.is_ignored("a.txt", false));
    }

    #[test]
    fn negation_reincludes_last_match_wins() {
        let r = rules("*.log\n!keep.log");
        assert!(r.is_ignored("debug.log", false));
        assert!(!r.is_ignored("keep.log", false));
        assert!(!r.is_ignored("sub/keep.log", false));
        // Order matters: re-ignoring after the negation wins again.
        let r = rules("!keep.log\n*.log");
        assert!(r.is_ignored("keep.log", false));
    }

    #[test]
    fn trailing_slash_is_directory_only() {
        let r = rules("build/");
        assert!(r.is_ignored("build", true));
        assert!(!r.is_ignored("build", false), "plain file named build");
        assert!(r.is_ignored("build/out.txt", false));
        assert!(r.is_ignored("sub/build/out.txt", false));
    }

    #[test]
    fn directory_match_covers_contents() {
        let r = rules("node_modules");
        assert!(r.is_ignored("node_modules", false));
        assert!(r.is_ignored("node_modules/pkg/index.js", false));
        assert!(r.is_ignored("app/node_modules/pkg/index.js", false));
    }

    #[test]
    fn leading_slash_anchors_at_root() {
        let r = rules("/top.txt");
        assert!(r.is_ignored("top.txt", false));
        assert!(!r.is_ignored("sub/top.txt", false));
    }

    #[test]
    fn interior_slash_anchors_at_root() {
        let r = rules("docs/*.md");
        assert!(r.is_ignored("docs/readme.md", false));
        assert!(!r.is_ignored("other/docs/readme.md", false));
        assert!(!r.is_ignored("docs/sub/readme.md", false), "* stays in one segment");
    }

    #[test]
    fn double_star_crosses_segments() {
        let r = rules("docs/**/*.pdf");
        assert!(r.is_ignored("docs/a.pdf", false));
        assert!(r.is_ignored("docs/x/y/b.pdf", false));
        assert!(!r.is_ignored("a.pdf", false));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let r = rules("file?.txt");
        assert!(r.is_ignored("file1.txt", false));
        assert!(!r.is_ignored("file10.txt", false));
        assert!(!r.is_ignored("file.txt", false));
    }

    #[test]
    fn character_classes() {
        let r = rules("[ab].txt");
        assert!(r.is_ignored("a.txt", false));
        assert!(r.is_ignored("b.txt", false));
        assert!(!r.is_ignored("c.txt", false));
    }

    #[test]
    fn backslashes_are_normalized() {
        let r = rules("sub/name.txt");
        assert!(r.is_ignored("sub\\name.txt", false));
    }

    #[test]
    fn default_rules_cover_secrets_and_noise() {
        let text = DEFAULT_RULES.join("\n");
        let r = rules(&text);
        assert!(r.is_ignored(".env", false));
        assert!(r.is_ignored("api/.env.production", false));
        assert!(r.is_ignored("deploy/key.secret", false));
        assert!(r.is_ignored("credentials/aws.json", false));
        assert!(r.is_ignored("node_modules/left-pad/index.js", false));
        assert!(r.is_ignored(".git/HEAD", false));
        assert!(r.is_ignored("dist/bundle.js", false));
        assert!(r.is_ignored(".DS_Store", false));
        assert!(r.is_ignored("photos/Thumbs.db", false));
        assert!(r.is_ignored(".hq-sync.pid", false));
        assert!(r.is_ignored(".hq-sync.log", false));
        assert!(!r.is_ignored("src/main.rs", false));
        assert!(!r.is_ignored("environment.md", false));
    }

    #[test]
    fn cached_returns_shared_compilation() {
        let a = IgnoreRules::cached("*.log\n!keep.log").unwrap();
        let b = IgnoreRules::cached("*.log\n!keep.log").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = IgnoreRules::cached("*.log").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    proptest! {
        // Determinism: the same rule set gives the same verdict on repeated
        // calls and across fresh compilations.
        #[test]
        fn is_ignored_is_deterministic(path in "[a-z]{1,8}(/[a-z]{1,8}){0,3}(\\.[a-z]{1,3})?") {
            let text = "*.log\nbuild/\n!keep.log\ndocs/*.md";
            let first = rules(text);
            let second = rules(text);
            let a = first.is_ignored(&path, false);
            prop_assert_eq!(a, first.is_ignored(&path, false));
            prop_assert_eq!(a, second.is_ignored(&path, false));
        }
    }
}
