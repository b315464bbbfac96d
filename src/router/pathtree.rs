// Address matching (spec §4.2 "Address hash/glob"): exact-path lookups go
// through a flat hash table; paths containing glob metacharacters
// (`*?[]{}`) fall back to a tree walk. Grounded in the teacher's
// `SocketId`-keyed registries (flat maps everywhere) generalized with a
// small glob matcher, since the teacher never needed wildcard dispatch.

use std::collections::HashMap;

/// Minimal OSC-style glob: `*` (any run, incl. empty), `?` (one char),
/// `[abc]`/`[a-z]`/`[!abc]` (character class), `{a,b,c}` (alternation).
/// Default implementation of the `GlobMatcher` seam the router dispatches
/// through, so a host embedding this crate can swap in a fancier matcher
/// (e.g. one backed by a compiled automaton) without touching the router.
pub trait GlobMatcher {
    fn matches(&self, pattern: &str, candidate: &str) -> bool;
}

#[derive(Default)]
pub struct DefaultGlobMatcher;

impl GlobMatcher for DefaultGlobMatcher {
    fn matches(&self, pattern: &str, candidate: &str) -> bool {
        glob_match(pattern.as_bytes(), candidate.as_bytes())
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(b'?'), None) => false,
        (Some(b'['), _) => match_class(pattern, text),
        (Some(b'{'), _) => match_alternation(pattern, text),
        (Some(&p), Some(&c)) if p == c => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

fn find_close(pattern: &[u8], open: u8, close: u8, start: usize) -> Option<usize> {
    pattern[start..].iter().position(|&b| b == close).map(|p| start + p)
}

fn match_class(pattern: &[u8], text: &[u8]) -> bool {
    let close = match find_close(pattern, b'[', b']', 1) {
        Some(c) => c,
        None => return false,
    };
    let (c, rest_text) = match text.split_first() {
        Some(v) => v,
        None => return false,
    };
    let mut body = &pattern[1..close];
    let negate = body.first() == Some(&b'!');
    if negate {
        body = &body[1..];
    }
    let mut matched = false;
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i + 1] == b'-' {
            if *c >= body[i] && *c <= body[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if body[i] == *c {
                matched = true;
            }
            i += 1;
        }
    }
    if matched == negate {
        return false;
    }
    glob_match(&pattern[close + 1..], rest_text)
}

fn match_alternation(pattern: &[u8], text: &[u8]) -> bool {
    let close = match find_close(pattern, b'{', b'}', 1) {
        Some(c) => c,
        None => return false,
    };
    let body = &pattern[1..close];
    let rest = &pattern[close + 1..];
    for alt in body.split(|&b| b == b',') {
        let mut candidate = alt.to_vec();
        candidate.extend_from_slice(rest);
        if glob_match(&candidate, text) {
            return true;
        }
    }
    false
}

/// Dispatch table for a single service's method tree: exact leaf addresses
/// map directly; anything registered with glob metacharacters is matched in
/// registration order against incoming addresses at lookup time.
pub struct Dispatcher<H> {
    exact: HashMap<String, H>,
    globs: Vec<(String, H)>,
}

impl<H: Clone> Dispatcher<H> {
    pub fn new() -> Dispatcher<H> {
        Dispatcher { exact: HashMap::new(), globs: Vec::new() }
    }

    pub fn insert(&mut self, path: impl Into<String>, handler: H) {
        let path = path.into();
        if path.contains(['*', '?', '[', '{']) {
            self.globs.push((path, handler));
        } else {
            self.exact.insert(path, handler);
        }
    }

    pub fn remove(&mut self, path: &str) {
        self.exact.remove(path);
        self.globs.retain(|(p, _)| p != path);
    }

    /// All handlers whose registered path matches `address`; exact matches
    /// always come first, per spec §4.2 "Single-handler fast path". When
    /// `exact_only` is set (the incoming address used the `!` prefix), glob
    /// entries are skipped entirely — spec §4.8: a `!`-addressed message
    /// only reaches a handler registered under that exact path, while a
    /// `/`-addressed one also fires any matching pattern handlers.
    pub fn lookup(&self, address: &str, exact_only: bool, matcher: &dyn GlobMatcher) -> Vec<H> {
        let mut found = Vec::new();
        if let Some(h) = self.exact.get(address) {
            found.push(h.clone());
        }
        if exact_only {
            return found;
        }
        for (pattern, handler) in &self.globs {
            if matcher.matches(pattern, address) {
                found.push(handler.clone());
            }
        }
        found
    }
}

impl<H: Clone> Default for Dispatcher<H> {
    fn default() -> Self {
        Dispatcher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_run_including_empty() {
        let m = DefaultGlobMatcher;
        assert!(m.matches("/s/*", "/s/"));
        assert!(m.matches("/s/*", "/s/leaf"));
        assert!(!m.matches("/s/*", "/other/leaf"));
    }

    #[test]
    fn character_class_and_negation() {
        let m = DefaultGlobMatcher;
        assert!(m.matches("/s/[abc]", "/s/a"));
        assert!(!m.matches("/s/[!abc]", "/s/a"));
        assert!(m.matches("/s/[0-9]", "/s/5"));
    }

    #[test]
    fn alternation_tries_every_branch() {
        let m = DefaultGlobMatcher;
        assert!(m.matches("/s/{foo,bar}", "/s/bar"));
        assert!(!m.matches("/s/{foo,bar}", "/s/baz"));
    }

    #[test]
    fn dispatcher_prefers_exact_then_globs() {
        let mut d: Dispatcher<&'static str> = Dispatcher::new();
        d.insert("/s/leaf", "exact");
        d.insert("/s/*", "glob");
        let matcher = DefaultGlobMatcher;
        let hits = d.lookup("/s/leaf", false, &matcher);
        assert_eq!(hits, vec!["exact", "glob"]);
    }

    #[test]
    fn exact_only_skips_glob_entries() {
        let mut d: Dispatcher<&'static str> = Dispatcher::new();
        d.insert("/s/leaf", "exact");
        d.insert("/s/*", "glob");
        let matcher = DefaultGlobMatcher;
        let hits = d.lookup("/s/leaf", true, &matcher);
        assert_eq!(hits, vec!["exact"]);
    }
}
