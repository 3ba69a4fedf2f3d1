//! Rate-limit detection on task output lines.

use regex::RegexSet;
use std::sync::OnceLock;

const PATTERNS: &[&str] = &[
    r"(?i)rate[ _-]?limit",
    r"(?i)too many requests",
    r"(?i)usage limit reached",
    r"(?i)quota exceeded",
    r"\b429\b",
];

fn patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(PATTERNS).expect("rate-limit patterns are valid"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitDetector;

impl RateLimitDetector {
    pub fn matches(&self, line: &str) -> bool {
        patterns().is_match(line)
    }
}
