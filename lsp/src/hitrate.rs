//! Fixed-window rate limiting for outbound traffic.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Methods that are never rate limited.
///
/// Dropping any of these desynchronizes the server's view of open documents
/// or breaks completion item resolution.
pub const WHITELIST: &[&str] = &[
    "textDocument/didOpen",
    "textDocument/didSave",
    "textDocument/didClose",
    "completionItem/resolve",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitCategory {
    /// Requests and notifications.
    Request,
    /// Pre-serialized raw payloads.
    Raw,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    expires: Instant,
}

#[derive(Debug)]
pub struct HitrateLimiter {
    ceiling: u32,
    windows: HashMap<HitCategory, Window>,
}

impl HitrateLimiter {
    #[must_use]
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling: ceiling.max(1),
            windows: HashMap::new(),
        }
    }

    #[must_use]
    pub fn is_whitelisted(method: &str) -> bool {
        WHITELIST.contains(&method)
    }

    /// Record a hit for `method`; returns `false` when it must be dropped.
    pub fn allow(&mut self, category: HitCategory, method: &str, now: Instant) -> bool {
        if Self::is_whitelisted(method) {
            return true;
        }

        let window = self.windows.entry(category).or_insert(Window {
            count: 0,
            expires: now,
        });
        if now >= window.expires {
            *window = Window {
                count: 1,
                expires: now + WINDOW,
            };
            return true;
        }
        if window.count >= self.ceiling {
            return false;
        }
        window.count += 1;
        true
    }
}
