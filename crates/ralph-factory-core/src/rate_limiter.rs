//! Per `provider:model` token-bucket rate limiter with exponential backoff
//! (§4.B).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);

/// The full, fixed phrase list. Implementations must not drop a phrase.
const RATE_LIMIT_PHRASES: [&str; 5] = [
    "rate_limit",
    "rate limit exceeded",
    "429",
    "quota exceeded",
    "too many requests",
];

/// Scans combined stdout+stderr for any rate-limit signal, case-insensitive.
pub fn is_rate_limited(output: &str) -> bool {
    let lower = output.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

#[derive(Debug, Clone)]
struct SlotState {
    capacity: u32,
    held: u32,
    streak: u32,
    backoff_until: Option<Instant>,
}

/// Keyed by `provider:model`. All state is mutated only through this type's
/// methods, which lock an internal mutex so the limiter is safe to share
/// across worker-completion handling even if the orchestrator ever
/// dispatches from more than one thread.
pub struct RateLimiter {
    base_backoff: Duration,
    max_backoff: Duration,
    slots: Mutex<HashMap<String, SlotState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            slots: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_backoff(base: Duration, max: Duration) -> Self {
        Self {
            base_backoff: base,
            max_backoff: max,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a configured key with its concurrency cap. Keys with
    /// capacity 0 are configured but never acquirable.
    pub fn configure(&self, provider: &str, model: &str, capacity: u32) {
        let key = format!("{provider}:{model}");
        self.slots.lock().unwrap().insert(
            key,
            SlotState {
                capacity,
                held: 0,
                streak: 0,
                backoff_until: None,
            },
        );
    }

    pub fn try_acquire(&self, provider: &str, model: &str) -> bool {
        let key = format!("{provider}:{model}");
        let mut slots = self.slots.lock().unwrap();
        let Some(state) = slots.get_mut(&key) else {
            return false;
        };
        let now = Instant::now();
        if state.held < state.capacity && state.backoff_until.is_none_or(|until| now >= until) {
            state.held += 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self, provider: &str, model: &str) {
        let key = format!("{provider}:{model}");
        if let Some(state) = self.slots.lock().unwrap().get_mut(&key) {
            state.held = state.held.saturating_sub(1);
        }
    }

    pub fn report_rate_limit(&self, provider: &str, model: &str) {
        let key = format!("{provider}:{model}");
        let mut slots = self.slots.lock().unwrap();
        if let Some(state) = slots.get_mut(&key) {
            state.streak += 1;
            let backoff = self.base_backoff * 2u32.saturating_pow(state.streak - 1);
            let backoff = backoff.min(self.max_backoff);
            state.backoff_until = Some(Instant::now() + backoff);
        }
    }

    pub fn report_success(&self, provider: &str, model: &str) {
        let key = format!("{provider}:{model}");
        if let Some(state) = self.slots.lock().unwrap().get_mut(&key) {
            state.streak = 0;
            state.backoff_until = None;
        }
    }

    /// Keys currently acquirable (`h < N` and past backoff).
    pub fn available_slots(&self) -> Vec<(String, String)> {
        let now = Instant::now();
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.held < s.capacity && s.backoff_until.is_none_or(|u| now >= u))
            .map(|(key, _)| {
                let mut parts = key.splitn(2, ':');
                (
                    parts.next().unwrap_or_default().to_string(),
                    parts.next().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    pub fn is_in_backoff(&self, provider: &str, model: &str) -> bool {
        let key = format!("{provider}:{model}");
        let now = Instant::now();
        self.slots
            .lock()
            .unwrap()
            .get(&key)
            .is_some_and(|s| s.backoff_until.is_some_and(|u| now < u))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detection_covers_full_phrase_list() {
        for phrase in RATE_LIMIT_PHRASES {
            assert!(is_rate_limited(&format!("stderr: {}", phrase.to_uppercase())));
        }
        assert!(!is_rate_limited("all good, task complete"));
    }

    #[test]
    fn try_acquire_respects_capacity() {
        let limiter = RateLimiter::new();
        limiter.configure("claude", "opus", 1);
        assert!(limiter.try_acquire("claude", "opus"));
        assert!(!limiter.try_acquire("claude", "opus"));
        limiter.release("claude", "opus");
        assert!(limiter.try_acquire("claude", "opus"));
    }

    #[test]
    fn unconfigured_key_never_acquires() {
        let limiter = RateLimiter::new();
        assert!(!limiter.try_acquire("claude", "opus"));
    }

    #[test]
    fn report_rate_limit_blocks_until_backoff_elapses() {
        let limiter = RateLimiter::with_backoff(Duration::from_millis(20), Duration::from_secs(5));
        limiter.configure("claude", "opus", 1);
        limiter.report_rate_limit("claude", "opus");
        assert!(!limiter.try_acquire("claude", "opus"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire("claude", "opus"));
    }

    #[test]
    fn report_success_resets_streak() {
        let limiter = RateLimiter::with_backoff(Duration::from_millis(10), Duration::from_secs(5));
        limiter.configure("claude", "opus", 1);
        limiter.report_rate_limit("claude", "opus");
        limiter.report_success("claude", "opus");
        assert!(!limiter.is_in_backoff("claude", "opus"));
    }

    #[test]
    fn backoff_grows_exponentially_with_streak() {
        let limiter =
            RateLimiter::with_backoff(Duration::from_millis(10), Duration::from_secs(600));
        limiter.configure("claude", "opus", 1);
        limiter.report_rate_limit("claude", "opus"); // r=1 -> 10ms
        limiter.report_rate_limit("claude", "opus"); // r=2 -> 20ms
        assert!(limiter.is_in_backoff("claude", "opus"));
    }
}
