//! Outbound send adapter seam.
//!
//! The host-automation side of sending (platform scripting or a native
//! helper) lives outside this crate; implementations are selected at
//! construction behind [`SendAdapter`]. What IS specified here:
//!
//! - the process-wide rate limit (60 sends per rolling 60 s),
//! - rejection of text carrying host-automation injection sigils,
//! - burst delivery with natural spacing and abort-on-first-failure.
//!
//! [`RateLimitedAdapter`] wraps any inner adapter and enforces all three, so
//! every caller (ingest, scheduler, executor) gets the same policy.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const RATE_LIMIT_MAX_SENDS: usize = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Floor between consecutive burst bubbles.
const BURST_BASE_DELAY: Duration = Duration::from_millis(800);
/// Extra read-time per character of the prior bubble.
const BURST_PER_CHAR: Duration = Duration::from_millis(15);
/// Cap on the total inter-bubble delay.
const BURST_MAX_DELAY: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The adapter refused or the host automation failed.
    #[error("send failed: {0}")]
    Refused(String),
    /// Over the 60-sends-per-60-seconds process limit.
    #[error("rate limited: over {RATE_LIMIT_MAX_SENDS} sends per 60s")]
    RateLimited,
    /// Text carries automation-injection sigils the adapter cannot escape.
    #[error("unsafe text: automation-injection sigil present")]
    UnsafeText,
    /// A bubble mid-burst failed; `sent` bubbles were already delivered.
    #[error("burst aborted after {sent} bubble(s): {reason}")]
    BurstAborted { sent: usize, reason: String },
}

// ---------------------------------------------------------------------------
// SendAdapter trait
// ---------------------------------------------------------------------------

/// Capability set consumed by the ingest coordinator, scheduler, and
/// executor. Implementations must accept arbitrary UTF-8 (quotes,
/// backslashes, newlines, emoji) and do their own host-format escaping.
#[async_trait]
pub trait SendAdapter: Send + Sync {
    async fn send_single(
        &self,
        thread_id: &str,
        text: &str,
        is_group: bool,
    ) -> Result<(), SendError>;

    /// Deliver an ordered burst to one thread. `batched` asks the host to
    /// deliver the bubbles in one automation call where supported.
    async fn send_burst(
        &self,
        thread_id: &str,
        bubbles: &[String],
        is_group: bool,
        batched: bool,
    ) -> Result<(), SendError>;
}

// ---------------------------------------------------------------------------
// Injection sigils
// ---------------------------------------------------------------------------

const SIGIL_PHRASES: &[&str] = &[
    "do shell script",
    "tell application",
    "activate application",
    "system events",
];

/// True when `text` contains a host-automation keyword, case-insensitive.
/// `run` and `execute` only count as standalone words.
pub fn contains_automation_sigils(text: &str) -> bool {
    let lower = text.to_lowercase();
    if SIGIL_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == "run" || token == "execute")
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window counter over send instants. One per process; hold times
/// are O(1) pops off the window front.
pub struct RateLimiter {
    window: VecDeque<Instant>,
    max_sends: usize,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            window: VecDeque::with_capacity(RATE_LIMIT_MAX_SENDS),
            max_sends: RATE_LIMIT_MAX_SENDS,
        }
    }

    #[cfg(test)]
    pub fn with_max(max_sends: usize) -> Self {
        RateLimiter {
            window: VecDeque::with_capacity(max_sends),
            max_sends,
        }
    }

    /// Record one send if the window has room. False means rate limited.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(front) = self.window.front() {
            if now.duration_since(*front) >= RATE_LIMIT_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
        if self.window.len() >= self.max_sends {
            return false;
        }
        self.window.push_back(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Natural spacing
// ---------------------------------------------------------------------------

/// Delay before the bubble following `prev_bubble`: the 800 ms floor plus
/// read-time proportional to the prior bubble's length, capped at 3 s.
pub fn natural_spacing(prev_bubble: &str) -> Duration {
    let read_time = BURST_PER_CHAR * u32::try_from(prev_bubble.chars().count()).unwrap_or(u32::MAX);
    (BURST_BASE_DELAY + read_time).min(BURST_MAX_DELAY)
}

// ---------------------------------------------------------------------------
// RateLimitedAdapter
// ---------------------------------------------------------------------------

/// Policy wrapper every component sends through: sigil rejection, the
/// process-wide rate limit, and spaced burst delivery with abort-on-failure.
pub struct RateLimitedAdapter {
    inner: Arc<dyn SendAdapter>,
    limiter: Mutex<RateLimiter>,
}

impl RateLimitedAdapter {
    pub fn new(inner: Arc<dyn SendAdapter>) -> Self {
        RateLimitedAdapter {
            inner,
            limiter: Mutex::new(RateLimiter::new()),
        }
    }

    fn acquire(&self) -> Result<(), SendError> {
        let mut limiter = self.limiter.lock().expect("rate limiter mutex");
        if limiter.try_acquire(Instant::now()) {
            Ok(())
        } else {
            Err(SendError::RateLimited)
        }
    }

    fn check_text(text: &str) -> Result<(), SendError> {
        if contains_automation_sigils(text) {
            Err(SendError::UnsafeText)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SendAdapter for RateLimitedAdapter {
    async fn send_single(
        &self,
        thread_id: &str,
        text: &str,
        is_group: bool,
    ) -> Result<(), SendError> {
        Self::check_text(text)?;
        self.acquire()?;
        self.inner.send_single(thread_id, text, is_group).await
    }

    /// First bubble goes immediately; each subsequent bubble waits the
    /// natural spacing for the prior one. A failed bubble aborts the
    /// remainder and surfaces as [`SendError::BurstAborted`].
    async fn send_burst(
        &self,
        thread_id: &str,
        bubbles: &[String],
        is_group: bool,
        batched: bool,
    ) -> Result<(), SendError> {
        for bubble in bubbles {
            Self::check_text(bubble)?;
        }
        if batched {
            for _ in bubbles {
                self.acquire()?;
            }
            return self.inner.send_burst(thread_id, bubbles, is_group, true).await;
        }

        for (i, bubble) in bubbles.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(natural_spacing(&bubbles[i - 1])).await;
            }
            self.acquire().map_err(|e| abort_mid_burst(i, &e))?;
            self.inner
                .send_single(thread_id, bubble, is_group)
                .await
                .map_err(|e| abort_mid_burst(i, &e))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LogOnlySendAdapter
// ---------------------------------------------------------------------------

/// Stand-in used until a host automation driver is linked in: every send
/// succeeds and is logged. Selected by `main` when no driver is configured;
/// real deployments construct the relay with their platform adapter.
pub struct LogOnlySendAdapter;

#[async_trait]
impl SendAdapter for LogOnlySendAdapter {
    async fn send_single(
        &self,
        thread_id: &str,
        text: &str,
        is_group: bool,
    ) -> Result<(), SendError> {
        tracing::info!(thread_id, is_group, chars = text.chars().count(), "send (log-only)");
        Ok(())
    }

    async fn send_burst(
        &self,
        thread_id: &str,
        bubbles: &[String],
        is_group: bool,
        _batched: bool,
    ) -> Result<(), SendError> {
        for bubble in bubbles {
            self.send_single(thread_id, bubble, is_group).await?;
        }
        Ok(())
    }
}

fn abort_mid_burst(sent: usize, cause: &SendError) -> SendError {
    if sent == 0 {
        // Nothing delivered yet; the original error is the whole story.
        match cause {
            SendError::RateLimited => SendError::RateLimited,
            other => SendError::Refused(other.to_string()),
        }
    } else {
        SendError::BurstAborted {
            sent,
            reason: cause.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every send; fails when `fail_after` sends have happened.
    struct FakeAdapter {
        sent: Mutex<Vec<(String, String)>>,
        fail_after: Option<usize>,
        count: AtomicUsize,
    }

    impl FakeAdapter {
        fn new() -> Arc<Self> {
            Arc::new(FakeAdapter {
                sent: Mutex::new(Vec::new()),
                fail_after: None,
                count: AtomicUsize::new(0),
            })
        }

        fn failing_after(n: usize) -> Arc<Self> {
            Arc::new(FakeAdapter {
                sent: Mutex::new(Vec::new()),
                fail_after: Some(n),
                count: AtomicUsize::new(0),
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SendAdapter for FakeAdapter {
        async fn send_single(
            &self,
            thread_id: &str,
            text: &str,
            _is_group: bool,
        ) -> Result<(), SendError> {
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after
                && n >= limit
            {
                return Err(SendError::Refused("host automation error".to_owned()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((thread_id.to_owned(), text.to_owned()));
            Ok(())
        }

        async fn send_burst(
            &self,
            thread_id: &str,
            bubbles: &[String],
            is_group: bool,
            _batched: bool,
        ) -> Result<(), SendError> {
            for b in bubbles {
                self.send_single(thread_id, b, is_group).await?;
            }
            Ok(())
        }
    }

    #[test]
    fn sigils_are_detected_case_insensitively() {
        assert!(contains_automation_sigils("please DO SHELL SCRIPT now"));
        assert!(contains_automation_sigils("Tell Application \"Finder\""));
        assert!(contains_automation_sigils("system events click"));
        assert!(contains_automation_sigils("run"));
        assert!(contains_automation_sigils("just Execute it"));
        assert!(!contains_automation_sigils("let's go running tomorrow"));
        assert!(!contains_automation_sigils("the executive summary"));
        assert!(!contains_automation_sigils("Hello! \"quotes\" \\ and \u{1f389}"));
    }

    #[test]
    fn rate_limiter_allows_exactly_the_cap_within_a_window() {
        let mut limiter = RateLimiter::with_max(3);
        let start = Instant::now();
        assert!(limiter.try_acquire(start));
        assert!(limiter.try_acquire(start + Duration::from_secs(1)));
        assert!(limiter.try_acquire(start + Duration::from_secs(2)));
        assert!(!limiter.try_acquire(start + Duration::from_secs(3)));
        // The first send ages out of the window after 60 s.
        assert!(limiter.try_acquire(start + Duration::from_secs(61)));
    }

    #[tokio::test]
    async fn sixty_one_sends_produce_one_rate_limited_error() {
        let inner = FakeAdapter::new();
        let adapter = RateLimitedAdapter::new(inner.clone());
        let mut failures = Vec::new();
        for i in 0..61 {
            if let Err(e) = adapter.send_single("T1", &format!("msg {i}"), false).await {
                failures.push(e);
            }
        }
        assert_eq!(inner.sent().len(), 60);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], SendError::RateLimited));
    }

    #[tokio::test]
    async fn unsafe_text_is_rejected_before_reaching_the_inner_adapter() {
        let inner = FakeAdapter::new();
        let adapter = RateLimitedAdapter::new(inner.clone());
        let err = adapter
            .send_single("T1", "do shell script \"rm -rf\"", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::UnsafeText));
        assert!(inner.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_spaces_bubbles_and_preserves_order() {
        let inner = FakeAdapter::new();
        let adapter = RateLimitedAdapter::new(inner.clone());
        let bubbles = vec!["one".to_owned(), "two".to_owned(), "three".to_owned()];

        let started = Instant::now();
        adapter.send_burst("T1", &bubbles, false, false).await.unwrap();
        let elapsed = started.elapsed();

        let sent: Vec<String> = inner.sent().into_iter().map(|(_, t)| t).collect();
        assert_eq!(sent, vec!["one", "two", "three"]);
        // Two gaps, each at least the 800 ms floor.
        assert!(elapsed >= Duration::from_millis(1600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn burst_aborts_remainder_on_mid_burst_failure() {
        let inner = FakeAdapter::failing_after(1);
        let adapter = RateLimitedAdapter::new(inner.clone());
        let bubbles = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];

        let err = adapter
            .send_burst("T1", &bubbles, false, false)
            .await
            .unwrap_err();
        let SendError::BurstAborted { sent, .. } = err else {
            panic!("expected BurstAborted, got {err:?}");
        };
        assert_eq!(sent, 1);
        assert_eq!(inner.sent().len(), 1);
    }

    #[test]
    fn natural_spacing_has_floor_and_cap() {
        assert_eq!(natural_spacing(""), Duration::from_millis(800));
        assert_eq!(natural_spacing("hello"), Duration::from_millis(875));
        let long = "x".repeat(10_000);
        assert_eq!(natural_spacing(&long), Duration::from_secs(3));
    }
}
