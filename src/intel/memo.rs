//! Fetch-once guards for entity enrichment.

/// Progress of a single memoized fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchState {
    #[default]
    NotStarted,
    InFlight,
    Succeeded,
    Failed,
}

/// Guard for one lazily fetched piece of entity data.
///
/// Access is serialized by the entity lock (every transition takes
/// `&mut self`), so at most one fetch per guard is ever in flight.
/// An `InFlight` guard seen by `begin` belongs to a fetch whose future was
/// dropped before completing; it is restarted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Memo {
    state: FetchState,
    retry_failed: bool,
}

impl Memo {
    /// A guard that runs at most once, even if the fetch failed.
    pub fn once() -> Self {
        Self {
            state: FetchState::NotStarted,
            retry_failed: false,
        }
    }

    /// A guard that permits another attempt after a failure.
    pub fn retrying() -> Self {
        Self {
            state: FetchState::NotStarted,
            retry_failed: true,
        }
    }

    /// Claim the fetch. Returns false if the caller must not fetch.
    pub fn begin(&mut self) -> bool {
        let claim = match self.state {
            FetchState::NotStarted | FetchState::InFlight => true,
            FetchState::Failed => self.retry_failed,
            FetchState::Succeeded => false,
        };
        if claim {
            self.state = FetchState::InFlight;
        }
        claim
    }

    /// Record the outcome of a claimed fetch.
    pub fn finish(&mut self, ok: bool) {
        self.state = if ok {
            FetchState::Succeeded
        } else {
            FetchState::Failed
        };
    }

    /// Forget any previous outcome.
    pub fn reset(&mut self) {
        self.state = FetchState::NotStarted;
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn succeeded(&self) -> bool {
        self.state == FetchState::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_never_retries() {
        let mut memo = Memo::once();
        assert!(memo.begin());
        memo.finish(false);
        assert_eq!(memo.state(), FetchState::Failed);
        assert!(!memo.begin());
    }

    #[test]
    fn test_retrying_after_failure() {
        let mut memo = Memo::retrying();
        assert!(memo.begin());
        memo.finish(false);
        assert!(memo.begin());
        assert_eq!(memo.state(), FetchState::InFlight);
        memo.finish(true);
        assert!(memo.succeeded());
        assert!(!memo.begin());
    }

    #[test]
    fn test_reset_allows_new_fetch() {
        let mut memo = Memo::retrying();
        assert!(memo.begin());
        memo.finish(true);
        memo.reset();
        assert_eq!(memo.state(), FetchState::NotStarted);
        assert!(memo.begin());
    }

    #[test]
    fn test_abandoned_fetch_is_restarted() {
        let mut memo = Memo::once();
        assert!(memo.begin());
        // fetch future dropped here without finish()
        assert!(memo.begin());
    }
}
