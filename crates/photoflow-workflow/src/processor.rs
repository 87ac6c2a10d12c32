//! External image-processing capability boundary

use async_trait::async_trait;

use crate::error::Result;
use crate::step::{ArtifactRef, ProcessingMode};

/// Remote AI image-processing capability.
///
/// Treated as opaque, potentially slow, and fallible; the executor wraps
/// every call in a bounded timeout.
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    async fn process(&self, input: &ArtifactRef, mode: &ProcessingMode) -> Result<ArtifactRef>;
}

/// Scripted processor for tests
pub mod testing {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::WorkflowError;

    /// Processor that derives outputs from inputs and fails on script
    pub struct ScriptedProcessor {
        calls: AtomicUsize,
        fail_next: Mutex<usize>,
        fail_on: Mutex<HashSet<usize>>,
        delay: Mutex<Option<Duration>>,
    }

    impl ScriptedProcessor {
        pub fn new() -> Self {
            ScriptedProcessor {
                calls: AtomicUsize::new(0),
                fail_next: Mutex::new(0),
                fail_on: Mutex::new(HashSet::new()),
                delay: Mutex::new(None),
            }
        }

        /// Fail the next `n` process calls
        pub fn fail_next(&self, n: usize) {
            *self.fail_next.lock() = n;
        }

        /// Fail the `n`th call overall (1-based), regardless of what
        /// happens in between
        pub fn fail_on_call(&self, n: usize) {
            self.fail_on.lock().insert(n);
        }

        /// Sleep before answering, to exercise the executor timeout
        pub fn delay(&self, delay: Duration) {
            *self.delay.lock() = Some(delay);
        }

        /// How many times `process` was invoked
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Default for ScriptedProcessor {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ImageProcessor for ScriptedProcessor {
        async fn process(&self, input: &ArtifactRef, mode: &ProcessingMode) -> Result<ArtifactRef> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_on.lock().remove(&call) {
                return Err(WorkflowError::Processing("model unavailable".into()));
            }
            {
                let mut fail = self.fail_next.lock();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(WorkflowError::Processing("model unavailable".into()));
                }
            }
            Ok(format!("{input}|{}", mode.name()))
        }
    }
}
