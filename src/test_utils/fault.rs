//! Module that contains utility functions for fault injection in test code
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum When {
    Always,
    Never,
    /// Succeeds for the first `n` calls and fails for every call after that
    AfterCalls(usize),
}

/// A fault is an error that is returned based on the [`When`]
#[derive(Clone, Debug)]
pub struct Fault {
    pub when: When,
}

impl Default for Fault {
    fn default() -> Self {
        Self { when: When::Never }
    }
}

impl Fault {
    pub fn new(when: When) -> Self {
        Self { when }
    }

    /// `previous_calls` is the number of calls that happened before the current one
    pub fn should_fail(&self, previous_calls: usize) -> bool {
        match self.when {
            When::Always => true,
            When::Never => false,
            When::AfterCalls(n) => previous_calls >= n,
        }
    }
}

/// Makes an operation hang for `duration` before running, based on the [`When`]
#[derive(Clone, Debug)]
pub struct Delay {
    pub when: When,
    pub duration: Duration,
}

impl Delay {
    pub fn new(when: When, duration: Duration) -> Self {
        Self { when, duration }
    }

    /// The time to wait for, if any. `previous_calls` follows [`Fault::should_fail`].
    pub fn duration(&self, previous_calls: usize) -> Option<Duration> {
        Fault::new(self.when.clone())
            .should_fail(previous_calls)
            .then_some(self.duration)
    }
}
