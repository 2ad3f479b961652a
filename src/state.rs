use crate::config::PolicyConfig;
use std::time::Duration;

/// Shared by every admission request; never mutated after startup.
pub struct AppState<N> {
    pub(crate) policy: PolicyConfig,
    pub(crate) notifier: N,
    pub(crate) notify_timeout: Duration,
}

impl<N> AppState<N> {
    pub fn new(policy: PolicyConfig, notifier: N, notify_timeout: Duration) -> Self {
        Self {
            policy,
            notifier,
            notify_timeout,
        }
    }
}
