use std::{future::Future, time::Duration};

use log::warn;
use tokio::time::sleep;

use crate::error::LookupError;

/// Bounded exponential backoff for transient lookup failures.
///
/// There is no overall timeout here: the caller's deadline cancels the whole
/// future, sleeps included.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, LookupError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LookupError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "{what}: attempt {attempt}/{} failed, retrying in {:?}: {err}",
                        self.max_attempts, backoff
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
