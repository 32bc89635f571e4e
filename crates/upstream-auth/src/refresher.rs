use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::token::{AccessToken, AuthError, TokenSource};

/// Refresh this long before the token expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Wait between attempts after a failed refresh. Also the shortest sleep.
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Cheap, cloneable read access to the current token.
#[derive(Clone, Debug)]
pub struct TokenHandle {
    rx: watch::Receiver<AccessToken>,
}

impl TokenHandle {
    /// The current bearer secret, or an error if it has already expired
    /// (which means refreshes have been failing).
    pub fn current(&self) -> Result<String, AuthError> {
        let token = self.rx.borrow();
        if token.is_expired_at(Utc::now()) {
            return Err(AuthError::Expired(token.expires_at));
        }
        Ok(token.secret.clone())
    }
}

/// Keeps one token fresh for one scope.
pub struct TokenRefresher;

impl TokenRefresher {
    /// Fetch the first token (failing fast if that does not work) and spawn
    /// the background refresh task.
    ///
    /// The task exits once every [`TokenHandle`] clone has been dropped.
    pub async fn start(
        source: Arc<dyn TokenSource>,
        scope: impl Into<String>,
    ) -> Result<(TokenHandle, JoinHandle<()>), AuthError> {
        let scope = scope.into();
        let first = source.fetch(&scope).await?;
        info!(
            source = source.name(),
            %scope,
            expires_at = %first.expires_at,
            "access token acquired"
        );

        let (tx, rx) = watch::channel(first);
        let handle = tokio::spawn(run_refresh_loop(source, scope, tx));

        Ok((TokenHandle { rx }, handle))
    }
}

fn delay_until_refresh(token: &AccessToken) -> Duration {
    let refresh_at = token.expires_at
        - chrono::Duration::from_std(REFRESH_MARGIN).unwrap_or(chrono::Duration::zero());
    (refresh_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(RETRY_INTERVAL)
}

async fn run_refresh_loop(
    source: Arc<dyn TokenSource>,
    scope: String,
    tx: watch::Sender<AccessToken>,
) {
    let mut delay = delay_until_refresh(&tx.borrow());

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tx.closed() => {
                debug!(%scope, "no token handles left, refresher exiting");
                return;
            }
        }

        match source.fetch(&scope).await {
            Ok(token) => {
                debug!(%scope, expires_at = %token.expires_at, "access token refreshed");
                delay = delay_until_refresh(&token);
                if tx.send(token).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(
                    source = source.name(),
                    %scope,
                    %err,
                    retry_in_secs = RETRY_INTERVAL.as_secs(),
                    "token refresh failed"
                );
                delay = RETRY_INTERVAL;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Issues `token-N` valid for six minutes; fails on the calls listed in
    /// `fail_on`.
    struct CountingSource {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    impl CountingSource {
        fn new(fail_on: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_on,
            })
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self, _scope: &str) -> Result<AccessToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&n) {
                return Err(AuthError::Cli("boom".into()));
            }
            Ok(AccessToken::new(
                format!("token-{n}"),
                Utc::now() + chrono::Duration::minutes(6),
            ))
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn warm_up_failure_is_reported() {
        let source = CountingSource::new(vec![1]);
        let result = TokenRefresher::start(source, "scope").await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_ahead_of_expiry() {
        let source = CountingSource::new(vec![]);
        let (handle, _task) = TokenRefresher::start(source.clone(), "scope").await.unwrap();
        assert_eq!(handle.current().unwrap(), "token-1");

        // Six-minute token, five-minute margin: next refresh one minute in.
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(handle.current().unwrap(), "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_retries_and_keeps_old_token() {
        let source = CountingSource::new(vec![2]);
        let (handle, _task) = TokenRefresher::start(source.clone(), "scope").await.unwrap();

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(handle.current().unwrap(), "token-1");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handle.current().unwrap(), "token-3");
    }

    #[tokio::test(start_paused = true)]
    async fn task_exits_when_handles_dropped() {
        let source = CountingSource::new(vec![]);
        let (handle, task) = TokenRefresher::start(source, "scope").await.unwrap();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("refresher should stop")
            .unwrap();
    }

    #[test]
    fn short_lived_tokens_wait_at_least_the_retry_interval() {
        let token = AccessToken::new("t", Utc::now() + chrono::Duration::minutes(1));
        assert_eq!(delay_until_refresh(&token), RETRY_INTERVAL);
    }
}
