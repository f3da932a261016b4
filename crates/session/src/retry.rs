//! Status-driven retry loop shared by block, merge and direct requests.

use std::future::Future;
use std::time::Duration;

use blockput_protocol::{StatusClass, StatusPolicy};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::RequestError;
use crate::transport::{HttpResponse, TransportError};
use crate::types::RetryInfo;

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub statuses: StatusPolicy,
    pub max_retries: u32,
    pub interval: Duration,
}

/// Sends through `attempt` until the status is decisive.
///
/// Success statuses resolve `Ok`, failure statuses `Rejected`. Anything
/// else waits `interval`, reports through `on_retry` and resends while
/// budget remains. The wait observes `cancel`.
pub(crate) async fn send_with_retry<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    url: &str,
    mut attempt: F,
    mut on_retry: impl FnMut(RetryInfo),
) -> Result<HttpResponse, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<HttpResponse, TransportError>>,
{
    let mut remaining = policy.max_retries;
    loop {
        let response = match attempt().await {
            Ok(response) => response,
            Err(TransportError::Aborted) => return Err(RequestError::Aborted),
            Err(e) => return Err(RequestError::Transport(e)),
        };

        match policy.statuses.classify(response.status) {
            StatusClass::Success => return Ok(response),
            StatusClass::Fail => return Err(RequestError::Rejected(response)),
            StatusClass::Retry if remaining == 0 => return Err(RequestError::Exhausted(response)),
            StatusClass::Retry => {
                warn!(url, status = response.status, remaining, "ambiguous status, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RequestError::Aborted),
                    _ = tokio::time::sleep(policy.interval) => {}
                }
                on_retry(RetryInfo {
                    status_code: response.status,
                    url: url.to_string(),
                });
                remaining -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            statuses: StatusPolicy::default(),
            max_retries,
            interval: Duration::from_millis(100),
        }
    }

    /// Statuses answered in order; the last one repeats.
    fn script(statuses: &[u16]) -> Mutex<VecDeque<u16>> {
        Mutex::new(statuses.iter().copied().collect())
    }

    fn next(queue: &Mutex<VecDeque<u16>>) -> Result<HttpResponse, TransportError> {
        let mut queue = queue.lock().unwrap();
        let status = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            *queue.front().unwrap()
        };
        Ok(HttpResponse::new(status, Vec::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn success_first_try_sends_once() {
        let queue = script(&[200]);
        let mut calls = 0;
        let mut retries = Vec::new();
        let result = send_with_retry(
            &policy(3),
            &CancellationToken::new(),
            "https://up/mkblk/4",
            || {
                calls += 1;
                std::future::ready(next(&queue))
            },
            |info| retries.push(info),
        )
        .await;
        assert_eq!(result.unwrap().status, 200);
        assert_eq!(calls, 1);
        assert!(retries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_then_success_retries_once() {
        let queue = script(&[503, 200]);
        let mut retries = Vec::new();
        let result = send_with_retry(
            &policy(3),
            &CancellationToken::new(),
            "https://up/mkblk/4",
            || std::future::ready(next(&queue)),
            |info| retries.push(info),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(
            retries,
            vec![RetryInfo {
                status_code: 503,
                url: "https://up/mkblk/4".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_reports_last_response() {
        let queue = script(&[503]);
        let mut calls = 0;
        let mut retries = 0;
        let result = send_with_retry(
            &policy(2),
            &CancellationToken::new(),
            "u",
            || {
                calls += 1;
                std::future::ready(next(&queue))
            },
            |_| retries += 1,
        )
        .await;
        assert!(matches!(result, Err(RequestError::Exhausted(r)) if r.status == 503));
        assert_eq!(calls, 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_status_is_not_retried() {
        let queue = script(&[404]);
        let mut retries = 0;
        let result = send_with_retry(
            &policy(5),
            &CancellationToken::new(),
            "u",
            || std::future::ready(next(&queue)),
            |_| retries += 1,
        )
        .await;
        assert!(matches!(result, Err(RequestError::Rejected(r)) if r.status == 404));
        assert_eq!(retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_abort_is_distinct() {
        let result = send_with_retry(
            &policy(5),
            &CancellationToken::new(),
            "u",
            || std::future::ready(Err(TransportError::Aborted)),
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(RequestError::Aborted)));

        let result = send_with_retry(
            &policy(5),
            &CancellationToken::new(),
            "u",
            || std::future::ready(Err(TransportError::Timeout)),
            |_| {},
        )
        .await;
        assert!(matches!(
            result,
            Err(RequestError::Transport(TransportError::Timeout))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_retry_wait_aborts() {
        let queue = script(&[503]);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let mut retries = 0;
        let result = send_with_retry(
            &policy(5),
            &cancel,
            "u",
            || std::future::ready(next(&queue)),
            |_| retries += 1,
        )
        .await;
        assert!(matches!(result, Err(RequestError::Aborted)));
        assert_eq!(retries, 0);
    }
}
