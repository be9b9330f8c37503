//! Backoff policy for records whose endpoint could not be reached.
//!
//! Only failures that happen before the server could have seen a record are
//! retried. Timeouts, rejections and transport errors are final for the
//! cycle, so a record is never submitted twice within one run.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use serde::{Deserialize, Serialize};

use fieldsync_common::{Error, FailureReason};

use crate::submit::{SubmissionClient, SubmissionPayload, SubmissionResponse};

/// Backoff settings for unreachable endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Resubmissions after the first attempt.
    pub max_retries: u32,
    /// Delay before the first resubmission.
    pub initial_delay: Duration,
    /// Cap for the exponential growth.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread delays by +/- 25%.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Delay before resubmission number `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());

        let spread = if self.jitter {
            0.75 + rand::random::<f64>() * 0.5
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * spread)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Submits one payload, backing off while the endpoint is unreachable.
///
/// Every error the client can raise ends up as the [`FailureReason`]
/// recorded against the record.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Submit `payload` through `client`.
    ///
    /// Returns the server's answer, accepted or rejected, or the reason no
    /// answer was obtained.
    pub async fn submit<C: SubmissionClient + ?Sized>(
        &self,
        client: &C,
        payload: &SubmissionPayload,
    ) -> std::result::Result<SubmissionResponse, FailureReason> {
        let mut resubmissions = 0;

        loop {
            let reason = match client.submit(payload).await {
                Ok(response) => {
                    if resubmissions > 0 {
                        debug!(
                            "{} reached {} after {} resubmissions",
                            payload.record_id,
                            client.name(),
                            resubmissions
                        );
                    }
                    return Ok(response);
                }
                Err(err) => failure_reason(err),
            };

            if !matches!(reason, FailureReason::NetworkUnreachable(_))
                || resubmissions >= self.config.max_retries
            {
                return Err(reason);
            }

            let delay = self.config.delay_for_attempt(resubmissions);
            resubmissions += 1;
            warn!(
                "{} could not reach {} ({}), resubmitting in {:?}",
                payload.record_id,
                client.name(),
                reason,
                delay
            );
            sleep(delay).await;
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn failure_reason(err: Error) -> FailureReason {
    match err {
        Error::Submission(reason) => reason,
        Error::Network(msg) => FailureReason::NetworkUnreachable(msg),
        other => FailureReason::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fieldsync_common::{Category, RecordId, RecordStatus, Result, SurveyRecord};
    use serde_json::Map;
    use std::sync::Mutex;

    /// Replays a fixed list of answers, then accepts.
    struct Replay {
        answers: Mutex<Vec<Result<SubmissionResponse>>>,
        calls: Mutex<u32>,
    }

    impl Replay {
        fn new(answers: Vec<Result<SubmissionResponse>>) -> Self {
            Self {
                answers: Mutex::new(answers.into_iter().rev().collect()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SubmissionClient for Replay {
        fn name(&self) -> &str {
            "replay"
        }

        async fn submit(&self, _payload: &SubmissionPayload) -> Result<SubmissionResponse> {
            *self.calls.lock().unwrap() += 1;
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(SubmissionResponse::accepted()))
        }
    }

    fn payload() -> SubmissionPayload {
        let record = SurveyRecord::new(
            RecordId::new("C-1").unwrap(),
            Category::ConsumerIndexing,
            RecordStatus::ToSync,
            Map::new(),
        );
        SubmissionPayload::from(&record)
    }

    fn quick(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(RetryConfig {
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryConfig::new(max_retries)
        })
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: false,
            ..RetryConfig::new(10)
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(4),
            ..RetryConfig::new(1)
        };
        for _ in 0..20 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_secs(3) && delay <= Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retried() {
        let client = Replay::new(vec![
            Err(Error::Network("connection refused".to_string())),
            Err(Error::Network("connection refused".to_string())),
        ]);

        let response = quick(3).submit(&client, &payload()).await.unwrap();
        assert!(response.success);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_run_out() {
        let client = Replay::new(vec![
            Err(Error::Network("no route to host".to_string())),
            Err(Error::Network("no route to host".to_string())),
            Err(Error::Network("no route to host".to_string())),
        ]);

        let reason = quick(2).submit(&client, &payload()).await.unwrap_err();
        assert_eq!(
            reason,
            FailureReason::NetworkUnreachable("no route to host".to_string())
        );
        // First attempt plus two resubmissions.
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_not_resubmitted() {
        let client = Replay::new(vec![Err(Error::Submission(FailureReason::Timeout))]);

        let reason = quick(3).submit(&client, &payload()).await.unwrap_err();
        assert_eq!(reason, FailureReason::Timeout);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_an_answer() {
        let client = Replay::new(vec![Ok(SubmissionResponse::rejected("duplicate"))]);

        let response = quick(3).submit(&client, &payload()).await.unwrap();
        assert!(!response.success);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_become_transport_failures() {
        let client = Replay::new(vec![Err(Error::Serialization("bad body".to_string()))]);

        let reason = quick(3).submit(&client, &payload()).await.unwrap_err();
        assert!(matches!(reason, FailureReason::Transport(msg) if msg.contains("bad body")));
        assert_eq!(client.calls(), 1);
    }
}
