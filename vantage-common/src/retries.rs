// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

/// Runs `action` against `input` until it succeeds, a non-retriable error
/// occurs, or the configured attempts are exhausted. Delays grow by the
/// configured multiplier, capped at `max_delay`.
pub async fn with_retries<In, Out, Err, F>(
    target_label: &'static str,
    op_label: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    input: &In,
    action: F,
    is_retriable: fn(&Err) -> bool,
) -> Result<Out, Err>
where
    Err: Display,
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<Out, Err>> + Send + 'a>>,
{
    let mut attempt = 1u32;
    let mut delay = config.min_delay;

    loop {
        match action(input).await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        target_label,
                        op_label,
                        op_id = ?op_id,
                        attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if attempt >= config.max_attempts || !is_retriable(&error) {
                    return Err(error);
                }
                warn!(
                    target_label,
                    op_label,
                    op_id = ?op_id,
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_r::test;

    #[derive(Debug)]
    struct TestError {
        retriable: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retriable: {})", self.retriable)
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[test]
    async fn retries_until_success() {
        let counter = AtomicU32::new(0);
        let result: Result<u32, TestError> = with_retries(
            "test",
            "retries-until-success",
            None,
            &fast_config(5),
            &counter,
            |counter| {
                Box::pin(async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(TestError { retriable: true })
                    } else {
                        Ok(n)
                    }
                })
            },
            |err| err.retriable,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    async fn non_retriable_errors_fail_immediately() {
        let counter = AtomicU32::new(0);
        let result: Result<u32, TestError> = with_retries(
            "test",
            "non-retriable",
            None,
            &fast_config(5),
            &counter,
            |counter| {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TestError { retriable: false })
                })
            },
            |err| err.retriable,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    async fn attempts_are_bounded() {
        let counter = AtomicU32::new(0);
        let result: Result<u32, TestError> = with_retries(
            "test",
            "bounded",
            Some("op-1".to_string()),
            &fast_config(3),
            &counter,
            |counter| {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TestError { retriable: true })
                })
            },
            |err| err.retriable,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
