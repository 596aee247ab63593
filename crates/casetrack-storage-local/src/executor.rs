use std::sync::Arc;
use std::time::Duration;

use casetrack_storage_core::{
    DirectoryCapability, ErrorClass, StoreError, WriteReport, WriteTask,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

/// Retry policy for physical write attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum physical attempts per task.
    pub max_retries: u32,
    /// Delay before retry n; clamped to the last step when attempts exceed
    /// the table.
    pub backoff_steps: Vec<Duration>,
    /// Upper bound on one physical attempt. A hung I/O call counts as a
    /// transient failure and consumes an attempt, so a stuck disk is bounded
    /// by `max_retries * attempt_timeout`.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_steps: vec![
                Duration::from_millis(500),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize)
            .saturating_sub(1)
            .min(self.backoff_steps.len().saturating_sub(1));
        self.backoff_steps
            .get(idx)
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }
}

/// Performs one write task: serialize, write, verify, with bounded retry.
///
/// No two invocations run concurrently; the engine serializes every caller
/// through its write gate, which is what enforces the single-writer
/// invariant.
pub struct WriteExecutor {
    capability: Arc<dyn DirectoryCapability>,
    document_name: String,
    policy: RetryPolicy,
}

impl WriteExecutor {
    pub fn new(
        capability: Arc<dyn DirectoryCapability>,
        document_name: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            capability,
            document_name: document_name.into(),
            policy,
        }
    }

    /// Run one task to completion or terminal failure.
    ///
    /// - transient failures retry up to `max_retries` with increasing
    ///   backoff, invisible to subscribers;
    /// - a lost permission returns immediately, since retrying cannot
    ///   succeed without a fresh user grant;
    /// - exhausted retries return `RetriesExhausted`; the payload survives
    ///   only in memory until a later manual save retries from scratch.
    #[instrument(
        skip(self, task),
        fields(doc = %self.document_name, bytes = task.payload.len(), destructive = task.destructive)
    )]
    pub async fn execute(
        &self,
        mut task: WriteTask,
        operation: &str,
    ) -> Result<WriteReport, StoreError> {
        loop {
            task.attempt += 1;
            match self.attempt_once(&task.payload).await {
                Ok(content_hash) => {
                    debug!(
                        attempt = task.attempt,
                        hash = %hex::encode(&content_hash),
                        "write verified"
                    );
                    return Ok(WriteReport {
                        content_hash,
                        completed_at: Utc::now(),
                        attempts: task.attempt,
                    });
                }
                Err(err) => match err.class() {
                    ErrorClass::Permission => {
                        warn!(attempt = task.attempt, error = %err, "capability lost mid-write");
                        return Err(err);
                    }
                    ErrorClass::Transient if task.attempt < self.policy.max_retries => {
                        let delay = self.policy.backoff_for(task.attempt);
                        debug!(
                            attempt = task.attempt,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "transient write failure, backing off"
                        );
                        task.last_error = Some(err.to_string());
                        sleep(delay).await;
                    }
                    _ => {
                        warn!(attempt = task.attempt, error = %err, "write abandoned");
                        return Err(StoreError::RetriesExhausted {
                            operation: operation.to_string(),
                            message: err.to_string(),
                        });
                    }
                },
            }
        }
    }

    /// One physical attempt: write, then verify the bytes that reached disk.
    async fn attempt_once(&self, payload: &[u8]) -> Result<Vec<u8>, StoreError> {
        let expected: Vec<u8> = Sha256::digest(payload).to_vec();

        let write_and_verify = async {
            self.capability
                .write_file(&self.document_name, payload)
                .await?;

            let on_disk = self
                .capability
                .read_file(&self.document_name)
                .await?
                .ok_or_else(|| {
                    StoreError::Io(format!("{} missing after write", self.document_name))
                })?;

            let actual: Vec<u8> = Sha256::digest(&on_disk).to_vec();
            if actual != expected {
                return Err(StoreError::Io(format!(
                    "read-back hash mismatch for {}",
                    self.document_name
                )));
            }
            Ok(actual)
        };

        match timeout(self.policy.attempt_timeout, write_and_verify).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Io(format!(
                "write attempt timed out after {:?}",
                self.policy.attempt_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use casetrack_storage_core::{PermissionState, StoredHandleRecord};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Injects a scripted number of write failures before succeeding.
    #[derive(Debug)]
    struct FlakyCapability {
        failures_left: AtomicU32,
        failure: StoreError,
        stored: Mutex<Option<Vec<u8>>>,
        write_calls: AtomicU32,
    }

    impl FlakyCapability {
        fn new(failures: u32, failure: StoreError) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                failure,
                stored: Mutex::new(None),
                write_calls: AtomicU32::new(0),
            }
        }

        fn write_calls(&self) -> u32 {
            self.write_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DirectoryCapability for FlakyCapability {
        fn display_name(&self) -> String {
            "flaky".into()
        }

        fn to_record(&self) -> StoredHandleRecord {
            StoredHandleRecord {
                directory: "/flaky".into(),
                display_name: "flaky".into(),
                granted_at: Utc::now(),
            }
        }

        async fn query_permission(&self) -> PermissionState {
            PermissionState::Granted
        }

        async fn request_permission(&self) -> PermissionState {
            PermissionState::Granted
        }

        async fn read_file(&self, _name: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.stored.lock().unwrap().clone())
        }

        async fn write_file(&self, _name: &str, data: &[u8]) -> Result<(), StoreError> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(self.failure.clone());
            }
            *self.stored.lock().unwrap() = Some(data.to_vec());
            Ok(())
        }

        async fn remove_file(&self, _name: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn list_files(&self) -> Result<Vec<String>, StoreError> {
            Ok(vec![])
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_steps: vec![Duration::from_millis(1)],
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn backoff_clamps_to_last_step() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_steps: vec![Duration::from_millis(10), Duration::from_millis(20)],
            attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn first_attempt_success_writes_and_verifies() {
        let cap = Arc::new(FlakyCapability::new(0, StoreError::Io("unused".into())));
        let executor = WriteExecutor::new(cap.clone(), "cases.json", fast_policy(3));

        let report = executor
            .execute(WriteTask::new(b"{\"v\":1}".to_vec(), false), "autosave")
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(cap.write_calls(), 1);
        assert_eq!(
            cap.stored.lock().unwrap().as_deref(),
            Some(b"{\"v\":1}".as_slice())
        );
        assert_eq!(
            report.content_hash,
            Sha256::digest(b"{\"v\":1}").to_vec()
        );
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let cap = Arc::new(FlakyCapability::new(2, StoreError::Io("disk busy".into())));
        let executor = WriteExecutor::new(cap.clone(), "cases.json", fast_policy(3));

        let report = executor
            .execute(WriteTask::new(b"{}".to_vec(), false), "autosave")
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(cap.write_calls(), 3);
    }

    #[tokio::test]
    async fn permission_loss_is_never_retried() {
        let cap = Arc::new(FlakyCapability::new(
            u32::MAX,
            StoreError::PermissionLost("revoked".into()),
        ));
        let executor = WriteExecutor::new(cap.clone(), "cases.json", fast_policy(3));

        let err = executor
            .execute(WriteTask::new(b"{}".to_vec(), false), "autosave")
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::PermissionLost(_)));
        // Exactly one physical attempt, zero retries.
        assert_eq!(cap.write_calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_operation_name() {
        let cap = Arc::new(FlakyCapability::new(
            u32::MAX,
            StoreError::Io("disk full".into()),
        ));
        let executor = WriteExecutor::new(cap.clone(), "cases.json", fast_policy(3));

        let err = executor
            .execute(WriteTask::new(b"{}".to_vec(), false), "autosave")
            .await
            .unwrap_err();

        match err {
            StoreError::RetriesExhausted { operation, message } => {
                assert_eq!(operation, "autosave");
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(cap.write_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_times_out_as_transient() {
        #[derive(Debug)]
        struct HangingCapability;

        #[async_trait]
        impl DirectoryCapability for HangingCapability {
            fn display_name(&self) -> String {
                "hang".into()
            }

            fn to_record(&self) -> StoredHandleRecord {
                StoredHandleRecord {
                    directory: "/hang".into(),
                    display_name: "hang".into(),
                    granted_at: Utc::now(),
                }
            }

            async fn query_permission(&self) -> PermissionState {
                PermissionState::Granted
            }

            async fn request_permission(&self) -> PermissionState {
                PermissionState::Granted
            }

            async fn read_file(&self, _name: &str) -> Result<Option<Vec<u8>>, StoreError> {
                Ok(None)
            }

            async fn write_file(&self, _name: &str, _data: &[u8]) -> Result<(), StoreError> {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            }

            async fn remove_file(&self, _name: &str) -> Result<(), StoreError> {
                Ok(())
            }

            async fn list_files(&self) -> Result<Vec<String>, StoreError> {
                Ok(vec![])
            }
        }

        let policy = RetryPolicy {
            max_retries: 2,
            backoff_steps: vec![Duration::from_millis(1)],
            attempt_timeout: Duration::from_millis(50),
        };
        let executor = WriteExecutor::new(Arc::new(HangingCapability), "cases.json", policy);

        let err = executor
            .execute(WriteTask::new(b"{}".to_vec(), false), "autosave")
            .await
            .unwrap_err();

        match err {
            StoreError::RetriesExhausted { message, .. } => {
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
