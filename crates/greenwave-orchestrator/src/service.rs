//! Batch orchestration: detect, optimize, recommend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use greenwave_core::{
    AggregateResponse, DetectionTask, LaneError, OptimizerError, OptimizerInvocation,
    OptimizerResult, RecommendationOutcome, LANE_COUNT,
};
use greenwave_optimizer::{Optimizer, OptimizerInvoker};
use greenwave_worker::{CommandLauncher, DetectionWorkerPool, NoDetector, WorkerLauncher};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::recommender::{CommandRecommender, Recommender};
use crate::recorder::{JsonLinesRecorder, RunRecord, RunRecorder};

/// Runs one intersection batch end to end.
///
/// Stages are strictly ordered and each one gates the next: the optimizer is
/// only invoked when all four lanes produced a count, and the recommender only
/// when the optimizer succeeded. Completed runs are handed to the recorder,
/// whose failures never change the response.
pub struct OrchestrationService {
    optimizer: Arc<dyn Optimizer>,
    pool: DetectionWorkerPool,
    recommender: Option<Arc<dyn Recommender>>,
    recorder: Option<Arc<dyn RunRecorder>>,
    optimizer_timeout: Duration,
    adhoc_timeout: Duration,
    verbose: bool,
}

impl OrchestrationService {
    pub fn new(optimizer: Arc<dyn Optimizer>, pool: DetectionWorkerPool) -> Self {
        let defaults = Config::default();
        Self {
            optimizer,
            pool,
            recommender: None,
            recorder: None,
            optimizer_timeout: defaults.optimizer_timeout(),
            adhoc_timeout: defaults.adhoc_timeout(),
            verbose: defaults.verbose,
        }
    }

    /// Build the service with process-backed collaborators from `config`.
    pub fn from_config(config: &Config) -> Self {
        let optimizer =
            OptimizerInvoker::new(&config.optimizer_path).with_grace_period(config.grace_period());

        let launcher: Arc<dyn WorkerLauncher> = match &config.detector_program {
            Some(program) => {
                let mut launcher =
                    CommandLauncher::new(program).with_args(config.detector_args.clone());
                for key in &config.detector_env_passthrough {
                    launcher = launcher.with_env_passthrough(key.clone());
                }
                Arc::new(launcher)
            }
            None => {
                warn!("No detector configured - detection will fail");
                Arc::new(NoDetector)
            }
        };
        let pool = DetectionWorkerPool::new(launcher).with_config(config.pool_config());

        let mut service = Self::new(Arc::new(optimizer), pool)
            .with_optimizer_timeout(config.optimizer_timeout())
            .with_adhoc_timeout(config.adhoc_timeout())
            .with_verbose(config.verbose);

        if let Some(program) = &config.recommender_program {
            let recommender = CommandRecommender::new(program)
                .with_args(config.recommender_args.clone())
                .with_timeout(config.recommender_timeout());
            service = service.with_recommender(Arc::new(recommender));
        }
        if let Some(path) = &config.history_path {
            service = service.with_recorder(Arc::new(JsonLinesRecorder::new(path)));
        }

        service
    }

    pub fn with_recommender(mut self, recommender: Arc<dyn Recommender>) -> Self {
        self.recommender = Some(recommender);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_optimizer_timeout(mut self, timeout: Duration) -> Self {
        self.optimizer_timeout = timeout;
        self
    }

    pub fn with_adhoc_timeout(mut self, timeout: Duration) -> Self {
        self.adhoc_timeout = timeout;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Process one batch of four lane videos (north, south, west, east).
    ///
    /// Never returns an error: the response's `stage` says where the batch
    /// stopped and carries the errors of that stage.
    pub async fn process_batch(&self, videos: [PathBuf; LANE_COUNT]) -> AggregateResponse {
        let started = Instant::now();
        let tasks = DetectionTask::batch(videos);

        info!(batch = ?tasks.iter().map(|t| t.video_path.display().to_string()).collect::<Vec<_>>(), "Processing batch");

        let lanes = self.pool.run_batch(&tasks).await;

        let mut counts = [0u64; LANE_COUNT];
        let mut detection_errors = Vec::new();
        for outcome in &lanes {
            if let Some(error) = outcome.failure() {
                detection_errors.push(LaneError {
                    index: outcome.lane_index,
                    error: error.to_string(),
                });
            } else if let (Some(slot), Some(count)) =
                (counts.get_mut(outcome.lane_index), outcome.count)
            {
                *slot = count;
            }
        }

        if !detection_errors.is_empty() {
            warn!(
                failed_lanes = ?detection_errors.iter().map(|e| e.index).collect::<Vec<_>>(),
                "Detection failed - skipping optimization"
            );
            return AggregateResponse::detection_failed(counts, lanes, detection_errors)
                .with_elapsed_seconds(started.elapsed().as_secs_f64());
        }

        info!(counts = ?counts, "All lanes counted");

        let invocation = OptimizerInvocation::new(counts, self.optimizer_timeout, self.verbose);
        let result = match self.optimizer.optimize(&invocation).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Optimizer failed");
                return AggregateResponse::optimization_failed(counts, lanes, None, &e)
                    .with_elapsed_seconds(started.elapsed().as_secs_f64());
            }
        };

        if let Some(e) = result.failure() {
            error!(error = %e, exit_code = ?result.exit_code, "Optimizer reported an error");
            return AggregateResponse::optimization_failed(counts, lanes, Some(result), e)
                .with_elapsed_seconds(started.elapsed().as_secs_f64());
        }

        let recommendation = self.recommend(counts, &result).await;

        let response = AggregateResponse::completed(counts, lanes, result, recommendation)
            .with_elapsed_seconds(started.elapsed().as_secs_f64());
        info!(
            elapsed_seconds = response.elapsed_seconds,
            "Batch complete"
        );

        self.record(&response).await;
        response
    }

    async fn record(&self, response: &AggregateResponse) {
        let (Some(recorder), Some(result)) = (&self.recorder, &response.optimizer_result) else {
            return;
        };

        let run = RunRecord {
            counts: response.per_lane_counts,
            optimizer: result,
            recommendation: &response.rl_recommendation,
            delay: result.delay(),
            elapsed_seconds: response.elapsed_seconds,
        };
        if let Err(e) = recorder.record(&run).await {
            warn!(error = %e, "Failed to record run");
        }
    }

    /// Run only the optimizer on caller-supplied counts.
    pub async fn optimize_counts(&self, values: &[Value]) -> Result<OptimizerResult, OptimizerError> {
        let invocation = OptimizerInvocation::from_values(values, self.adhoc_timeout, self.verbose)?;
        self.optimizer.optimize(&invocation).await
    }

    async fn recommend(&self, counts: [u64; LANE_COUNT], result: &OptimizerResult) -> RecommendationOutcome {
        let Some(recommender) = &self.recommender else {
            return RecommendationOutcome::Skipped;
        };

        match recommender.recommend(counts, result).await {
            Ok(recommendation) => RecommendationOutcome::Recommended { recommendation },
            Err(e) => {
                warn!(error = %e, "Recommendation failed");
                RecommendationOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use greenwave_core::{
        BatchStage, OptimizerErrorKind, RecommendationError, RecordError, StdoutPayload,
    };
    use greenwave_worker::PoolConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Prints the video's file name as its count; `broken` videos fail.
    const DETECTOR: &str = r#"
name="${1##*/}"
case "$name" in
  *broken*) echo "cannot decode frame" >&2; exit 1 ;;
esac
echo "{\"count\": $name}"
"#;

    enum Reply {
        Ok(&'static str),
        Exit(i32),
        Timeout,
        Missing,
    }

    struct FakeOptimizer {
        reply: Reply,
        calls: AtomicUsize,
        last: Mutex<Option<OptimizerInvocation>>,
    }

    impl FakeOptimizer {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Optimizer for FakeOptimizer {
        async fn optimize(
            &self,
            invocation: &OptimizerInvocation,
        ) -> Result<OptimizerResult, OptimizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(invocation.clone());
            match self.reply {
                Reply::Ok(stdout) => Ok(OptimizerResult::from_payload(StdoutPayload::parse(stdout))),
                Reply::Exit(code) => {
                    let mut result = OptimizerResult::from_payload(StdoutPayload::parse("oops"));
                    result.mark_failed(code);
                    Ok(result)
                }
                Reply::Timeout => Err(OptimizerError::Timeout {
                    timeout: invocation.timeout,
                }),
                Reply::Missing => Err(OptimizerError::BinaryNotFound {
                    path: PathBuf::from("/opt/greenwave/Algo1"),
                }),
            }
        }
    }

    struct FakeRecommender {
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeRecommender {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Recommender for FakeRecommender {
        async fn recommend(
            &self,
            counts: [u64; LANE_COUNT],
            _optimizer: &OptimizerResult,
        ) -> Result<Value, RecommendationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RecommendationError::Failed("model not loaded".to_string()));
            }
            Ok(json!({"phase": "north_south", "counts": counts}))
        }
    }

    struct FakeRecorder {
        fail: bool,
        calls: AtomicUsize,
        last: Mutex<Option<Value>>,
    }

    impl FakeRecorder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl RunRecorder for FakeRecorder {
        async fn record(&self, run: &RunRecord<'_>) -> Result<(), RecordError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(serde_json::to_value(run).unwrap());
            if self.fail {
                return Err(RecordError::Io(std::io::Error::other("disk full")));
            }
            Ok(())
        }
    }

    const GREENS: &str = r#"{"north":12,"south":10,"west":15,"east":13,"delay":40.1}"#;

    fn pool(dir: &TempDir) -> DetectionWorkerPool {
        let script = dir.path().join("detect.sh");
        std::fs::write(&script, DETECTOR).unwrap();
        let launcher = CommandLauncher::new("/bin/sh").with_args([script.to_string_lossy()]);
        DetectionWorkerPool::new(Arc::new(launcher)).with_config(PoolConfig {
            task_timeout: Duration::from_secs(10),
            batch_timeout: Duration::from_secs(20),
            grace_period: Duration::from_millis(500),
            ..PoolConfig::default()
        })
    }

    fn videos(names: [&str; LANE_COUNT]) -> [PathBuf; LANE_COUNT] {
        names.map(|n| PathBuf::from("/videos").join(n))
    }

    #[tokio::test]
    async fn test_failed_lane_skips_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = FakeOptimizer::new(Reply::Ok(GREENS));
        let service = OrchestrationService::new(optimizer.clone(), pool(&dir));

        let response = service.process_batch(videos(["5", "12", "broken", "9"])).await;

        assert_eq!(response.stage, BatchStage::DetectionFailed);
        assert_eq!(response.detection_errors.len(), 1);
        assert_eq!(response.detection_errors[0].index, 2);
        assert!(response.detection_errors[0].error.contains("cannot decode frame"));
        assert!(response.optimizer_result.is_none());
        assert_eq!(response.per_lane_counts, [5, 12, 0, 9]);
        assert_eq!(optimizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_full_batch_with_recommendation() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = FakeOptimizer::new(Reply::Ok(GREENS));
        let recommender = FakeRecommender::new(false);
        let service = OrchestrationService::new(optimizer.clone(), pool(&dir))
            .with_recommender(recommender.clone())
            .with_optimizer_timeout(Duration::from_secs(7));

        let response = service.process_batch(videos(["5", "12", "3", "9"])).await;

        assert!(response.is_success());
        assert_eq!(response.per_lane_counts, [5, 12, 3, 9]);
        assert!(response.detection_errors.is_empty());

        let invocation = optimizer.last.lock().unwrap().clone().unwrap();
        assert_eq!(invocation.cars, [5, 12, 3, 9]);
        assert_eq!(invocation.timeout, Duration::from_secs(7));

        let result = response.optimizer_result.as_ref().unwrap();
        assert_eq!(result.greens(), Some([12, 10, 15, 13]));
        assert_eq!(
            response.rl_recommendation,
            RecommendationOutcome::Recommended {
                recommendation: json!({"phase": "north_south", "counts": [5, 12, 3, 9]})
            }
        );
        assert_eq!(recommender.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_optimizer_error_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let recommender = FakeRecommender::new(false);
        let service = OrchestrationService::new(FakeOptimizer::new(Reply::Timeout), pool(&dir))
            .with_recommender(recommender.clone());

        let response = service.process_batch(videos(["1", "2", "3", "4"])).await;

        assert_eq!(response.stage, BatchStage::OptimizationFailed);
        let failure = response.optimizer_error.as_ref().unwrap();
        assert_eq!(failure.kind, OptimizerErrorKind::Timeout);
        assert!(failure.retryable);
        assert_eq!(failure.timeout_secs, Some(30.0));
        assert_eq!(failure.exit_code, None);
        assert!(failure.message.contains("timed out"));
        assert!(response.optimizer_result.is_none());
        assert_eq!(response.rl_recommendation, RecommendationOutcome::Skipped);
        assert_eq!(recommender.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_optimizer_exit_code_keeps_result() {
        let dir = tempfile::tempdir().unwrap();
        let service = OrchestrationService::new(FakeOptimizer::new(Reply::Exit(7)), pool(&dir));

        let response = service.process_batch(videos(["1", "2", "3", "4"])).await;

        assert_eq!(response.stage, BatchStage::OptimizationFailed);
        let failure = response.optimizer_error.as_ref().unwrap();
        assert_eq!(failure.kind, OptimizerErrorKind::NonZeroExit);
        assert_eq!(failure.exit_code, Some(7));
        assert_eq!(failure.message, "Optimizer returned non-zero exit code 7");
        assert!(!failure.retryable);
        assert_eq!(response.optimizer_result.as_ref().unwrap().exit_code, Some(7));
    }

    #[tokio::test]
    async fn test_missing_optimizer_binary() {
        let dir = tempfile::tempdir().unwrap();
        let service = OrchestrationService::new(FakeOptimizer::new(Reply::Missing), pool(&dir));

        let response = service.process_batch(videos(["1", "2", "3", "4"])).await;

        assert_eq!(response.stage, BatchStage::OptimizationFailed);
        let failure = response.optimizer_error.as_ref().unwrap();
        assert_eq!(failure.kind, OptimizerErrorKind::BinaryNotFound);
        assert!(!failure.retryable);
        assert!(failure.message.contains("/opt/greenwave/Algo1"));
        assert!(response.optimizer_result.is_none());
    }

    #[tokio::test]
    async fn test_optimizer_reported_error_keeps_result() {
        let dir = tempfile::tempdir().unwrap();
        let service = OrchestrationService::new(
            FakeOptimizer::new(Reply::Ok(r#"{"error":"no feasible plan"}"#)),
            pool(&dir),
        );

        let response = service.process_batch(videos(["1", "2", "3", "4"])).await;

        assert_eq!(response.stage, BatchStage::OptimizationFailed);
        let failure = response.optimizer_error.as_ref().unwrap();
        assert_eq!(failure.kind, OptimizerErrorKind::Reported);
        assert_eq!(failure.message, "Optimizer reported an error: no feasible plan");
        assert!(!failure.retryable);
        assert!(response.optimizer_result.is_some());
    }

    #[tokio::test]
    async fn test_recorder_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = FakeRecorder::new(true);
        let service = OrchestrationService::new(FakeOptimizer::new(Reply::Ok(GREENS)), pool(&dir))
            .with_recorder(recorder.clone());

        let response = service.process_batch(videos(["5", "12", "3", "9"])).await;

        assert!(response.is_success());
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        let run = recorder.last.lock().unwrap().clone().unwrap();
        assert_eq!(run["counts"], json!([5, 12, 3, 9]));
        assert_eq!(run["delay"], json!(40.1));
        assert_eq!(run["recommendation"], json!({"status": "skipped"}));
        assert!(run["elapsed_seconds"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_recorder_skipped_when_batch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = FakeRecorder::new(false);
        let service = OrchestrationService::new(FakeOptimizer::new(Reply::Timeout), pool(&dir))
            .with_recorder(recorder.clone());

        service.process_batch(videos(["1", "2", "3", "4"])).await;
        service.process_batch(videos(["1", "broken", "3", "4"])).await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_config_has_no_detector() {
        let config = Config {
            optimizer_path: PathBuf::from("/nonexistent/Algo1"),
            ..Config::default()
        };
        let service = OrchestrationService::from_config(&config);

        let response = service.process_batch(videos(["1", "2", "3", "4"])).await;

        assert_eq!(response.stage, BatchStage::DetectionFailed);
        assert_eq!(response.detection_errors.len(), LANE_COUNT);
        assert!(response
            .detection_errors
            .iter()
            .all(|e| e.error.contains("no detector configured")));
    }

    #[tokio::test]
    async fn test_recommendation_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let service = OrchestrationService::new(FakeOptimizer::new(Reply::Ok(GREENS)), pool(&dir))
            .with_recommender(FakeRecommender::new(true));

        let response = service.process_batch(videos(["1", "2", "3", "4"])).await;

        assert!(response.is_success());
        assert_eq!(
            response.rl_recommendation,
            RecommendationOutcome::Failed {
                error: "Recommendation failed: model not loaded".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_no_recommender_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let service = OrchestrationService::new(FakeOptimizer::new(Reply::Ok(GREENS)), pool(&dir));

        let response = service.process_batch(videos(["1", "2", "3", "4"])).await;
        assert!(response.is_success());
        assert_eq!(response.rl_recommendation, RecommendationOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_optimize_counts() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = FakeOptimizer::new(Reply::Ok(GREENS));
        let service = OrchestrationService::new(optimizer.clone(), pool(&dir))
            .with_adhoc_timeout(Duration::from_secs(3));

        let err = service
            .optimize_counts(&[json!(1), json!(-2), json!(3), json!(4)])
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::InvalidInput(_)));
        assert_eq!(optimizer.calls(), 0);

        let result = service
            .optimize_counts(&[json!(5), json!("12"), json!(3.0), json!(9)])
            .await
            .unwrap();
        assert_eq!(result.delay(), Some(40.1));

        let invocation = optimizer.last.lock().unwrap().clone().unwrap();
        assert_eq!(invocation.cars, [5, 12, 3, 9]);
        assert_eq!(invocation.timeout, Duration::from_secs(3));
    }
}
