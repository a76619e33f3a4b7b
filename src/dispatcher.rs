use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::warn;

use crate::{
    errors::{DiagnosisError, Result},
    policy::UploadPolicy,
    service::{InferenceService, PredictionResult},
    traits::ClassifierModel,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Async front door to an [`InferenceService`].
///
/// Bounds the number of requests in flight, runs the blocking pipeline on
/// tokio's blocking pool and gives every call a deadline.
pub struct Dispatcher<M: ClassifierModel + 'static> {
    service: Arc<InferenceService<M>>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    timeout_duration: Duration,
}

impl<M: ClassifierModel + 'static> Clone for Dispatcher<M> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            permits: Arc::clone(&self.permits),
            max_in_flight: self.max_in_flight,
            timeout_duration: self.timeout_duration,
        }
    }
}

impl<M: ClassifierModel + 'static> Dispatcher<M> {
    pub fn new(service: Arc<InferenceService<M>>, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            service,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            timeout_duration: DEFAULT_TIMEOUT,
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_duration = timeout;
        self
    }

    pub fn service(&self) -> &InferenceService<M> {
        &self.service
    }

    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Classifies one uploaded image. Waiting for a free slot counts
    /// against the deadline.
    ///
    /// The slot stays taken until the blocking job returns, even when the
    /// caller has already been answered with `DeadlineExceeded`.
    pub async fn classify(&self, bytes: Vec<u8>) -> Result<PredictionResult> {
        let start = Instant::now();
        let deadline = start + self.timeout_duration;

        let result = timeout(self.timeout_duration, async {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|e| DiagnosisError::Inference {
                    operation: "dispatch".to_string(),
                    source: Box::new(e),
                })?;

            let service = Arc::clone(&self.service);
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                service.classify_within(bytes.as_slice(), deadline)
            })
            .await
            .map_err(|e| DiagnosisError::Inference {
                operation: "blocking task".to_string(),
                source: Box::new(e),
            })?
        })
        .await;

        match result {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                warn!(?elapsed, "classification timed out");
                Err(DiagnosisError::DeadlineExceeded { elapsed })
            }
        }
    }

    /// Reads an image file, applies `policy` and classifies it. An unreadable
    /// file is the caller's input problem and reported as `Decode`.
    pub async fn classify_file(
        &self,
        path: &Path,
        policy: &UploadPolicy,
    ) -> Result<PredictionResult> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| DiagnosisError::Decode {
                operation: format!("reading metadata of {}", path.display()),
                source: Box::new(e),
            })?;
        policy.check(path, metadata.len())?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DiagnosisError::Decode {
                operation: format!("reading {}", path.display()),
                source: Box::new(e),
            })?;
        self.classify(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::DiseaseKnowledgeBase;
    use crate::errors::ErrorKind;
    use crate::mocks::{FailingModel, FixedScoresModel, SlowModel};
    use crate::registry::ClassIndexRegistry;
    use crate::traits::TensorLayout;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use ndarray::prelude::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png() -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([10, 200, 10])))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn dispatcher<M: ClassifierModel + 'static>(model: M, max_in_flight: usize) -> Dispatcher<M> {
        let service = InferenceService::new(
            model,
            ClassIndexRegistry::bundled().unwrap(),
            DiseaseKnowledgeBase::bundled().unwrap(),
        )
        .unwrap();
        Dispatcher::new(Arc::new(service), max_in_flight)
    }

    #[tokio::test]
    async fn test_classify() -> Result<()> {
        let dispatcher = dispatcher(FixedScoresModel::one_hot(38, 37), 2);
        let result = dispatcher.classify(png()).await?;

        assert_eq!(result.class_id.as_str(), "Tomato___healthy");
        assert!(result.recognized);
        assert_eq!(dispatcher.available_slots(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let dispatcher = dispatcher(FailingModel::new(38), 1);

        let err = dispatcher.classify(png()).await.unwrap_err();
        assert!(matches!(err, DiagnosisError::Inference { .. }));

        let err = dispatcher.classify(b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, DiagnosisError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let model = SlowModel::new(FixedScoresModel::one_hot(38, 0), Duration::from_millis(500));
        let dispatcher = dispatcher(model, 1).with_timeout(Duration::from_millis(50));

        let err = dispatcher.classify(png()).await.unwrap_err();
        assert!(matches!(err, DiagnosisError::DeadlineExceeded { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_the_service() -> Result<()> {
        let model = SlowModel::new(FixedScoresModel::one_hot(38, 6), Duration::from_millis(20));
        let dispatcher = dispatcher(model, 2);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move { dispatcher.classify(png()).await }));
        }
        for handle in handles {
            let result = handle.await.unwrap()?;
            assert_eq!(result.class_id.as_str(), "Cherry_(including_sour)___healthy");
        }
        assert_eq!(dispatcher.available_slots(), 2);
        Ok(())
    }

    /// Records how many runs overlap; every run ignores its deadline.
    #[derive(Default)]
    struct CountingModel {
        running: AtomicUsize,
        peak: AtomicUsize,
        runs: AtomicUsize,
    }

    impl ClassifierModel for CountingModel {
        fn predict(&self, _tensor: ArrayView4<f32>) -> Result<Array1<f32>> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            self.running.fetch_sub(1, Ordering::SeqCst);

            let mut scores = Array1::zeros(38);
            scores[0] = 1.0;
            Ok(scores)
        }

        fn num_classes(&self) -> usize {
            38
        }

        fn input_size(&self) -> u32 {
            224
        }

        fn layout(&self) -> TensorLayout {
            TensorLayout::Nhwc
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_job_keeps_its_slot() {
        let model = Arc::new(CountingModel::default());
        let dispatcher =
            dispatcher(Arc::clone(&model), 1).with_timeout(Duration::from_millis(50));

        let err = dispatcher.classify(png()).await.unwrap_err();
        assert!(matches!(err, DiagnosisError::DeadlineExceeded { .. }));
        assert_eq!(dispatcher.available_slots(), 0);

        let err = dispatcher.classify(png()).await.unwrap_err();
        assert!(matches!(err, DiagnosisError::DeadlineExceeded { .. }));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(model.peak.load(Ordering::SeqCst), 1);
        assert_eq!(model.runs.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_client_input() -> Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let dispatcher = dispatcher(FixedScoresModel::one_hot(38, 37), 1);
        let policy = UploadPolicy::default();

        let missing = temp_dir.path().join("missing.png");
        let err = dispatcher.classify_file(&missing, &policy).await.unwrap_err();
        assert!(matches!(err, DiagnosisError::Decode { .. }));
        assert_eq!(err.kind(), ErrorKind::ClientInput);
        assert_eq!(err.http_status_hint(), 400);

        let leaf = temp_dir.path().join("leaf.png");
        std::fs::write(&leaf, png())?;
        let result = dispatcher.classify_file(&leaf, &policy).await?;
        assert_eq!(result.class_id.as_str(), "Tomato___healthy");

        let rejected = temp_dir.path().join("leaf.bmp");
        std::fs::write(&rejected, png())?;
        let err = dispatcher.classify_file(&rejected, &policy).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientInput);
        Ok(())
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let dispatcher = dispatcher(FixedScoresModel::one_hot(38, 0), 0);
        assert_eq!(dispatcher.max_in_flight(), 1);
    }
}
