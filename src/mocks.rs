use std::time::{Duration, Instant};

use ndarray::prelude::*;

use crate::errors::{DiagnosisError, Result};
use crate::traits::{ClassifierModel, TensorLayout};

/// Test classifier that returns the same scores for every image.
#[derive(Debug, Clone)]
pub struct FixedScoresModel {
    scores: Vec<f32>,
    image_size: u32,
    layout: TensorLayout,
}

impl FixedScoresModel {
    pub fn new(scores: Vec<f32>) -> Self {
        Self {
            scores,
            image_size: 224,
            layout: TensorLayout::Nhwc,
        }
    }

    /// All mass on `index` out of `num_classes`.
    pub fn one_hot(num_classes: usize, index: usize) -> Self {
        let mut scores = vec![0.0; num_classes];
        scores[index] = 1.0;
        Self::new(scores)
    }

    pub const fn with_input(mut self, image_size: u32, layout: TensorLayout) -> Self {
        self.image_size = image_size;
        self.layout = layout;
        self
    }
}

impl ClassifierModel for FixedScoresModel {
    fn predict(&self, _tensor: ArrayView4<f32>) -> Result<Array1<f32>> {
        Ok(Array1::from(self.scores.clone()))
    }

    fn num_classes(&self) -> usize {
        self.scores.len()
    }

    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn layout(&self) -> TensorLayout {
        self.layout
    }
}

/// Test classifier computing its scores from the input tensor.
pub struct FnModel<F> {
    num_classes: usize,
    score: F,
}

impl<F> FnModel<F>
where
    F: Fn(ArrayView4<f32>) -> Vec<f32> + Send + Sync,
{
    pub const fn new(num_classes: usize, score: F) -> Self {
        Self { num_classes, score }
    }
}

impl<F> ClassifierModel for FnModel<F>
where
    F: Fn(ArrayView4<f32>) -> Vec<f32> + Send + Sync,
{
    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array1<f32>> {
        Ok(Array1::from((self.score)(tensor)))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn input_size(&self) -> u32 {
        224
    }

    fn layout(&self) -> TensorLayout {
        TensorLayout::Nhwc
    }
}

/// Test classifier whose every run fails, like a runtime out of memory.
#[derive(Debug, Clone)]
pub struct FailingModel {
    num_classes: usize,
}

impl FailingModel {
    pub const fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

impl ClassifierModel for FailingModel {
    fn predict(&self, _tensor: ArrayView4<f32>) -> Result<Array1<f32>> {
        Err(DiagnosisError::inference(
            "session run",
            "simulated resource exhaustion",
        ))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn input_size(&self) -> u32 {
        224
    }

    fn layout(&self) -> TensorLayout {
        TensorLayout::Nhwc
    }
}

/// Wraps another model and sleeps before every run.
#[derive(Debug, Clone)]
pub struct SlowModel<M> {
    inner: M,
    delay: Duration,
}

impl<M: ClassifierModel> SlowModel<M> {
    pub const fn new(inner: M, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl<M: ClassifierModel> ClassifierModel for SlowModel<M> {
    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array1<f32>> {
        std::thread::sleep(self.delay);
        self.inner.predict(tensor)
    }

    fn predict_within(&self, tensor: ArrayView4<f32>, deadline: Instant) -> Result<Array1<f32>> {
        let start = Instant::now();
        std::thread::sleep(self.delay);
        if Instant::now() > deadline {
            return Err(DiagnosisError::DeadlineExceeded {
                elapsed: start.elapsed(),
            });
        }
        self.inner.predict(tensor)
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn input_size(&self) -> u32 {
        self.inner.input_size()
    }

    fn layout(&self) -> TensorLayout {
        self.inner.layout()
    }
}

/// Mean of each RGB channel of a single-image NHWC tensor.
pub fn channel_means(tensor: ArrayView4<f32>) -> [f32; 3] {
    let mut means = [0.0; 3];
    for (channel, mean) in means.iter_mut().enumerate() {
        *mean = tensor
            .index_axis(Axis(3), channel)
            .mean()
            .unwrap_or_default();
    }
    means
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_scores_model() -> Result<()> {
        let model = FixedScoresModel::one_hot(4, 2);
        let input = Array4::<f32>::zeros((1, 224, 224, 3));

        assert_eq!(model.num_classes(), 4);
        assert_eq!(model.predict(input.view())?.to_vec(), vec![0.0, 0.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_failing_model() {
        let model = FailingModel::new(3);
        let input = Array4::<f32>::zeros((1, 224, 224, 3));
        assert!(matches!(
            model.predict(input.view()),
            Err(DiagnosisError::Inference { .. })
        ));
    }

    #[test]
    fn test_channel_means() {
        let mut input = Array4::<f32>::zeros((1, 4, 4, 3));
        input.slice_mut(s![.., .., .., 1]).fill(1.0);
        assert_eq!(channel_means(input.view()), [0.0, 1.0, 0.0]);
    }
}
