use std::time::Instant;

use ndarray::prelude::*;

use crate::errors::Result;

/// Memory layout of the 4-D image tensor a classifier consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
    /// `[batch, height, width, channels]`, the Keras default.
    #[default]
    Nhwc,
    /// `[batch, channels, height, width]`.
    Nchw,
}

impl TensorLayout {
    /// Shape of a single-image batch of `size × size` RGB pixels.
    pub const fn batch_shape(self, size: usize) -> [usize; 4] {
        match self {
            Self::Nhwc => [1, size, size, 3],
            Self::Nchw => [1, 3, size, size],
        }
    }
}

/// Abstraction over the pretrained classifier.
///
/// Implementations are loaded once and then only read, so they must be safe to
/// call from many threads at the same time.
pub trait ClassifierModel: Send + Sync {
    /// Scores for one image, one entry per known class.
    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array1<f32>>;

    /// Like [`predict`](Self::predict), but gives up with
    /// `DeadlineExceeded` instead of waiting for capacity past `deadline`.
    fn predict_within(&self, tensor: ArrayView4<f32>, _deadline: Instant) -> Result<Array1<f32>> {
        self.predict(tensor)
    }

    /// Width of the output vector.
    fn num_classes(&self) -> usize;

    /// Side length of the square input image.
    fn input_size(&self) -> u32;

    fn layout(&self) -> TensorLayout;
}

impl<M: ClassifierModel + ?Sized> ClassifierModel for std::sync::Arc<M> {
    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array1<f32>> {
        (**self).predict(tensor)
    }

    fn predict_within(&self, tensor: ArrayView4<f32>, deadline: Instant) -> Result<Array1<f32>> {
        (**self).predict_within(tensor, deadline)
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn input_size(&self) -> u32 {
        (**self).input_size()
    }

    fn layout(&self) -> TensorLayout {
        (**self).layout()
    }
}
