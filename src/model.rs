use std::path::Path;
use std::time::Instant;

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    errors::{DiagnosisError, Result},
    semaphore::Semaphore,
    traits::{ClassifierModel, TensorLayout},
};

/// How raw model outputs become class probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputActivation {
    /// The graph already ends in a softmax; outputs are used as-is.
    #[default]
    Identity,
    /// The graph emits logits; a softmax is applied after each run.
    Softmax,
}

#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub input_size: u32,
    pub device_id: i32,
    /// Number of independent sessions serving requests in parallel.
    pub replicas: usize,
    /// Intra-op threads per session. 0 lets ONNX Runtime decide.
    pub intra_threads: usize,
    pub activation: OutputActivation,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            input_size: 224,
            device_id: 0,
            replicas: 1,
            intra_threads: 0,
            activation: OutputActivation::Identity,
        }
    }
}

/// Image classifier backed by ONNX Runtime.
///
/// A session needs exclusive access while it runs, so the model keeps a fixed
/// pool of sessions and a semaphore with one permit per session. Callers wait
/// for a permit, then lease the index of a free session.
pub struct OnnxClassifier {
    image_size: u32,
    layout: TensorLayout,
    num_classes: usize,
    activation: OutputActivation,
    input_name: String,
    output_name: String,
    sessions: Vec<Mutex<Session>>,
    free: FreeList,
    available: Semaphore,
}

/// Indices of sessions nobody is running.
struct FreeList {
    slots: Mutex<Vec<usize>>,
}

/// A leased session index, returned to the free list on drop.
struct Lease<'a> {
    index: usize,
    list: &'a FreeList,
}

impl FreeList {
    fn new(len: usize) -> Self {
        Self {
            slots: Mutex::new((0..len).rev().collect()),
        }
    }

    fn lease(&self) -> Option<Lease<'_>> {
        let index = self.slots.lock().pop()?;
        Some(Lease { index, list: self })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.list.slots.lock().push(self.index);
    }
}

impl OnnxClassifier {
    pub fn new(model_path: &Path, options: &ModelOptions) -> Result<Self> {
        if !model_path.is_file() {
            return Err(DiagnosisError::load(
                format!("model {}", model_path.display()),
                "file does not exist",
            ));
        }

        let replicas = options.replicas.max(1);
        let mut sessions = Vec::with_capacity(replicas);
        for _ in 0..replicas {
            sessions.push(build_session(model_path, options)?);
        }

        let input = sessions[0]
            .inputs
            .first()
            .ok_or_else(|| DiagnosisError::load("model inputs", "model declares no inputs"))?;
        let input_name = input.name.clone();
        let dims: Vec<i64> = input
            .input_type
            .tensor_shape()
            .ok_or_else(|| DiagnosisError::load("model inputs", "input is not a tensor"))?
            .iter()
            .copied()
            .collect();
        let (layout, image_size) = infer_input_layout(&dims, options.input_size)?;

        let output_name = sessions[0]
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| DiagnosisError::load("model outputs", "model declares no outputs"))?;

        // Warm up every replica; the first run also tells us the output width.
        let zeros = Array4::<f32>::zeros(layout.batch_shape(image_size as usize));
        let mut num_classes = None;
        for session in &mut sessions {
            let width = run_session(session, &input_name, &output_name, zeros.view())
                .map_err(|e| DiagnosisError::Load {
                    artifact: "model warm-up".to_string(),
                    reason: e.to_string(),
                    source: Some(Box::new(e)),
                })?
                .len();
            match num_classes {
                None => num_classes = Some(width),
                Some(n) if n != width => {
                    return Err(DiagnosisError::load(
                        "model warm-up",
                        format!("replicas disagree on output width ({n} vs {width})"),
                    ))
                }
                Some(_) => {}
            }
        }
        let num_classes = num_classes.unwrap_or_default();
        if num_classes == 0 {
            return Err(DiagnosisError::load("model warm-up", "model produced no scores"));
        }

        info!(
            model = %model_path.display(),
            replicas,
            num_classes,
            image_size,
            ?layout,
            "classifier loaded"
        );

        Ok(Self {
            image_size,
            layout,
            num_classes,
            activation: options.activation,
            input_name,
            output_name,
            available: Semaphore::new(sessions.len()),
            free: FreeList::new(sessions.len()),
            sessions: sessions.into_iter().map(Mutex::new).collect(),
        })
    }

    pub fn replicas(&self) -> usize {
        self.sessions.len()
    }

    fn run(&self, tensor: ArrayView4<f32>) -> Result<Array1<f32>> {
        let expected = self.layout.batch_shape(self.image_size as usize);
        if tensor.shape() != expected {
            return Err(DiagnosisError::inference(
                "input validation",
                format!("expected shape {:?}, got {:?}", expected, tensor.shape()),
            ));
        }

        // Holding a permit guarantees a free index.
        let lease = self.free.lease().ok_or_else(|| {
            DiagnosisError::inference("session checkout", "no free session for a held permit")
        })?;
        let raw = {
            let mut session = self.sessions[lease.index].lock();
            run_session(&mut session, &self.input_name, &self.output_name, tensor)?
        };
        drop(lease);
        if raw.len() != self.num_classes {
            return Err(DiagnosisError::inference(
                "output validation",
                format!("expected {} scores, got {}", self.num_classes, raw.len()),
            ));
        }
        scores_to_probabilities(raw, self.activation)
    }
}

impl ClassifierModel for OnnxClassifier {
    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array1<f32>> {
        let _permit = self.available.acquire();
        self.run(tensor)
    }

    fn predict_within(&self, tensor: ArrayView4<f32>, deadline: Instant) -> Result<Array1<f32>> {
        let start = Instant::now();
        let _permit = self.available.acquire_until(deadline).ok_or_else(|| {
            debug!("no classifier replica became free before the deadline");
            DiagnosisError::DeadlineExceeded {
                elapsed: start.elapsed(),
            }
        })?;
        self.run(tensor)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn layout(&self) -> TensorLayout {
        self.layout
    }
}

fn build_session(model_path: &Path, options: &ModelOptions) -> Result<Session> {
    let load_error = |operation: &str, e: ort::Error| DiagnosisError::Load {
        artifact: format!("model {}", model_path.display()),
        reason: operation.to_string(),
        source: Some(Box::new(e)),
    };

    let mut builder = SessionBuilder::new()
        .map_err(|e| load_error("session builder initialization", e))?
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_device_id(options.device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(options.device_id)
                .build(),
        ])
        .map_err(|e| load_error("execution provider registration", e))?
        .with_memory_pattern(true)
        .map_err(|e| load_error("memory pattern setup", e))?;
    if options.intra_threads > 0 {
        builder = builder
            .with_intra_threads(options.intra_threads)
            .map_err(|e| load_error("intra-op thread setup", e))?;
    }

    builder
        .commit_from_file(model_path)
        .map_err(|e| load_error("model file loading", e))
}

fn run_session(
    session: &mut Session,
    input_name: &str,
    output_name: &str,
    tensor: ArrayView4<f32>,
) -> Result<Vec<f32>> {
    let outputs = session
        .run(ort::inputs![input_name => TensorRef::from_array_view(&tensor.as_standard_layout())?])?;
    let scores = outputs[output_name].try_extract_array::<f32>()?;
    Ok(scores.iter().copied().collect())
}

/// Works out the tensor layout and square input size from a declared input
/// shape. Dynamic dimensions (`-1`) fall back to `configured_size`.
pub fn infer_input_layout(dims: &[i64], configured_size: u32) -> Result<(TensorLayout, u32)> {
    let [_, d1, d2, d3] = dims else {
        return Err(DiagnosisError::load(
            "model inputs",
            format!("expected a rank-4 image input, got shape {dims:?}"),
        ));
    };

    let (layout, height, width) = match (*d1, *d3) {
        (_, 3) => (TensorLayout::Nhwc, *d1, *d2),
        (3, _) => (TensorLayout::Nchw, *d2, *d3),
        _ => {
            return Err(DiagnosisError::load(
                "model inputs",
                format!("cannot find a 3-channel axis in input shape {dims:?}"),
            ))
        }
    };

    let size = match (height, width) {
        (h, w) if h > 0 && w > 0 && h != w => {
            return Err(DiagnosisError::load(
                "model inputs",
                format!("non-square input {h}x{w} is not supported"),
            ))
        }
        (h, _) if h > 0 => h as u32,
        (_, w) if w > 0 => w as u32,
        _ => configured_size,
    };
    if size != configured_size {
        return Err(DiagnosisError::load(
            "model inputs",
            format!("model expects {size}x{size} images, configured for {configured_size}x{configured_size}"),
        ));
    }

    Ok((layout, size))
}

/// Validates raw scores and applies the configured activation.
pub fn scores_to_probabilities(raw: Vec<f32>, activation: OutputActivation) -> Result<Array1<f32>> {
    if raw.is_empty() {
        return Err(DiagnosisError::inference(
            "output validation",
            "model returned no scores",
        ));
    }
    if let Some(index) = raw.iter().position(|v| !v.is_finite()) {
        return Err(DiagnosisError::inference(
            "output validation",
            format!("score {index} is not finite"),
        ));
    }

    let scores = Array1::from(raw);
    Ok(match activation {
        OutputActivation::Identity => scores,
        OutputActivation::Softmax => {
            let max = scores.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            let exp = scores.mapv(|v| (v - max).exp());
            let sum = exp.sum();
            exp / sum
        }
    })
}
