use std::time::Instant;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, info, warn};

use crate::{
    decoder::{ImageDecoder, ImageSource},
    errors::{DiagnosisError, Result},
    knowledge::{Coverage, DiseaseKnowledgeBase},
    registry::{ClassId, ClassIndexRegistry},
    traits::ClassifierModel,
};

/// Diagnosis for one submitted image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub class_id: ClassId,
    pub display_name: String,
    pub description: String,
    pub treatment: String,
    /// Score of the chosen class, in `[0, 1]`.
    pub confidence: f32,
    /// `false` when the text comes from the knowledge base fallback record.
    pub recognized: bool,
}

/// Decode → infer → argmax → resolve → look up.
///
/// Every collaborator is constructed by the caller and handed in; the service
/// only reads them, so one instance can serve any number of threads.
pub struct InferenceService<M: ClassifierModel> {
    decoder: ImageDecoder,
    model: M,
    registry: ClassIndexRegistry,
    knowledge: DiseaseKnowledgeBase,
    coverage: Coverage,
}

impl<M: ClassifierModel> InferenceService<M> {
    pub fn new(
        model: M,
        registry: ClassIndexRegistry,
        knowledge: DiseaseKnowledgeBase,
    ) -> Result<Self> {
        let decoder = ImageDecoder::for_model(&model);
        Self::with_decoder(decoder, model, registry, knowledge)
    }

    pub fn with_decoder(
        decoder: ImageDecoder,
        model: M,
        registry: ClassIndexRegistry,
        knowledge: DiseaseKnowledgeBase,
    ) -> Result<Self> {
        if model.num_classes() != registry.len() {
            return Err(DiagnosisError::load(
                "class index registry",
                format!(
                    "registry has {} classes but the classifier outputs {}",
                    registry.len(),
                    model.num_classes()
                ),
            ));
        }
        if decoder.size() != model.input_size() || decoder.layout() != model.layout() {
            return Err(DiagnosisError::Configuration {
                message: format!(
                    "decoder produces {0}x{0} {1:?} tensors, classifier expects {2}x{2} {3:?}",
                    decoder.size(),
                    decoder.layout(),
                    model.input_size(),
                    model.layout()
                ),
            });
        }

        let coverage = knowledge.coverage(&registry);
        if !coverage.missing.is_empty() {
            warn!(
                missing = coverage.missing.len(),
                classes = registry.len(),
                "knowledge base has no entry for some classes; they will use the fallback record"
            );
            for id in &coverage.missing {
                warn!(class_id = %id, "no knowledge base entry");
            }
        }
        if !coverage.unused.is_empty() {
            debug!(unused = ?coverage.unused, "knowledge base entries unreachable from the registry");
        }
        info!(
            classes = registry.len(),
            covered = registry.len() - coverage.missing.len(),
            input_size = model.input_size(),
            "inference service ready"
        );

        Ok(Self {
            decoder,
            model,
            registry,
            knowledge,
            coverage,
        })
    }

    /// Fails if any registry class would be answered by the fallback record.
    pub fn require_complete_coverage(&self) -> Result<()> {
        if self.coverage.is_complete() {
            return Ok(());
        }
        let missing: Vec<&str> = self.coverage.missing.iter().map(ClassId::as_str).collect();
        Err(DiagnosisError::load(
            "knowledge base",
            format!("no entry for {} classes: {}", missing.len(), missing.join(", ")),
        ))
    }

    pub fn classify<'a>(&self, source: impl Into<ImageSource<'a>>) -> Result<PredictionResult> {
        self.run(source.into(), None)
    }

    /// Like [`classify`](Self::classify), but returns `DeadlineExceeded` once
    /// `deadline` has passed instead of waiting for the model.
    pub fn classify_within<'a>(
        &self,
        source: impl Into<ImageSource<'a>>,
        deadline: Instant,
    ) -> Result<PredictionResult> {
        self.run(source.into(), Some(deadline))
    }

    fn run(&self, source: ImageSource<'_>, deadline: Option<Instant>) -> Result<PredictionResult> {
        let span = debug_span!("classify");
        let _entered = span.enter();

        let start = Instant::now();
        let image = self.decoder.decode(source)?;

        let scores = match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                return Err(DiagnosisError::DeadlineExceeded {
                    elapsed: start.elapsed(),
                })
            }
            Some(deadline) => self.model.predict_within(image.view(), deadline)?,
            None => self.model.predict(image.view())?,
        };
        drop(image);

        if scores.len() != self.registry.len() {
            return Err(DiagnosisError::inference(
                "output validation",
                format!(
                    "classifier returned {} scores for {} classes",
                    scores.len(),
                    self.registry.len()
                ),
            ));
        }
        if let Some(index) = scores.iter().position(|v| !v.is_finite()) {
            return Err(DiagnosisError::inference(
                "output validation",
                format!("score {index} is not finite"),
            ));
        }
        let (index, score) = argmax(scores.view())
            .ok_or_else(|| DiagnosisError::inference("argmax", "classifier returned no scores"))?;

        let class_id = self.registry.resolve(index);
        let matched = self.knowledge.lookup(class_id);
        let recognized = !matched.is_fallback();
        let record = matched.into_record();
        let confidence = score.clamp(0.0, 1.0);

        debug!(
            %class_id,
            confidence,
            recognized,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "image classified"
        );

        Ok(PredictionResult {
            class_id: class_id.clone(),
            display_name: record.display_name,
            description: record.description,
            treatment: record.treatment,
            confidence,
            recognized,
        })
    }

    pub fn decoder(&self) -> &ImageDecoder {
        &self.decoder
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn registry(&self) -> &ClassIndexRegistry {
        &self.registry
    }

    pub fn knowledge(&self) -> &DiseaseKnowledgeBase {
        &self.knowledge
    }

    pub fn coverage(&self) -> &Coverage {
        &self.coverage
    }
}

/// Index and value of the largest score. Ties go to the lowest index.
pub fn argmax(scores: ArrayView1<f32>) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (index, score)| match best {
            Some((_, top)) if score <= top => best,
            _ => Some((index, score)),
        })
}
