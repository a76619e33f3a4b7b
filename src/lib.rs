pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod errors;
pub mod knowledge;
pub mod model;
pub mod policy;
pub mod registry;
pub mod semaphore;
pub mod service;
pub mod traits;

pub mod mocks;

pub use config::{Config, OutputFormat};
pub use decoder::{ImageDecoder, ImageSource, InputImage};
pub use dispatcher::Dispatcher;
pub use errors::{DiagnosisError, ErrorKind, Result};
pub use knowledge::{DiseaseKnowledgeBase, DiseaseRecord, FallbackText, RecordMatch};
pub use model::{ModelOptions, OnnxClassifier, OutputActivation};
pub use policy::UploadPolicy;
pub use registry::{ClassId, ClassIndexRegistry};
pub use service::{argmax, InferenceService, PredictionResult};
pub use traits::*;

impl InferenceService<OnnxClassifier> {
    /// Loads every artifact named by `config` and wires up the service.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = match &config.class_indices {
            Some(path) => ClassIndexRegistry::from_path(path)?,
            None => ClassIndexRegistry::bundled()?,
        };
        let knowledge = match &config.knowledge_base {
            Some(path) => DiseaseKnowledgeBase::from_path(path)?,
            None => DiseaseKnowledgeBase::bundled()?,
        };
        let model = OnnxClassifier::new(&config.model_path, &config.model_options())?;
        let decoder = ImageDecoder::for_model(&model)
            .with_filter(config.filter)
            .with_max_dimension(config.max_dimension);

        let service = Self::with_decoder(decoder, model, registry, knowledge)?;
        if config.require_complete_knowledge_base {
            service.require_complete_coverage()?;
        }
        Ok(service)
    }
}
