use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    errors::{DiagnosisError, Result},
    registry::{ClassId, ClassIndexRegistry},
};

/// English knowledge base covering every class of the bundled registry.
pub const BUNDLED_KNOWLEDGE_BASE: &str = include_str!("../assets/knowledge_base.json");

const DEFAULT_FALLBACK_DESCRIPTION: &str =
    "This leaf condition was recognized by the system, but no detailed information is available for it yet.";
const DEFAULT_FALLBACK_TREATMENT: &str =
    "Please consult an agricultural expert for specific treatment guidance.";

/// Human-readable diagnostic text for one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiseaseRecord {
    #[serde(alias = "name")]
    pub display_name: String,
    pub description: String,
    pub treatment: String,
}

/// Generic advice used to build the record for classes without an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackText {
    pub description: String,
    pub treatment: String,
}

impl Default for FallbackText {
    fn default() -> Self {
        Self {
            description: DEFAULT_FALLBACK_DESCRIPTION.to_string(),
            treatment: DEFAULT_FALLBACK_TREATMENT.to_string(),
        }
    }
}

/// Outcome of a knowledge base lookup. A miss is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordMatch<'a> {
    Known(&'a DiseaseRecord),
    Fallback(DiseaseRecord),
}

impl RecordMatch<'_> {
    pub fn record(&self) -> &DiseaseRecord {
        match self {
            Self::Known(record) => record,
            Self::Fallback(record) => record,
        }
    }

    pub const fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }

    pub fn into_record(self) -> DiseaseRecord {
        match self {
            Self::Known(record) => record.clone(),
            Self::Fallback(record) => record,
        }
    }
}

/// How well a knowledge base covers a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    /// Registry classes answered by the fallback record.
    pub missing: Vec<ClassId>,
    /// Entries no registry class can reach.
    pub unused: Vec<ClassId>,
}

impl Coverage {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Deserialize)]
struct KnowledgeBaseFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    fallback: FallbackText,
    records: HashMap<ClassId, DiseaseRecord>,
}

/// Static mapping from [`ClassId`] to [`DiseaseRecord`] with a defined fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiseaseKnowledgeBase {
    version: Option<String>,
    records: HashMap<ClassId, DiseaseRecord>,
    fallback: FallbackText,
}

impl DiseaseKnowledgeBase {
    pub fn new(
        records: impl IntoIterator<Item = (ClassId, DiseaseRecord)>,
        fallback: FallbackText,
    ) -> Result<Self> {
        let knowledge = Self {
            version: None,
            records: records.into_iter().collect(),
            fallback,
        };
        knowledge.validate()?;
        Ok(knowledge)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: KnowledgeBaseFile =
            serde_json::from_str(json).map_err(|e| DiagnosisError::Load {
                artifact: "knowledge base".to_string(),
                reason: e.to_string(),
                source: Some(Box::new(e)),
            })?;
        let knowledge = Self {
            version: file.version,
            records: file.records,
            fallback: file.fallback,
        };
        knowledge.validate()?;
        Ok(knowledge)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| DiagnosisError::FileSystem {
            path: path.to_path_buf(),
            operation: "reading knowledge base".to_string(),
            source: e,
        })?;
        let knowledge = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            version = knowledge.version().unwrap_or("unversioned"),
            records = knowledge.len(),
            "knowledge base loaded"
        );
        Ok(knowledge)
    }

    pub fn bundled() -> Result<Self> {
        Self::from_json(BUNDLED_KNOWLEDGE_BASE)
    }

    fn validate(&self) -> Result<()> {
        if self.fallback.description.trim().is_empty() || self.fallback.treatment.trim().is_empty()
        {
            return Err(DiagnosisError::load(
                "knowledge base",
                "fallback description and treatment must not be empty",
            ));
        }
        if let Some(id) = self
            .records
            .iter()
            .find(|(_, record)| record.display_name.trim().is_empty())
            .map(|(id, _)| id)
        {
            return Err(DiagnosisError::load(
                "knowledge base",
                format!("record {id} has an empty display name"),
            ));
        }
        Ok(())
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &ClassId) -> bool {
        self.records.contains_key(id)
    }

    pub fn fallback_text(&self) -> &FallbackText {
        &self.fallback
    }

    pub fn lookup(&self, id: &ClassId) -> RecordMatch<'_> {
        match self.records.get(id) {
            Some(record) => RecordMatch::Known(record),
            None => RecordMatch::Fallback(self.fallback_for(id)),
        }
    }

    /// Record used when `id` has no entry: a readable name derived from the
    /// identifier plus the generic fallback advice.
    pub fn fallback_for(&self, id: &ClassId) -> DiseaseRecord {
        let display_name = match id.humanize() {
            name if name.is_empty() => id.as_str().to_string(),
            name => name,
        };
        DiseaseRecord {
            display_name,
            description: self.fallback.description.clone(),
            treatment: self.fallback.treatment.clone(),
        }
    }

    pub fn coverage(&self, registry: &ClassIndexRegistry) -> Coverage {
        let missing = registry
            .iter()
            .map(|(_, id)| id)
            .filter(|id| !self.records.contains_key(*id))
            .cloned()
            .collect();
        let mut unused: Vec<ClassId> = self
            .records
            .keys()
            .filter(|id| !registry.contains(id))
            .cloned()
            .collect();
        unused.sort();
        Coverage { missing, unused }
    }

    /// Copy of this knowledge base without the entry for `id`.
    pub fn without(&self, id: &ClassId) -> Self {
        let mut knowledge = self.clone();
        knowledge.records.remove(id);
        knowledge
    }
}
