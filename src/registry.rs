use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{DiagnosisError, Result};

/// Registry bundled for the 38-class PlantVillage label set.
pub const BUNDLED_CLASS_INDICES: &str = include_str!("../assets/class_indices.json");

/// Stable identifier of one crop/disease category, e.g. `Tomato___Late_blight`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(String);

impl ClassId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Readable form of the identifier: `Corn_(maize)___Common_rust_` becomes
    /// `Corn (maize) - Common rust`.
    pub fn humanize(&self) -> String {
        self.0.replace("___", " - ").replace('_', " ").trim().to_string()
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Bidirectional mapping between classifier output index and [`ClassId`].
///
/// Indices always form the contiguous range `0..len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIndexRegistry {
    ids: Vec<ClassId>,
    by_id: HashMap<ClassId, usize>,
}

impl ClassIndexRegistry {
    /// Builds a registry where `ids[i]` is the class at output index `i`.
    pub fn from_ids<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<ClassId> = ids.into_iter().map(ClassId::new).collect();
        if ids.is_empty() {
            return Err(DiagnosisError::load("class index registry", "mapping is empty"));
        }

        let mut by_id = HashMap::with_capacity(ids.len());
        for (index, id) in ids.iter().enumerate() {
            if id.as_str().trim().is_empty() {
                return Err(DiagnosisError::load(
                    "class index registry",
                    format!("index {index} has an empty identifier"),
                ));
            }
            if let Some(previous) = by_id.insert(id.clone(), index) {
                return Err(DiagnosisError::load(
                    "class index registry",
                    format!("identifier {id} is used by both index {previous} and {index}"),
                ));
            }
        }

        Ok(Self { ids, by_id })
    }

    /// Parses the JSON artifact: an object keyed by string-encoded indices.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: HashMap<String, String> =
            serde_json::from_str(json).map_err(|e| DiagnosisError::Load {
                artifact: "class index registry".to_string(),
                reason: e.to_string(),
                source: Some(Box::new(e)),
            })?;

        let mut indexed = BTreeMap::new();
        for (key, id) in raw {
            let index: usize = key.trim().parse().map_err(|_| {
                DiagnosisError::load(
                    "class index registry",
                    format!("key {key:?} is not a non-negative integer"),
                )
            })?;
            if indexed.insert(index, id).is_some() {
                return Err(DiagnosisError::load(
                    "class index registry",
                    format!("index {index} appears more than once"),
                ));
            }
        }

        // Distinct keys all below len() cover 0..len() exactly.
        if let Some(stray) = indexed.keys().find(|&&index| index >= indexed.len()) {
            return Err(DiagnosisError::load(
                "class index registry",
                format!(
                    "indices must be contiguous from 0 to {}, found {stray}",
                    indexed.len().saturating_sub(1)
                ),
            ));
        }

        Self::from_ids(indexed.into_values())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| DiagnosisError::FileSystem {
            path: path.to_path_buf(),
            operation: "reading class index registry".to_string(),
            source: e,
        })?;
        let registry = Self::from_json(&json)?;
        info!(path = %path.display(), classes = registry.len(), "class index registry loaded");
        Ok(registry)
    }

    pub fn bundled() -> Result<Self> {
        Self::from_json(BUNDLED_CLASS_INDICES)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ClassId> {
        self.ids.get(index)
    }

    /// Class at `index`.
    ///
    /// # Panics
    ///
    /// If `index >= len()`. That means the classifier and registry artifacts
    /// do not belong together, which `InferenceService::new` rules out.
    pub fn resolve(&self, index: usize) -> &ClassId {
        match self.ids.get(index) {
            Some(id) => id,
            None => panic!(
                "class index {index} out of range for registry of {} classes",
                self.ids.len()
            ),
        }
    }

    pub fn index_of(&self, id: &ClassId) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn contains(&self, id: &ClassId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ClassId)> {
        self.ids.iter().enumerate()
    }
}
