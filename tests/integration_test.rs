use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::ArrayView4;
use std::fs;
use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

use leaf_diagnosis::mocks::{channel_means, FixedScoresModel, FnModel};
use leaf_diagnosis::{
    ClassId, ClassIndexRegistry, DiagnosisError, DiseaseKnowledgeBase, ErrorKind, FallbackText,
    InferenceService, Result,
};

const TOMATO_HEALTHY: usize = 37;
const TOMATO_LATE_BLIGHT: usize = 30;

fn encode(image: RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), format)
        .unwrap();
    bytes
}

/// A healthy-looking leaf: uniform green with a slightly darker vein.
fn green_leaf_jpeg() -> Vec<u8> {
    let image = RgbImage::from_fn(96, 128, |x, _| {
        if x == 48 {
            Rgb([20, 110, 30])
        } else {
            Rgb([40, 170, 50])
        }
    });
    encode(image, ImageFormat::Jpeg)
}

fn brown_leaf_png() -> Vec<u8> {
    encode(RgbImage::from_pixel(64, 64, Rgb([120, 80, 40])), ImageFormat::Png)
}

fn one_hot(num_classes: usize, index: usize) -> Vec<f32> {
    let mut scores = vec![0.0; num_classes];
    scores[index] = 1.0;
    scores
}

/// Rule-based stand-in for the trained network: mostly green means healthy
/// tomato, anything else late blight.
fn color_rule_model() -> FnModel<impl Fn(ArrayView4<f32>) -> Vec<f32> + Send + Sync> {
    FnModel::new(38, |tensor| {
        let [r, g, b] = channel_means(tensor);
        if g > r && g > b {
            one_hot(38, TOMATO_HEALTHY)
        } else {
            let mut scores = vec![0.01; 38];
            scores[TOMATO_LATE_BLIGHT] = 0.63;
            scores
        }
    })
}

fn bundled_service<M: leaf_diagnosis::ClassifierModel>(model: M) -> Result<InferenceService<M>> {
    InferenceService::new(
        model,
        ClassIndexRegistry::bundled()?,
        DiseaseKnowledgeBase::bundled()?,
    )
}

#[test]
fn test_green_leaf_is_healthy_tomato() -> Result<()> {
    let service = bundled_service(color_rule_model())?;
    let result = service.classify(&green_leaf_jpeg())?;

    assert_eq!(result.class_id, ClassId::from("Tomato___healthy"));
    assert!(result.display_name.contains("Healthy"));
    assert!(!result.description.is_empty());
    assert!(!result.treatment.is_empty());
    assert_eq!(result.confidence, 1.0);
    assert!(result.recognized);
    Ok(())
}

#[test]
fn test_brown_leaf_is_late_blight() -> Result<()> {
    let service = bundled_service(color_rule_model())?;
    let result = service.classify(&brown_leaf_png())?;

    assert_eq!(result.class_id, ClassId::from("Tomato___Late_blight"));
    assert!((result.confidence - 0.63).abs() < 1e-6);
    assert!(result.recognized);
    Ok(())
}

#[test]
fn test_truncated_jpeg_is_a_decode_error() -> Result<()> {
    let service = bundled_service(color_rule_model())?;
    let bytes = green_leaf_jpeg();

    let err = service.classify(&bytes[..12]).unwrap_err();
    assert!(matches!(err, DiagnosisError::Decode { .. }));
    assert_eq!(err.kind(), ErrorKind::ClientInput);
    Ok(())
}

#[test]
fn test_missing_entry_yields_fallback_text() -> Result<()> {
    let knowledge = DiseaseKnowledgeBase::bundled()?.without(&ClassId::from("Tomato___healthy"));
    let service =
        InferenceService::new(color_rule_model(), ClassIndexRegistry::bundled()?, knowledge)?;

    let result = service.classify(&green_leaf_jpeg())?;
    let fallback = FallbackText::default();

    assert_eq!(result.class_id, ClassId::from("Tomato___healthy"));
    assert_eq!(result.display_name, "Tomato - healthy");
    assert_eq!(result.description, fallback.description);
    assert_eq!(result.treatment, fallback.treatment);
    assert!(!result.recognized);
    Ok(())
}

#[test]
fn test_every_class_produces_a_complete_result() -> Result<()> {
    let registry = ClassIndexRegistry::bundled()?;
    let empty = DiseaseKnowledgeBase::from_json(r#"{"records": {}}"#)?;
    let image = brown_leaf_png();

    for index in 0..registry.len() {
        for knowledge in [DiseaseKnowledgeBase::bundled()?, empty.clone()] {
            let service = InferenceService::new(
                FixedScoresModel::one_hot(registry.len(), index),
                registry.clone(),
                knowledge,
            )?;
            let result = service.classify(&image)?;

            assert_eq!(&result.class_id, registry.resolve(index));
            assert!(!result.display_name.is_empty(), "{index}");
            assert!(!result.description.is_empty(), "{index}");
            assert!(!result.treatment.is_empty(), "{index}");
            assert!((0.0..=1.0).contains(&result.confidence));
        }
    }
    Ok(())
}

#[test]
fn test_same_bytes_same_result() -> Result<()> {
    let service = bundled_service(color_rule_model())?;
    let bytes = green_leaf_jpeg();

    let first = service.classify(&bytes)?;
    for _ in 0..5 {
        assert_eq!(service.classify(&bytes)?, first);
    }
    Ok(())
}

#[test]
fn test_ties_resolve_to_lowest_index() -> Result<()> {
    let mut scores = vec![0.0; 38];
    scores[12] = 0.5;
    scores[3] = 0.5;
    let service = bundled_service(FixedScoresModel::new(scores))?;

    for _ in 0..3 {
        let result = service.classify(&brown_leaf_png())?;
        assert_eq!(result.class_id, ClassId::from("Apple___healthy"));
    }
    Ok(())
}

#[test]
fn test_concurrent_callers_share_one_service() -> Result<()> {
    let service = Arc::new(bundled_service(color_rule_model())?);
    let green = Arc::new(green_leaf_jpeg());
    let brown = Arc::new(brown_leaf_png());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = Arc::clone(&service);
            let bytes = if i % 2 == 0 {
                Arc::clone(&green)
            } else {
                Arc::clone(&brown)
            };
            thread::spawn(move || {
                (0..4)
                    .map(|_| service.classify(bytes.as_slice()).map(|r| r.class_id))
                    .collect::<Result<Vec<_>>>()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let expected = if i % 2 == 0 {
            "Tomato___healthy"
        } else {
            "Tomato___Late_blight"
        };
        for class_id in handle.join().unwrap()? {
            assert_eq!(class_id.as_str(), expected);
        }
    }
    Ok(())
}

#[test]
fn test_artifacts_from_files() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let indices = temp_dir.path().join("class_indices.json");
    let knowledge = temp_dir.path().join("knowledge_base.json");
    let image = temp_dir.path().join("leaf.png");

    fs::write(&indices, r#"{"1": "Grape___healthy", "0": "Grape___Black_rot"}"#)?;
    fs::write(
        &knowledge,
        r#"{"version": "test", "records": {
            "Grape___healthy": {"name": "Healthy Grape", "description": "d", "treatment": "t"}
        }}"#,
    )?;
    fs::write(&image, brown_leaf_png())?;

    let service = InferenceService::new(
        FixedScoresModel::new(vec![0.2, 0.8]),
        ClassIndexRegistry::from_path(&indices)?,
        DiseaseKnowledgeBase::from_path(&knowledge)?,
    )?;
    assert_eq!(service.knowledge().version(), Some("test"));
    assert_eq!(service.coverage().missing, vec![ClassId::from("Grape___Black_rot")]);

    let result = service.classify(image.as_path())?;
    assert_eq!(result.display_name, "Healthy Grape");
    assert_eq!(result.confidence, 0.8);
    Ok(())
}

#[test]
fn test_missing_artifact_is_a_startup_error() {
    let temp_dir = TempDir::new().unwrap();
    let err = ClassIndexRegistry::from_path(&temp_dir.path().join("absent.json")).unwrap_err();

    assert!(matches!(err, DiagnosisError::FileSystem { .. }));
    assert_eq!(err.kind(), ErrorKind::Startup);
}

#[test]
fn test_result_serializes_to_json() -> Result<()> {
    let service = bundled_service(color_rule_model())?;
    let result = service.classify(&green_leaf_jpeg())?;

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["class_id"], "Tomato___healthy");
    assert_eq!(json["recognized"], true);
    assert!(json.get("class_name").is_none());
    assert!(json["display_name"].as_str().unwrap().contains("Healthy"));
    Ok(())
}
