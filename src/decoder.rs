use std::io::{BufRead, Cursor, Seek};
use std::path::Path;

use image::{imageops, imageops::FilterType, DynamicImage, ImageReader, Limits, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::{
    errors::{DiagnosisError, Result},
    traits::{ClassifierModel, TensorLayout},
};

/// Where the bytes of a submitted image come from.
#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    Bytes(&'a [u8]),
    Path(&'a Path),
}

impl<'a> From<&'a [u8]> for ImageSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Self::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for ImageSource<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        Self::Bytes(bytes.as_slice())
    }
}

impl<'a> From<&'a Path> for ImageSource<'a> {
    fn from(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

/// A decoded image as a normalized `f32` tensor with a leading batch axis of 1.
///
/// Lives for a single classification call.
#[derive(Debug, Clone, PartialEq)]
pub struct InputImage {
    tensor: Array4<f32>,
    layout: TensorLayout,
}

impl InputImage {
    pub fn view(&self) -> ArrayView4<f32> {
        self.tensor.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    pub const fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn into_inner(self) -> Array4<f32> {
        self.tensor
    }
}

/// Turns raw image bytes into the fixed-size tensor the classifier expects.
///
/// The image is resized to `size × size` without cropping, converted to RGB and
/// scaled from `0..=255` to `0.0..=1.0`.
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    size: u32,
    layout: TensorLayout,
    filter: FilterType,
    max_dimension: u32,
}

impl ImageDecoder {
    pub const DEFAULT_SIZE: u32 = 224;
    pub const DEFAULT_MAX_DIMENSION: u32 = 8192;
    const MAX_ALLOC_BYTES: u64 = 512 * 1024 * 1024;

    pub const fn new(size: u32, layout: TensorLayout) -> Self {
        Self {
            size,
            layout,
            // Keras `load_img` resizes with nearest-neighbour by default.
            filter: FilterType::Nearest,
            max_dimension: Self::DEFAULT_MAX_DIMENSION,
        }
    }

    /// Decoder producing tensors shaped for `model`.
    pub fn for_model<M: ClassifierModel + ?Sized>(model: &M) -> Self {
        Self::new(model.input_size(), model.layout())
    }

    pub const fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    /// Largest accepted width or height of the source image.
    pub const fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub const fn size(&self) -> u32 {
        self.size
    }

    pub const fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn decode<'a>(&self, source: impl Into<ImageSource<'a>>) -> Result<InputImage> {
        let image = match source.into() {
            ImageSource::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Err(DiagnosisError::decode("image decoding", "empty input"));
                }
                self.read(ImageReader::new(Cursor::new(bytes)))?
            }
            ImageSource::Path(path) => {
                let reader = ImageReader::open(path).map_err(|e| DiagnosisError::Decode {
                    operation: format!("opening {}", path.display()),
                    source: Box::new(e),
                })?;
                self.read(reader)?
            }
        };

        self.to_tensor(&image)
    }

    fn read<R: BufRead + Seek>(&self, reader: ImageReader<R>) -> Result<DynamicImage> {
        let mut reader = reader
            .with_guessed_format()
            .map_err(|e| DiagnosisError::Decode {
                operation: "format detection".to_string(),
                source: Box::new(e),
            })?;
        if reader.format().is_none() {
            return Err(DiagnosisError::decode(
                "format detection",
                "unrecognized image format",
            ));
        }
        reader.limits(self.limits());

        let image = reader.decode()?;
        if image.width() == 0 || image.height() == 0 {
            return Err(DiagnosisError::decode(
                "image decoding",
                format!("image has zero size ({}x{})", image.width(), image.height()),
            ));
        }
        Ok(image)
    }

    fn limits(&self) -> Limits {
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        limits.max_alloc = Some(Self::MAX_ALLOC_BYTES);
        limits
    }

    fn to_tensor(&self, image: &DynamicImage) -> Result<InputImage> {
        let rgb: RgbImage = image.to_rgb8();
        let rgb = if rgb.dimensions() == (self.size, self.size) {
            rgb
        } else {
            imageops::resize(&rgb, self.size, self.size, self.filter)
        };
        if rgb.dimensions() != (self.size, self.size) {
            return Err(DiagnosisError::decode(
                "resize",
                format!(
                    "expected {0}x{0}, got {1}x{2}",
                    self.size,
                    rgb.width(),
                    rgb.height()
                ),
            ));
        }

        // (channels, height, width)
        let chw = rgb.as_ndarray3().mapv(|v| f32::from(v) / 255.0);
        let tensor = match self.layout {
            TensorLayout::Nchw => chw.insert_axis(Axis(0)),
            TensorLayout::Nhwc => chw
                .permuted_axes([1, 2, 0])
                .as_standard_layout()
                .into_owned()
                .insert_axis(Axis(0)),
        };

        let expected = self.layout.batch_shape(self.size as usize);
        if tensor.shape() != expected {
            return Err(DiagnosisError::decode(
                "tensor conversion",
                format!("expected shape {:?}, got {:?}", expected, tensor.shape()),
            ));
        }

        Ok(InputImage {
            tensor,
            layout: self.layout,
        })
    }
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SIZE, TensorLayout::Nhwc)
    }
}

/// Parses a resize filter name as accepted on the command line.
pub fn filter_from_name(name: &str) -> Option<FilterType> {
    match name.to_ascii_lowercase().as_str() {
        "nearest" => Some(FilterType::Nearest),
        "triangle" | "bilinear" => Some(FilterType::Triangle),
        "catmull-rom" | "catmullrom" | "bicubic" => Some(FilterType::CatmullRom),
        "gaussian" => Some(FilterType::Gaussian),
        "lanczos3" | "lanczos" => Some(FilterType::Lanczos3),
        _ => None,
    }
}
