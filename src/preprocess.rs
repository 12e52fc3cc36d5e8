//! Image preprocessing: decoding, resizing and the per-family channel
//! normalization each supported network was trained with.

use std::fmt;
use std::str::FromStr;

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;

use crate::error::ClassifyError;

/// Spatial side length every supported model expects.
pub const INPUT_SIZE: u32 = 224;

const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// The supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Resnet50,
    Densenet169,
    MobilenetV2,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::Resnet50,
        ModelKind::Densenet169,
        ModelKind::MobilenetV2,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            ModelKind::Resnet50 => "resnet50",
            ModelKind::Densenet169 => "densenet169",
            ModelKind::MobilenetV2 => "mobilenet_v2",
        }
    }

    pub fn artifact_file(&self) -> String {
        format!("{}_model.onnx", self.id())
    }

    pub fn normalization(&self) -> Normalization {
        match self {
            ModelKind::Resnet50 => Normalization::Caffe,
            ModelKind::Densenet169 => Normalization::Torch,
            ModelKind::MobilenetV2 => Normalization::Tf,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            ModelKind::Resnet50 => 0,
            ModelKind::Densenet169 => 1,
            ModelKind::MobilenetV2 => 2,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownModel(pub String);

impl fmt::Display for UnknownModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown model `{}`", self.0)
    }
}

impl std::error::Error for UnknownModel {}

impl FromStr for ModelKind {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.id() == s)
            .ok_or_else(|| UnknownModel(s.to_string()))
    }
}

/// Channel scaling conventions, applied to pixel values in `0..=255`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// BGR channel order, mean-centred, unscaled.
    Caffe,
    /// Scaled to `[0, 1]`, then standardized with ImageNet statistics.
    Torch,
    /// Scaled to `[-1, 1]`.
    Tf,
}

impl Normalization {
    /// Maps one RGB pixel to the three values fed to the network, in the
    /// channel order the network expects.
    pub fn apply(&self, [r, g, b]: [u8; 3]) -> [f32; 3] {
        let (r, g, b) = (r as f32, g as f32, b as f32);
        match self {
            Normalization::Caffe => [
                b - CAFFE_MEAN_BGR[0],
                g - CAFFE_MEAN_BGR[1],
                r - CAFFE_MEAN_BGR[2],
            ],
            Normalization::Torch => [
                (r / 255.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0],
                (g / 255.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1],
                (b / 255.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2],
            ],
            Normalization::Tf => [r / 127.5 - 1.0, g / 127.5 - 1.0, b / 127.5 - 1.0],
        }
    }
}

/// Memory layout of the batched input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, as exported from Keras.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`.
    Nchw,
}

impl TensorLayout {
    pub fn shape(&self) -> [usize; 4] {
        let side = INPUT_SIZE as usize;
        match self {
            TensorLayout::Nhwc => [1, side, side, 3],
            TensorLayout::Nchw => [1, 3, side, side],
        }
    }
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nhwc" => Ok(TensorLayout::Nhwc),
            "nchw" => Ok(TensorLayout::Nchw),
            other => Err(format!("expected `nhwc` or `nchw`, got `{other}`")),
        }
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ClassifyError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Resizes to `INPUT_SIZE` square and builds the batch-of-one tensor for `kind`.
pub fn to_tensor(image: &RgbImage, kind: ModelKind, layout: TensorLayout) -> Array4<f32> {
    let resized = if image.dimensions() == (INPUT_SIZE, INPUT_SIZE) {
        image.clone()
    } else {
        image::imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom)
    };

    let normalization = kind.normalization();
    let mut tensor = Array4::<f32>::zeros(layout.shape());

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let values = normalization.apply(pixel.0);
        for (c, value) in values.into_iter().enumerate() {
            match layout {
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
            }
        }
    }

    tensor
}
