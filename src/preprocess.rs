//! Image preprocessing for the CRNN recognizer.
//!
//! The transform must match the one the model was trained with, step for
//! step: grayscale, top-left crop of oversized images, bilinear resize to
//! the model input size, then normalization to `[-1, 1]`.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use ndarray::Array4;
use tracing::debug;

use crate::config::PreprocessConfig;
use crate::error::PreprocessError;

/// Input tensor plus what happened to the image on the way there.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// `[1, 1, target_height, target_width]`, values in `[-1, 1]`.
    pub tensor: Array4<f32>,
    pub report: PreprocessReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessReport {
    pub original_width: u32,
    pub original_height: u32,
    pub cropped: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Decode an uploaded image and turn it into a model input tensor.
    pub fn process_bytes(&self, bytes: &[u8]) -> Result<Preprocessed, PreprocessError> {
        if bytes.is_empty() {
            return Err(PreprocessError::Empty);
        }
        let img = image::load_from_memory(bytes)?;
        self.process(&img)
    }

    pub fn process(&self, img: &DynamicImage) -> Result<Preprocessed, PreprocessError> {
        let (width, height) = (img.width(), img.height());
        if width == 0 || height == 0 {
            return Err(PreprocessError::ZeroSized { width, height });
        }

        let gray = to_grayscale(img);
        let (gray, cropped) = self.crop(gray);

        debug!(
            cropped = cropped,
            original_width = width,
            original_height = height,
            "Preprocessing captcha image"
        );

        let resized = imageops::resize(
            &gray,
            self.config.target_width,
            self.config.target_height,
            FilterType::Triangle,
        );

        let data: Vec<f32> = resized
            .pixels()
            .map(|p| (p.0[0] as f32 / 255.0 - 0.5) / 0.5)
            .collect();

        let tensor = Array4::from_shape_vec(
            (
                1,
                1,
                self.config.target_height as usize,
                self.config.target_width as usize,
            ),
            data,
        )?;

        Ok(Preprocessed {
            tensor,
            report: PreprocessReport {
                original_width: width,
                original_height: height,
                cropped,
            },
        })
    }

    /// Crop to the top-left `crop_width x crop_height` box when either side
    /// exceeds it. Parts of the box outside the image are left black.
    pub fn crop(&self, img: GrayImage) -> (GrayImage, bool) {
        let (cw, ch) = (self.config.crop_width, self.config.crop_height);
        if img.width() <= cw && img.height() <= ch {
            return (img, false);
        }

        let mut out = GrayImage::from_pixel(cw, ch, Luma([0]));
        let region =
            imageops::crop_imm(&img, 0, 0, cw.min(img.width()), ch.min(img.height())).to_image();
        imageops::replace(&mut out, &region, 0, 0);
        (out, true)
    }
}

/// ITU-R 601-2 luma in 16-bit fixed point, the same rounding the training
/// pipeline used when converting to a single channel.
fn to_grayscale(img: &DynamicImage) -> GrayImage {
    let rgb = img.to_rgb8();
    let mut gray = GrayImage::new(rgb.width(), rgb.height());
    for (src, dst) in rgb.pixels().zip(gray.pixels_mut()) {
        let [r, g, b] = src.0;
        let l = (r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16;
        *dst = Luma([l as u8]);
    }
    gray
}
