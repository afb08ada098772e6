//! Captured frames and the sharpness metric
//!
//! Objects pass the IR gate on a moving belt, so a fraction of captures are
//! smeared. When several frames are taken per trigger the sharpest one is
//! kept, scored by the variance of a 4-neighbour Laplacian over the luma
//! channel:
//!
//! ```text
//!        ┌────┬────┬────┐
//!        │  0 │  1 │  0 │
//!        ├────┼────┼────┤
//!  L  =  │  1 │ -4 │  1 │      sharpness = Var(L * luma)
//!        ├────┼────┼────┤
//!        │  0 │  1 │  0 │
//!        └────┴────┴────┘
//! ```
//!
//! Blur suppresses high spatial frequencies, which flattens the Laplacian
//! response and drives its variance toward zero.

use image::{GrayImage, RgbImage};

/// One captured image
///
/// Owned by the capture routine until it is handed to the classifier.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Set when the frame was scored during multi-frame capture
    pub sharpness: Option<f64>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            sharpness: None,
        }
    }

    /// Score the frame and remember the score
    pub fn scored(mut self) -> Self {
        self.sharpness = Some(sharpness(&self.image));
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Variance of the Laplacian of the luma channel
///
/// Border pixels are skipped; images smaller than 3×3 score 0.
pub fn sharpness(image: &RgbImage) -> f64 {
    let gray = image::imageops::grayscale(image);
    laplacian_variance(&gray)
}

fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| f64::from(gray.get_pixel(x, y)[0]);
    let n = f64::from((w - 2) * (h - 2));
    let mut sum = 0.0;
    let mut sum_sq = 0.0;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let response = px(x, y - 1) + px(x - 1, y) + px(x + 1, y) + px(x, y + 1) - 4.0 * px(x, y);
            sum += response;
            sum_sq += response * response;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}
