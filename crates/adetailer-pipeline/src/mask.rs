//! Mask processing: turn raw detector masks into inpainting masks.
//!
//! Each stage reshapes the detector's per-instance masks before they are
//! handed to the regeneration engine:
//!
//! 1. translate by the stage's x/y offset (content pushed off the canvas is
//!    clipped, nothing wraps around),
//! 2. erode (negative amount) or dilate (positive amount) with a square
//!    structuring element,
//! 3. map every non-zero pixel to [`FOREGROUND`],
//! 4. drop masks left with no foreground pixels.
//!
//! Ordering is preserved. Downstream seed offsets are derived from a mask's
//! position, so reordering here would change the generated images.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::rect::Rect;

use crate::args::StageArgs;
use crate::types::{BoundingBox, Dimensions};

/// Foreground value written into generated masks.
pub const FOREGROUND: u8 = 255;

/// Per-stage mask reshaping parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaskTransform {
    /// Erosion (negative) or dilation (positive) radius in pixels.
    pub dilate_erode: i32,
    /// Horizontal shift; positive moves right.
    pub x_offset: i32,
    /// Vertical shift; positive moves up.
    pub y_offset: i32,
}

impl MaskTransform {
    /// The transform configured by a stage.
    #[must_use]
    pub const fn from_args(args: &StageArgs) -> Self {
        Self {
            dilate_erode: args.dilate_erode(),
            x_offset: args.x_offset(),
            y_offset: args.y_offset(),
        }
    }

    /// Reshape raw masks, dropping any that end up empty.
    ///
    /// Every kept mask is binary (0 or [`FOREGROUND`]) whatever the
    /// detector's foreground value. An empty input yields an empty output:
    /// "nothing detected".
    #[must_use = "returns the processed masks"]
    pub fn process(&self, masks: Vec<GrayImage>) -> Vec<GrayImage> {
        masks
            .into_iter()
            .map(|m| offset(&m, self.x_offset, self.y_offset))
            .map(|m| dilate_erode(&m, self.dilate_erode))
            .map(binarize)
            .filter(|m| !is_empty(m))
            .collect()
    }
}

/// Dilate (positive `amount`) or erode (negative `amount`) a mask.
///
/// Uses an L∞ structuring element, i.e. a square of side `2 * |amount| + 1`.
/// Any non-zero pixel counts as foreground; the output is strictly binary
/// (0 or [`FOREGROUND`]). A zero amount only binarizes.
#[must_use = "returns the reshaped mask"]
pub fn dilate_erode(mask: &GrayImage, amount: i32) -> GrayImage {
    if amount == 0 {
        return binarize(mask.clone());
    }
    let radius = u8::try_from(amount.unsigned_abs()).unwrap_or(u8::MAX);
    if amount > 0 {
        imageproc::morphology::dilate(mask, Norm::LInf, radius)
    } else {
        imageproc::morphology::erode(mask, Norm::LInf, radius)
    }
}

/// Translate mask content by `(dx, dy)` within the same canvas.
///
/// Positive `dx` moves right, positive `dy` moves up. Pixels shifted past
/// an edge are discarded and vacated pixels become background. Pixel
/// values are copied as is.
#[must_use = "returns the shifted mask"]
pub fn offset(mask: &GrayImage, dx: i32, dy: i32) -> GrayImage {
    if dx == 0 && dy == 0 {
        return mask.clone();
    }
    let (w, h) = mask.dimensions();
    let (dx, dy) = (i64::from(dx), -i64::from(dy));
    GrayImage::from_fn(w, h, |x, y| {
        let sx = i64::from(x) - dx;
        let sy = i64::from(y) - dy;
        match (u32::try_from(sx), u32::try_from(sy)) {
            (Ok(sx), Ok(sy)) if sx < w && sy < h => *mask.get_pixel(sx, sy),
            _ => Luma([0]),
        }
    })
}

/// Map every non-zero pixel to [`FOREGROUND`].
#[must_use = "returns the binary mask"]
pub fn binarize(mut mask: GrayImage) -> GrayImage {
    for v in mask.iter_mut() {
        if *v != 0 {
            *v = FOREGROUND;
        }
    }
    mask
}

/// Whether a mask has no foreground pixels.
#[must_use]
pub fn is_empty(mask: &GrayImage) -> bool {
    mask.as_raw().iter().all(|&v| v == 0)
}

/// Rasterize detection boxes into full-canvas masks, one per box.
///
/// Used by object detectors that produce boxes but no segmentation.
/// Boxes are clamped to the canvas; a box that covers no whole pixel
/// still yields an (empty) mask so positions stay aligned with the
/// detections.
#[must_use = "returns one mask per box"]
pub fn masks_from_boxes(boxes: &[BoundingBox], canvas: Dimensions) -> Vec<GrayImage> {
    boxes
        .iter()
        .map(|b| {
            let mut mask = GrayImage::new(canvas.width, canvas.height);
            if let Some(rect) = box_rect(b, canvas) {
                imageproc::drawing::draw_filled_rect_mut(&mut mask, rect, Luma([FOREGROUND]));
            }
            mask
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn box_rect(b: &BoundingBox, canvas: Dimensions) -> Option<Rect> {
    let clamp_x = |v: f32| v.clamp(0.0, canvas.width as f32).round() as i32;
    let clamp_y = |v: f32| v.clamp(0.0, canvas.height as f32).round() as i32;
    let (x0, x1) = (clamp_x(b.x0.min(b.x1)), clamp_x(b.x0.max(b.x1)));
    let (y0, y1) = (clamp_y(b.y0.min(b.y1)), clamp_y(b.y0.max(b.y1)));
    let width = u32::try_from(x1 - x0).ok().filter(|&w| w > 0)?;
    let height = u32::try_from(y1 - y0).ok().filter(|&h| h > 0)?;
    Some(Rect::at(x0, y0).of_size(width, height))
}
