//! Round pre-scaling
//!
//! Shrinks an image before inference according to the round's limit rule.
//! Images are never upscaled and the aspect ratio is preserved.

use image::imageops::FilterType;
use image::DynamicImage;
use std::borrow::Cow;

use crate::engine::{LimitType, RoundParams};

/// Compute the target dimensions for a limit rule, or `None` if the image
/// is already within it.
///
/// - `Max`: shrink so the longer side equals the limit, only when it exceeds it
/// - `Min`: a floor on the shorter side. Reaching it would mean upscaling,
///   so the image is passed through and the limit is left to the engine.
pub fn target_size(width: u32, height: u32, limit_type: LimitType, limit: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || limit == 0 || limit_type == LimitType::Min {
        return None;
    }

    let side = width.max(height);
    if side <= limit {
        return None;
    }

    let scale = limit as f64 / side as f64;
    let new_w = ((width as f64 * scale).round() as u32).max(1);
    let new_h = ((height as f64 * scale).round() as u32).max(1);
    Some((new_w, new_h))
}

/// Apply the round's pre-scaling rule
pub fn prescale<'a>(image: &'a DynamicImage, params: &RoundParams) -> Cow<'a, DynamicImage> {
    match target_size(image.width(), image.height(), params.limit_type, params.limit_side_len) {
        Some((w, h)) => Cow::Owned(image.resize_exact(w, h, FilterType::Triangle)),
        None => Cow::Borrowed(image),
    }
}
