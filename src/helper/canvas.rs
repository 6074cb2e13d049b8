use ab_glyph::{FontArc, PxScale};
use image::buffer::ConvertBuffer;
use image::{Rgb, RgbImage, Rgba, Rgba32FImage, RgbaImage};
use imageproc::drawing::{
    draw_cross_mut, draw_filled_circle_mut, draw_hollow_circle_mut, draw_line_segment_mut,
    draw_text_mut,
};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

use crate::error::AlignError;
use crate::helper::geometry::EyeMetrics;
use crate::helper::transform::SimilarityTransform;

const TRANSPARENT: Rgba<f32> = Rgba([0.0, 0.0, 0.0, 0.0]);
const MARKER_RADIUS: i32 = 4;
const LABEL_SCALE: f32 = 16.0;

/// render resamples `source` through `transform` onto a new opaque
/// `canvas_size` x `canvas_size` surface filled with `background`.
///
/// The composed matrix is applied in a single bilinear pass; areas the
/// source does not cover keep the background colour.
///
/// # Arguments
/// * `source` - the uploaded photo, never modified
/// * `transform` - source-to-canvas similarity transform
/// * `canvas_size` - side of the square output
/// * `background` - RGB fill for uncovered and transparent areas
///
/// # Returns
/// * `Result<RgbImage, AlignError>`
pub fn render(
    source: &RgbaImage,
    transform: &SimilarityTransform,
    canvas_size: u32,
    background: [u8; 3],
) -> Result<RgbImage, AlignError> {
    let projection = to_projection(transform)?;

    // sample in float so uniform regions do not lose a level to truncation
    let source: Rgba32FImage = source.convert();
    let mut warped = Rgba32FImage::from_pixel(canvas_size, canvas_size, TRANSPARENT);
    warp_into(&source, &projection, Interpolation::Bilinear, TRANSPARENT, &mut warped);

    let mut surface = RgbImage::from_pixel(canvas_size, canvas_size, Rgb(background));
    for (dst, src) in surface.pixels_mut().zip(warped.pixels()) {
        *dst = composite(*src, *dst);
    }
    Ok(surface)
}

fn to_projection(transform: &SimilarityTransform) -> Result<Projection, AlignError> {
    let m = transform.matrix();
    let mut coefficients = [0f32; 9];
    for row in 0..3 {
        for col in 0..3 {
            coefficients[row * 3 + col] = m[(row, col)] as f32;
        }
    }
    Projection::from_matrix(coefficients).ok_or_else(|| {
        AlignError::DegenerateLandmarks("transform matrix is not invertible".to_string())
    })
}

/// Source-over blend of a normalized `src` on an opaque `dst`.
fn composite(src: Rgba<f32>, dst: Rgb<u8>) -> Rgb<u8> {
    let alpha = src[3].clamp(0.0, 1.0);
    if alpha == 0.0 {
        return dst;
    }
    let blend = |s: f32, d: u8| {
        (s.clamp(0.0, 1.0) * 255.0 * alpha + d as f32 * (1.0 - alpha))
            .round()
            .clamp(0.0, 255.0) as u8
    };
    Rgb([
        blend(src[0], dst[0]),
        blend(src[1], dst[1]),
        blend(src[2], dst[2]),
    ])
}

/// Optional overlay style for [`draw_eye_metrics`].
#[derive(Clone, Debug)]
pub struct OverlayStyle {
    pub color: [u8; 3],
    /// Labels are only drawn when a font is available.
    pub font: Option<FontArc>,
}

impl OverlayStyle {
    pub fn new(color: [u8; 3]) -> Self {
        OverlayStyle { color, font: None }
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self::new([255, 0, 0])
    }
}

/// Text annotations drawn next to the midpoint marker.
pub fn overlay_labels(metrics: &EyeMetrics) -> [String; 2] {
    let degrees = metrics.angle_degrees();
    // keep "-0.0°" off the overlay
    let degrees = if degrees.abs() < 0.05 { 0.0 } else { degrees };
    [
        format!("{degrees:.1}°"),
        format!("{:.1}px", metrics.eye_distance),
    ]
}

/// draw_eye_metrics paints the eye line, center markers, midpoint marker and
/// angle/distance labels.
///
/// # Arguments
/// * `surface` - the rendered canvas
/// * `placed` - eye metrics in surface coordinates, used for the markers
/// * `measured` - eye metrics of the source photo, used for the labels
/// * `style` - colour and optional label font
pub fn draw_eye_metrics(surface: &mut RgbImage, placed: &EyeMetrics, measured: &EyeMetrics, style: &OverlayStyle) {
    let color = Rgb(style.color);
    let left = (placed.left_eye_center.x as f32, placed.left_eye_center.y as f32);
    let right = (placed.right_eye_center.x as f32, placed.right_eye_center.y as f32);
    let mid = (
        placed.center_point.x.round() as i32,
        placed.center_point.y.round() as i32,
    );

    draw_line_segment_mut(surface, left, right, color);
    for (x, y) in [left, right] {
        let center = (x.round() as i32, y.round() as i32);
        draw_hollow_circle_mut(surface, center, MARKER_RADIUS, color);
        draw_filled_circle_mut(surface, center, 1, color);
    }
    draw_cross_mut(surface, color, mid.0, mid.1);

    if let Some(font) = &style.font {
        let scale = PxScale::from(LABEL_SCALE);
        let line_height = LABEL_SCALE as i32 + 2;
        for (row, label) in overlay_labels(measured).iter().enumerate() {
            let y = mid.1 + MARKER_RADIUS * 2 + row as i32 * line_height;
            draw_text_mut(surface, color, mid.0 + MARKER_RADIUS * 2, y, scale, font, label);
        }
    }
}
