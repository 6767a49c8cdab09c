use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::config::RenderSettings;
use crate::model::{CameraContext, BOX_LEN};
use crate::pipeline::{Processor, ShutdownSignal};

/// Outlines each violation box on the attached snapshot and re-encodes it
/// as JPEG.
pub struct Renderer {
    settings: RenderSettings,
}

impl Renderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    pub fn render(&self, jpeg: &[u8], boxes: &[[f32; BOX_LEN]]) -> Result<Vec<u8>> {
        let mut frame = image::load_from_memory(jpeg)
            .context("decode snapshot")?
            .into_rgb8();
        draw_boxes(
            &mut frame,
            boxes,
            self.settings.stroke_width,
            Rgb(self.settings.color),
        );
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.settings.jpeg_quality)
            .encode_image(&frame)
            .context("encode rendered snapshot")?;
        Ok(out)
    }
}

impl Processor for Renderer {
    fn process(
        &mut self,
        mut ctx: CameraContext,
        _shutdown: &ShutdownSignal,
    ) -> Result<Option<CameraContext>> {
        let jpeg = ctx
            .image
            .as_deref()
            .ok_or_else(|| anyhow!("no snapshot attached to render"))?;
        let boxes: Vec<[f32; BOX_LEN]> = ctx
            .inference
            .outputs
            .iter()
            .map(|d| d.location)
            .collect();
        for location in &boxes {
            log::debug!(
                "drawing box {:?} on {} at {}",
                location,
                ctx.camera_serial,
                ctx.inference.timestamp
            );
        }
        let rendered = self.render(jpeg, &boxes)?;
        ctx.image = Some(rendered);
        Ok(Some(ctx))
    }
}

/// Draws normalized `[xmin, ymin, xmax, ymax]` boxes as rectangle outlines
/// `stroke` pixels wide, growing inward from the box edge. Parts outside the
/// frame are clipped.
pub fn draw_boxes(frame: &mut RgbImage, boxes: &[[f32; BOX_LEN]], stroke: u32, color: Rgb<u8>) {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 || stroke == 0 {
        return;
    }
    let stroke = i64::from(stroke.min(width.max(height)));
    // Pixel edge, kept within one stroke of the frame so rects stay in i32.
    let edge = |v: f32, extent: u32| {
        ((v * extent as f32) as i64).clamp(-stroke, i64::from(extent) + stroke)
    };
    for [xmin, ymin, xmax, ymax] in boxes.iter().copied() {
        let (x0, x1) = (edge(xmin, width), edge(xmax, width));
        let (y0, y1) = (edge(ymin, height), edge(ymax, height));
        let (x0, x1) = (x0.min(x1), x0.max(x1));
        let (y0, y1) = (y0.min(y1), y0.max(y1));
        let (w, h) = (x1 - x0 + 1, y1 - y0 + 1);

        for inset in 0..stroke {
            if w <= 2 * inset || h <= 2 * inset {
                break;
            }
            let rect = Rect::at((x0 + inset) as i32, (y0 + inset) as i32)
                .of_size((w - 2 * inset) as u32, (h - 2 * inset) as u32);
            draw_hollow_rect_mut(frame, rect, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Detection, DetectionBatch};

    const RED: Rgb<u8> = Rgb([255, 0, 0]);
    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn settings() -> RenderSettings {
        RenderSettings {
            stroke_width: 2,
            color: [255, 0, 0],
            jpeg_quality: 100,
        }
    }

    fn black_jpeg(width: u32, height: u32) -> Vec<u8> {
        let frame = RgbImage::from_pixel(width, height, BLACK);
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(&frame)
            .unwrap();
        out
    }

    #[test]
    fn outline_is_drawn_with_stroke_width_and_interior_untouched() {
        let mut frame = RgbImage::from_pixel(100, 100, BLACK);
        draw_boxes(&mut frame, &[[0.1, 0.2, 0.5, 0.6]], 2, RED);
        // x spans 10..=50, y spans 20..=60
        assert_eq!(*frame.get_pixel(10, 20), RED);
        assert_eq!(*frame.get_pixel(11, 40), RED);
        assert_eq!(*frame.get_pixel(12, 40), BLACK);
        assert_eq!(*frame.get_pixel(30, 21), RED);
        assert_eq!(*frame.get_pixel(30, 22), BLACK);
        assert_eq!(*frame.get_pixel(50, 60), RED);
        assert_eq!(*frame.get_pixel(30, 40), BLACK);
        assert_eq!(*frame.get_pixel(5, 5), BLACK);
    }

    #[test]
    fn full_frame_box_is_clipped_not_panicking() {
        let mut frame = RgbImage::from_pixel(8, 6, BLACK);
        draw_boxes(&mut frame, &[[0.0, 0.0, 1.0, 1.0]], 3, RED);
        assert_eq!(*frame.get_pixel(0, 0), RED);
        assert_eq!(*frame.get_pixel(7, 5), RED);
        assert_eq!(*frame.get_pixel(3, 2), RED);
    }

    #[test]
    fn thick_stroke_on_a_thin_box_fills_it() {
        let mut frame = RgbImage::from_pixel(20, 20, BLACK);
        draw_boxes(&mut frame, &[[0.5, 0.25, 0.6, 0.75]], 8, RED);
        // x spans 10..=12: the middle column is reached by the second ring.
        for x in 10..=12 {
            assert_eq!(*frame.get_pixel(x, 10), RED, "x {}", x);
        }
        assert_eq!(*frame.get_pixel(13, 10), BLACK);
        assert_eq!(*frame.get_pixel(9, 10), BLACK);
    }

    #[test]
    fn boxes_far_outside_the_frame_are_clipped() {
        let mut frame = RgbImage::from_pixel(10, 10, BLACK);
        draw_boxes(&mut frame, &[[-1.0e9, 0.2, 1.0e9, 0.5]], 1, RED);
        assert_eq!(*frame.get_pixel(0, 2), RED);
        assert_eq!(*frame.get_pixel(9, 5), RED);
        assert_eq!(*frame.get_pixel(0, 3), BLACK);
        assert_eq!(*frame.get_pixel(5, 6), BLACK);
    }

    #[test]
    fn processor_replaces_image_with_rendered_jpeg() {
        let mut ctx = CameraContext::new(
            "CAM1",
            DetectionBatch {
                outputs: vec![Detection {
                    class: 1,
                    id: 1,
                    location: [0.25, 0.25, 0.75, 0.75],
                    score: 0.9,
                }],
                timestamp: 1,
            },
        );
        ctx.violation_detected = true;
        ctx.image = Some(black_jpeg(64, 48));
        let mut renderer = Renderer::new(settings());
        let out = renderer
            .process(ctx, &ShutdownSignal::new())
            .unwrap()
            .unwrap();
        let decoded = image::load_from_memory(out.image.as_deref().unwrap())
            .unwrap()
            .into_rgb8();
        assert_eq!(decoded.dimensions(), (64, 48));
        let edge = decoded.get_pixel(16, 24);
        assert!(edge[0] > 150 && edge[1] < 100, "edge pixel {:?}", edge);
    }

    #[test]
    fn missing_image_is_an_error() {
        let ctx = CameraContext::new("CAM1", DetectionBatch::default());
        assert!(Renderer::new(settings())
            .process(ctx, &ShutdownSignal::new())
            .is_err());
    }
}
