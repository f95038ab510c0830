use crate::core_modules::detector::{BoundingBox, Detection};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, Rgb, RgbImage};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: i64 = 2;
const BAR_HEIGHT: i64 = 4;

/// Outlines each detection on the frame and draws a confidence bar over it,
/// clipped to the image bounds. A full-width bar is confidence 1.0.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
        draw_box(image, detection.bbox);
        draw_confidence_bar(image, detection.bbox, detection.confidence);
    }
}

/// Sits just above the box, or just inside its top edge when the box touches
/// the top of the frame.
fn draw_confidence_bar(image: &mut RgbImage, bbox: BoundingBox, confidence: f32) {
    let length = (bbox.width as f32 * confidence.clamp(0.0, 1.0)).round() as i64;
    if length == 0 || bbox.height == 0 {
        return;
    }
    let x0 = i64::from(bbox.x);
    let above = i64::from(bbox.y) - BAR_HEIGHT - 1;
    let top = if above >= 0 {
        above
    } else {
        i64::from(bbox.y) + BOX_THICKNESS + 1
    };

    for y in top..top + BAR_HEIGHT {
        for x in x0..x0 + length {
            put(image, x, y);
        }
    }
}

fn draw_box(image: &mut RgbImage, bbox: BoundingBox) {
    let x0 = i64::from(bbox.x);
    let y0 = i64::from(bbox.y);
    let x1 = x0 + i64::from(bbox.width) - 1;
    let y1 = y0 + i64::from(bbox.height) - 1;
    if x1 < x0 || y1 < y0 {
        return;
    }

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            put(image, x, y0 + t);
            put(image, x, y1 - t);
        }
        for y in y0..=y1 {
            put(image, x0 + t, y);
            put(image, x1 - t, y);
        }
    }
}

fn put(image: &mut RgbImage, x: i64, y: i64) {
    if x < 0 || y < 0 || x >= i64::from(image.width()) || y >= i64::from(image.height()) {
        return;
    }
    image.put_pixel(x as u32, y as u32, BOX_COLOR);
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Bytes> {
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x: i32, y: i32, width: u32, height: u32) -> Detection {
        scored(x, y, width, height, 0.9)
    }

    fn scored(x: i32, y: i32, width: u32, height: u32, confidence: f32) -> Detection {
        Detection {
            class_name: "dog".into(),
            confidence,
            bbox: BoundingBox {
                x,
                y,
                width,
                height,
            },
        }
    }

    #[test]
    fn outlines_the_box_and_leaves_the_inside_alone() {
        let mut image = RgbImage::new(20, 20);
        draw_detections(&mut image, &[detection(5, 5, 10, 10)]);

        assert_eq!(*image.get_pixel(5, 5), BOX_COLOR);
        assert_eq!(*image.get_pixel(14, 14), BOX_COLOR);
        assert_eq!(*image.get_pixel(6, 10), BOX_COLOR);
        assert_eq!(*image.get_pixel(10, 10), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(4, 4), Rgb([0, 0, 0]));
    }

    #[test]
    fn boxes_hanging_off_the_frame_are_clipped() {
        let mut image = RgbImage::new(10, 10);
        draw_detections(&mut image, &[detection(-5, -5, 100, 100)]);
        assert_eq!(*image.get_pixel(0, 5), Rgb([0, 0, 0]));
        draw_detections(&mut image, &[detection(8, 8, 0, 0)]);
    }

    #[test]
    fn confidence_bar_scales_with_the_score() {
        let mut image = RgbImage::new(30, 30);
        draw_detections(&mut image, &[scored(5, 10, 10, 10, 0.5)]);

        assert_eq!(*image.get_pixel(5, 5), BOX_COLOR);
        assert_eq!(*image.get_pixel(9, 8), BOX_COLOR);
        assert_eq!(*image.get_pixel(10, 6), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(7, 9), Rgb([0, 0, 0]));
    }

    #[test]
    fn confidence_bar_moves_inside_a_box_at_the_top_edge() {
        let mut image = RgbImage::new(30, 30);
        draw_detections(&mut image, &[scored(5, 2, 10, 10, 1.0)]);

        assert_eq!(*image.get_pixel(10, 5), BOX_COLOR);
        assert_eq!(*image.get_pixel(14, 8), BOX_COLOR);
        assert_eq!(*image.get_pixel(10, 1), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(10, 9), Rgb([0, 0, 0]));
    }

    #[test]
    fn encodes_a_decodable_jpeg() {
        let image = RgbImage::from_pixel(32, 24, Rgb([200, 100, 50]));
        let jpeg = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }
}
