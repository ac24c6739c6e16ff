//! Face alignment via 4-DOF similarity transform.
//!
//! Warps detected faces onto the canonical 112×112 ArcFace template using the
//! five InsightFace reference landmarks.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// Closed form over centred coordinates; degenerate input (all source
    /// points coincident) yields `None`.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut num_a, mut num_b, mut den) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            num_a += sx * dx + sy * dy;
            num_b += sx * dy - sy * dx;
            den += sx * sx + sy * sy;
        }
        if den < 1e-12 {
            return None;
        }

        let a = num_a / den;
        let b = num_b / den;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (ia, ib) = (self.a / det, -self.b / det);
        let inv = Self { a: ia, b: ib, tx: 0.0, ty: 0.0 };
        let (tx, ty) = inv.apply((-self.tx, -self.ty));
        Some(Self { tx, ty, ..inv })
    }
}

/// Bilinear sample of one pixel; out-of-bounds reads are black.
fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let px = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr, bl, br) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Align a face to a canonical 112×112 RGB crop from its five landmarks.
///
/// Returns `None` when the landmarks are degenerate.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let forward = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112)?;
    let back = forward.inverse()?;
    Some(RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        let (sx, sy) = back.apply((ox as f32, oy as f32));
        sample(image, sx, sy)
    }))
}

/// Square crop around the box, resized to 112×112.
///
/// Used when the detector reports no landmarks.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let b = face.clamped(image.width(), image.height());
    let side = b.width.max(b.height);
    if side < 1.0 {
        return None;
    }
    let cx = b.x + b.width / 2.0;
    let cy = b.y + b.height / 2.0;
    let x = (cx - side / 2.0).max(0.0) as u32;
    let y = (cy - side / 2.0).max(0.0) as u32;
    let w = (side as u32).min(image.width().saturating_sub(x)).max(1);
    let h = (side as u32).min(image.height().saturating_sub(y)).max(1);
    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    Some(imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = Similarity::estimate(&pts, &pts).unwrap();
        assert!((m.a - 1.0).abs() < 1e-4, "a = {}", m.a);
        assert!(m.b.abs() < 1e-4, "b = {}", m.b);
        assert!(m.tx.abs() < 1e-3 && m.ty.abs() < 1e-3);
    }

    #[test]
    fn test_scaled_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 + 4.0));
        let m = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((m.a - 0.5).abs() < 1e-4, "a = {}", m.a);
        let (x, y) = m.apply(src[2]);
        assert!((x - REFERENCE_LANDMARKS_112[2].0).abs() < 1e-3);
        assert!((y - REFERENCE_LANDMARKS_112[2].1).abs() < 1e-3);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let m = Similarity { a: 0.8, b: 0.3, tx: 12.0, ty: -4.0 };
        let inv = m.inverse().unwrap();
        let (x, y) = inv.apply(m.apply((33.0, 71.0)));
        assert!((x - 33.0).abs() < 1e-3 && (y - 71.0).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let pts = [(5.0, 5.0); 5];
        let img = RgbImage::new(50, 50);
        assert!(align_face(&img, &pts).is_none());
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        let mut img = RgbImage::new(200, 200);
        // 5×5 bright patch at the left eye survives bilinear interpolation.
        for dy in 0..5 {
            for dx in 0..5 {
                img.put_pixel(78 + dx, 58 + dy, Rgb([255, 200, 50]));
            }
        }

        let aligned = align_face(&img, &src).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));

        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[0].0.round() as u32,
            REFERENCE_LANDMARKS_112[0].1.round() as u32,
        );
        let mut brightest = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                brightest = brightest.max(aligned.get_pixel(x, y)[0]);
            }
        }
        assert!(brightest > 100, "expected bright patch near ({rx}, {ry}), got {brightest}");
    }

    #[test]
    fn test_crop_face_output_size() {
        let img = RgbImage::from_pixel(300, 200, Rgb([10, 20, 30]));
        let face = BoundingBox::from_corners([250.0, 150.0, 320.0, 260.0], 0.9);
        let crop = crop_face(&img, &face).unwrap();
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        let p = crop.get_pixel(56, 56);
        assert!((p[2] as i32 - 30).abs() <= 1, "got {p:?}");
    }
}
