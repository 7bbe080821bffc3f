use image::GrayImage;
use image::imageops::{self, FilterType};

pub type DHash = [u8; 8];

/// 差异哈希：缩放到 9x8 后比较每行相邻像素
pub fn d_hash(image: &GrayImage) -> DHash {
    let small = imageops::resize(image, 9, 8, FilterType::Triangle);
    let data = small.as_raw();

    let mut hash = [0; 8];
    for (i, chunk) in data.chunks_exact(9).enumerate() {
        let mut b = 0;
        for j in 0..8 {
            b <<= 1;
            b |= if chunk[j] < chunk[j + 1] { 1 } else { 0 };
        }
        hash[i] = b;
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_flat_image() {
        let image = GrayImage::from_pixel(32, 32, Luma([100]));
        assert_eq!(d_hash(&image), [0; 8]);
    }

    #[test]
    fn test_gradient() {
        let image = GrayImage::from_fn(90, 80, |x, _| Luma([(x * 2) as u8]));
        assert_eq!(d_hash(&image), [0xff; 8]);
    }

    #[test]
    fn test_scale_invariant() {
        let image = GrayImage::from_fn(90, 80, |x, y| {
            let v = 128.0 + 100.0 * (x as f32 / 15.0).sin() * (y as f32 / 20.0).cos();
            Luma([v as u8])
        });
        let half = imageops::resize(&image, 45, 40, FilterType::Triangle);
        let (a, b) = (d_hash(&image), d_hash(&half));
        let diff: u32 = a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum();
        assert!(diff <= 16, "diff = {diff}");
    }
}
