use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use image::GrayImage;
use image::imageops::{self, FilterType};
use indicatif::ProgressStyle;

use crate::error::Result;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .expect("failed to build progress style")
        .progress_chars("##-")
}

/// 读取图片并转换为灰度图，宽高超过 `max_size` 时等比缩小
pub fn imread(path: impl AsRef<Path>, max_size: (u32, u32)) -> Result<GrayImage> {
    let image = image::open(path)?.into_luma8();
    Ok(adjust_image_size(image, max_size))
}

/// 从内存中解码图片并转换为灰度图
pub fn imdecode(bytes: &[u8], max_size: (u32, u32)) -> Result<GrayImage> {
    let image = image::load_from_memory(bytes)?.into_luma8();
    Ok(adjust_image_size(image, max_size))
}

pub fn adjust_image_size(image: GrayImage, (width, height): (u32, u32)) -> GrayImage {
    let (ow, oh) = image.dimensions();
    if ow <= width && oh <= height {
        return image;
    }
    let scale = (width as f64 / ow as f64).min(height as f64 / oh as f64);
    let nw = ((ow as f64 * scale).round() as u32).max(1);
    let nh = ((oh as f64 * scale).round() as u32).max(1);
    imageops::resize(&image, nw, nh, FilterType::Triangle)
}

/// 按名称累计各阶段耗时
#[derive(Debug, Default)]
pub struct TimeMeasure(pub HashMap<&'static str, Duration>);

impl TimeMeasure {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn measure<F, R>(&mut self, key: &'static str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let r = f();
        *self.0.entry(key).or_default() += start.elapsed();
        r
    }

    pub fn get(&self, key: &str) -> Duration {
        self.0.get(key).copied().unwrap_or_default()
    }
}
