//! Fast-Hessian 特征点检测 + SURF 风格的 64 维浮点描述符
//!
//! 检测器在积分图上用盒子滤波近似 Hessian 矩阵行列式，在尺度金字塔中做 3x3x3 非极大值抑制；
//! 描述符在 20s 的窗口中统计 4x4 个子区域的 Haar 小波响应 (dx, dy, |dx|, |dy|)。

use std::cmp::Ordering;
use std::f32::consts::{FRAC_PI_3, PI};
use std::path::Path;

use image::GrayImage;
use log::{debug, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::FeatureOptions;
use crate::error::Result;
use crate::utils;

/// 描述符维度
pub const DESCRIPTOR_DIM: usize = 64;

/// 每组金字塔的层数，中间两层参与极值检测
const LAYERS_PER_OCTAVE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// 特征尺度，对应高斯核的 sigma
    pub scale: f32,
    /// 主方向，弧度；upright 模式下恒为 0
    pub orientation: f32,
    /// Hessian 行列式响应
    pub response: f32,
}

/// 积分图，多存一行一列 0 方便计算
struct IntegralImage {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let stride = width + 1;
        let mut data = vec![0.0; stride * (height + 1)];
        for (y, row) in image.rows().enumerate() {
            let mut acc = 0.0;
            for (x, pixel) in row.enumerate() {
                acc += pixel[0] as f64 / 255.0;
                data[(y + 1) * stride + x + 1] = data[y * stride + x + 1] + acc;
            }
        }
        Self { width, height, data }
    }

    /// 计算 [row, row + rows) x [col, col + cols) 的像素和，超出图片的部分被裁掉
    fn box_sum(&self, row: i64, col: i64, rows: i64, cols: i64) -> f32 {
        let (h, w) = (self.height as i64, self.width as i64);
        let r0 = row.clamp(0, h) as usize;
        let c0 = col.clamp(0, w) as usize;
        let r1 = (row + rows).clamp(0, h) as usize;
        let c1 = (col + cols).clamp(0, w) as usize;
        if r1 <= r0 || c1 <= c0 {
            return 0.0;
        }
        let stride = self.width + 1;
        let a = self.data[r0 * stride + c0];
        let b = self.data[r0 * stride + c1];
        let c = self.data[r1 * stride + c0];
        let d = self.data[r1 * stride + c1];
        (d - b - c + a).max(0.0) as f32
    }

    fn haar_x(&self, row: i64, col: i64, size: i64) -> f32 {
        let half = size / 2;
        self.box_sum(row - half, col, size, half) - self.box_sum(row - half, col - half, size, half)
    }

    fn haar_y(&self, row: i64, col: i64, size: i64) -> f32 {
        let half = size / 2;
        self.box_sum(row, col - half, half, size) - self.box_sum(row - half, col - half, half, size)
    }
}

/// 某一尺度下的 Hessian 响应图
struct ResponseLayer {
    width: usize,
    height: usize,
    step: usize,
    filter: usize,
    responses: Vec<f32>,
}

impl ResponseLayer {
    fn build(integral: &IntegralImage, step: usize, filter: usize) -> Self {
        let width = integral.width / step;
        let height = integral.height / step;
        let b = ((filter - 1) / 2) as i64;
        let l = (filter / 3) as i64;
        let w = filter as i64;
        let inv_area = 1.0 / (w * w) as f32;

        let mut responses = vec![0.0; width * height];
        for ar in 0..height {
            for ac in 0..width {
                let r = (ar * step) as i64;
                let c = (ac * step) as i64;
                let dxx = integral.box_sum(r - l + 1, c - b, 2 * l - 1, w)
                    - integral.box_sum(r - l + 1, c - l / 2, 2 * l - 1, l) * 3.0;
                let dyy = integral.box_sum(r - b, c - l + 1, w, 2 * l - 1)
                    - integral.box_sum(r - l / 2, c - l + 1, l, 2 * l - 1) * 3.0;
                let dxy = integral.box_sum(r - l, c + 1, l, l)
                    + integral.box_sum(r + 1, c - l, l, l)
                    - integral.box_sum(r - l, c - l, l, l)
                    - integral.box_sum(r + 1, c + 1, l, l);
                let (dxx, dyy, dxy) = (dxx * inv_area, dyy * inv_area, dxy * inv_area);
                responses[ar * width + ac] = dxx * dyy - 0.81 * dxy * dxy;
            }
        }
        Self { width, height, step, filter, responses }
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f32 {
        self.responses[row * self.width + col]
    }
}

/// 第 octave 组第 layer 层的滤波器边长：9, 15, 21, 27 / 15, 27, 39, 51 / ...
fn filter_size(octave: usize, layer: usize) -> usize {
    3 * ((2usize << octave) * (layer + 1) + 1)
}

pub struct SurfDetector {
    opts: FeatureOptions,
}

impl SurfDetector {
    pub fn create(opts: FeatureOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &FeatureOptions {
        &self.opts
    }

    /// 读取图片文件并提取特征，图片无法读取时返回错误
    pub fn detect_file(&self, path: impl AsRef<Path>) -> Result<(Vec<KeyPoint>, Array2<f32>)> {
        let image = utils::imread(path, self.opts.max_size)?;
        Ok(self.detect_and_compute(&image))
    }

    /// 解码并提取特征，无法解码的数据视为没有特征点
    pub fn detect_bytes(&self, bytes: &[u8]) -> (Vec<KeyPoint>, Array2<f32>) {
        match utils::imdecode(bytes, self.opts.max_size) {
            Ok(image) => self.detect_and_compute(&image),
            Err(e) => {
                warn!("图片解码失败，跳过: {}", e);
                (vec![], Array2::zeros((0, DESCRIPTOR_DIM)))
            }
        }
    }

    /// 只返回描述符
    pub fn extract(&self, image: &GrayImage) -> Array2<f32> {
        self.detect_and_compute(image).1
    }

    pub fn detect_and_compute(&self, image: &GrayImage) -> (Vec<KeyPoint>, Array2<f32>) {
        let image = utils::adjust_image_size(image.clone(), self.opts.max_size);
        let integral = IntegralImage::new(&image);
        let keypoints = self.detect(&integral);

        let mut descriptors = Array2::zeros((keypoints.len(), DESCRIPTOR_DIM));
        let keypoints = keypoints
            .into_iter()
            .enumerate()
            .map(|(i, mut kp)| {
                if !self.opts.upright {
                    kp.orientation = orientation(&integral, &kp);
                }
                let desc = describe(&integral, &kp);
                descriptors.row_mut(i).assign(&ndarray::ArrayView1::from(&desc[..]));
                kp
            })
            .collect::<Vec<_>>();

        debug!("检测到 {} 个特征点", keypoints.len());
        (keypoints, descriptors)
    }

    fn detect(&self, integral: &IntegralImage) -> Vec<KeyPoint> {
        let min_side = integral.width.min(integral.height);
        let mut keypoints = vec![];

        for octave in 0..self.opts.octaves {
            let step = self.opts.init_step.max(1) << octave;
            // 最大的滤波器都放不进图片时，后续的组也不需要了
            if filter_size(octave, LAYERS_PER_OCTAVE - 1) > min_side {
                break;
            }
            let layers = (0..LAYERS_PER_OCTAVE)
                .map(|i| ResponseLayer::build(integral, step, filter_size(octave, i)))
                .collect::<Vec<_>>();
            for i in 1..LAYERS_PER_OCTAVE - 1 {
                self.find_extrema(&layers[i - 1], &layers[i], &layers[i + 1], &mut keypoints);
            }
        }

        keypoints.sort_by(|a, b| {
            b.response
                .partial_cmp(&a.response)
                .unwrap_or(Ordering::Equal)
                .then(a.y.total_cmp(&b.y))
                .then(a.x.total_cmp(&b.x))
                .then(a.scale.total_cmp(&b.scale))
        });
        keypoints.truncate(self.opts.max_features);
        keypoints
    }

    fn find_extrema(
        &self,
        bottom: &ResponseLayer,
        middle: &ResponseLayer,
        top: &ResponseLayer,
        out: &mut Vec<KeyPoint>,
    ) {
        let border = (top.filter / 2) / middle.step + 1;
        if middle.height <= 2 * border || middle.width <= 2 * border {
            return;
        }
        for r in border..middle.height - border {
            for c in border..middle.width - border {
                let v = middle.at(r, c);
                if v < self.opts.hessian_threshold {
                    continue;
                }
                let is_max = [bottom, middle, top].iter().all(|layer| {
                    (r - 1..=r + 1).all(|rr| {
                        (c - 1..=c + 1).all(|cc| {
                            (std::ptr::eq(*layer, middle) && rr == r && cc == c)
                                || layer.at(rr, cc) < v
                        })
                    })
                });
                if is_max {
                    out.push(KeyPoint {
                        x: (c * middle.step) as f32,
                        y: (r * middle.step) as f32,
                        scale: 1.2 * middle.filter as f32 / 9.0,
                        orientation: 0.0,
                        response: v,
                    });
                }
            }
        }
    }
}

/// 在半径 6s 的圆内统计 Haar 响应，用 60 度的滑动扇形找主方向
fn orientation(integral: &IntegralImage, kp: &KeyPoint) -> f32 {
    let s = kp.scale.round().max(1.0) as i64;
    let (x, y) = (kp.x.round() as i64, kp.y.round() as i64);

    let mut samples = Vec::with_capacity(109);
    for i in -6i64..=6 {
        for j in -6i64..=6 {
            if i * i + j * j >= 36 {
                continue;
            }
            let g = (-((i * i + j * j) as f32) / 12.5).exp();
            let rx = g * integral.haar_x(y + j * s, x + i * s, 4 * s);
            let ry = g * integral.haar_y(y + j * s, x + i * s, 4 * s);
            let angle = ry.atan2(rx).rem_euclid(2.0 * PI);
            samples.push((angle, rx, ry));
        }
    }

    let mut best = (0.0f32, 0.0f32, 0.0f32);
    let mut ang1 = 0.0f32;
    while ang1 < 2.0 * PI {
        let ang2 = (ang1 + FRAC_PI_3).rem_euclid(2.0 * PI);
        let (mut sx, mut sy) = (0.0, 0.0);
        for &(angle, rx, ry) in &samples {
            let inside = if ang1 < ang2 {
                ang1 < angle && angle < ang2
            } else {
                angle > ang1 || angle < ang2
            };
            if inside {
                sx += rx;
                sy += ry;
            }
        }
        let magnitude = sx * sx + sy * sy;
        if magnitude > best.0 {
            best = (magnitude, sx, sy);
        }
        ang1 += 0.15;
    }

    if best.0 == 0.0 { 0.0 } else { best.2.atan2(best.1).rem_euclid(2.0 * PI) }
}

/// 计算 64 维描述符，结果为单位向量
fn describe(integral: &IntegralImage, kp: &KeyPoint) -> [f32; DESCRIPTOR_DIM] {
    let (co, si) = (kp.orientation.cos(), kp.orientation.sin());
    let scale = kp.scale;
    let haar_size = ((2.0 * scale).round() as i64).max(2);
    let sigma = 3.3 * scale;

    let mut desc = [0.0f32; DESCRIPTOR_DIM];
    let mut idx = 0;
    for i in 0..4 {
        for j in 0..4 {
            let (mut dx, mut dy, mut mdx, mut mdy) = (0.0, 0.0, 0.0, 0.0);
            for k in 0..5 {
                for l in 0..5 {
                    let u = ((i * 5 + k) as f32 - 9.5) * scale;
                    let v = ((j * 5 + l) as f32 - 9.5) * scale;
                    let sx = kp.x + u * co - v * si;
                    let sy = kp.y + u * si + v * co;
                    let g = (-(u * u + v * v) / (2.0 * sigma * sigma)).exp();
                    let (row, col) = (sy.round() as i64, sx.round() as i64);
                    let rx = integral.haar_x(row, col, haar_size);
                    let ry = integral.haar_y(row, col, haar_size);
                    // 旋转到特征点坐标系
                    let tx = rx * co + ry * si;
                    let ty = -rx * si + ry * co;
                    dx += g * tx;
                    dy += g * ty;
                    mdx += g * tx.abs();
                    mdy += g * ty.abs();
                }
            }
            desc[idx..idx + 4].copy_from_slice(&[dx, dy, mdx, mdy]);
            idx += 4;
        }
    }

    let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        desc.iter_mut().for_each(|v| *v /= norm);
    }
    desc
}
