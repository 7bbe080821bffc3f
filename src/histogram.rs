//! 词袋直方图
//!
//! 每个描述符投票给最近的视觉词，计数后做 L1 归一化，使描述符数量不同的图片可以比较。

use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{debug, info};
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::corpus::CorpusImage;
use crate::error::{Error, Result};
use crate::store::{ArtifactCache, TRAINING_KEY, histogram_key};
use crate::utils::pb_style;
use crate::vocabulary::Vocabulary;

/// 一张图片的直方图，记录编码时使用的词汇表指纹
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub bins: Vec<f32>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledHistogram {
    pub identity: String,
    pub label: Option<String>,
    pub bins: Vec<f32>,
}

/// 整个图库的直方图，作为一个整体缓存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    pub fingerprint: String,
    pub items: Vec<LabeledHistogram>,
}

impl TrainingSet {
    /// 在指定类别中找到与 `query` 相关系数最高的图片
    pub fn best_in_class(&self, query: &[f32], label: &str) -> Result<Option<(&LabeledHistogram, f64)>> {
        let mut best: Option<(&LabeledHistogram, f64)> = None;
        for item in self.items.iter().filter(|item| item.label.as_deref() == Some(label)) {
            let score = compare_correlation(query, &item.bins)?;
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((item, score));
            }
        }
        Ok(best)
    }
}

/// 计算直方图，空描述符集得到全 0 直方图
pub fn encode(descriptors: ArrayView2<f32>, vocab: &Vocabulary) -> Result<Vec<f32>> {
    let mut bins = vec![0.0f32; vocab.size()];
    if descriptors.nrows() == 0 {
        return Ok(bins);
    }
    Error::check_dim(vocab.dim(), descriptors.ncols())?;

    let words = descriptors
        .outer_iter()
        .into_par_iter()
        .map(|d| vocab.nearest_word(d))
        .collect::<Vec<_>>();
    for w in words {
        bins[w] += 1.0;
    }
    let total = descriptors.nrows() as f32;
    bins.iter_mut().for_each(|v| *v /= total);
    Ok(bins)
}

/// 皮尔逊相关系数，两个直方图都是常数时返回 1
pub fn compare_correlation(a: &[f32], b: &[f32]) -> Result<f64> {
    Error::check_dim(a.len(), b.len())?;
    if a.is_empty() {
        return Ok(1.0);
    }
    let n = a.len() as f64;
    let ma = a.iter().map(|v| *v as f64).sum::<f64>() / n;
    let mb = b.iter().map(|v| *v as f64).sum::<f64>() / n;
    let (mut num, mut da, mut db) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64 - ma, *y as f64 - mb);
        num += x * y;
        da += x * x;
        db += y * y;
    }
    let denom = da * db;
    Ok(if denom.abs() > f64::EPSILON { num / denom.sqrt() } else { 1.0 })
}

pub struct HistogramEncoder<'a> {
    vocab: &'a Vocabulary,
    cache: &'a ArtifactCache,
}

impl<'a> HistogramEncoder<'a> {
    pub fn new(vocab: &'a Vocabulary, cache: &'a ArtifactCache) -> Self {
        Self { vocab, cache }
    }

    pub fn encode(&self, descriptors: ArrayView2<f32>) -> Result<Vec<f32>> {
        encode(descriptors, self.vocab)
    }

    /// 带缓存的编码，命中时不会调用 `descriptors`
    pub fn encode_cached<F>(&self, image: &CorpusImage, descriptors: F) -> Result<Histogram>
    where
        F: FnOnce() -> Result<Array2<f32>>,
    {
        let identity = image.identity();
        let key = histogram_key(image.label.as_deref(), &identity);
        self.cache.get_or_build_validated(
            &key,
            |h: &Histogram| self.vocab.check_fingerprint(&key, &h.fingerprint),
            || {
                debug!("计算直方图: {}", identity);
                Ok(Histogram {
                    bins: self.encode(descriptors()?.view())?,
                    fingerprint: self.vocab.fingerprint().to_string(),
                })
            },
        )
    }

    /// 计算整个图库的直方图
    ///
    /// 训练集已存在时直接返回，不会检查单张图片的缓存是否完整。
    /// `extract(i, image)` 返回第 i 张图片的描述符，只在单张图片缓存未命中时调用。
    pub fn encode_all<F>(&self, images: &[CorpusImage], extract: F) -> Result<TrainingSet>
    where
        F: Fn(usize, &CorpusImage) -> Array2<f32> + Sync,
    {
        self.cache.get_or_build_validated(
            TRAINING_KEY,
            |set: &TrainingSet| self.vocab.check_fingerprint(TRAINING_KEY, &set.fingerprint),
            || {
                info!("计算 {} 张图片的直方图", images.len());
                let pb = ProgressBar::new(images.len() as u64).with_style(pb_style());
                let items = images
                    .par_iter()
                    .enumerate()
                    .progress_with(pb.clone())
                    .map(|(i, image)| {
                        let h = self.encode_cached(image, || Ok(extract(i, image)))?;
                        Ok(LabeledHistogram {
                            identity: image.identity(),
                            label: image.label.clone(),
                            bins: h.bins,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                pb.finish_with_message("直方图计算完成");
                Ok(TrainingSet { fingerprint: self.vocab.fingerprint().to_string(), items })
            },
        )
    }
}
