use log::info;
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::config::VocabularyOptions;
use crate::error::{Error, Result};
use crate::kmeans::{KMeansConfig, kmeans, nearest_centroid};
use crate::store::{ArtifactCache, vocabulary_key};

/// 视觉词汇表，每行一个视觉词
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    centers: Array2<f32>,
    options: VocabularyOptions,
    fingerprint: String,
}

impl Vocabulary {
    /// 对描述符聚类得到 K 个视觉词，K 取自 `opts.vocab_size`
    pub fn build(descriptors: ArrayView2<f32>, opts: &VocabularyOptions) -> Result<Self> {
        if descriptors.nrows() == 0 {
            return Err(Error::InvalidInput("no descriptors to build vocabulary from".into()));
        }
        info!("对 {} 个描述符进行聚类，K = {}", descriptors.nrows(), opts.vocab_size);
        let state = kmeans(descriptors, &KMeansConfig::from(opts))?;
        Ok(Self::from_centers(state.centroids, opts.clone()))
    }

    /// 按名称加载词汇表，不存在时才提取描述符并构建
    ///
    /// 已存在的词汇表原样返回，即使 `opts` 中的 K 与之不同。
    pub fn load_or_build<F>(cache: &ArtifactCache, opts: &VocabularyOptions, pool: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Array2<f32>>,
    {
        let key = vocabulary_key(&opts.vocab_name);
        cache.get_or_build(&key, || Self::build(pool()?.view(), opts))
    }

    pub fn from_centers(centers: Array2<f32>, options: VocabularyOptions) -> Self {
        let fingerprint = fingerprint(centers.view());
        Self { centers, options, fingerprint }
    }

    /// 视觉词数量 K
    pub fn size(&self) -> usize {
        self.centers.nrows()
    }

    /// 描述符维度
    pub fn dim(&self) -> usize {
        self.centers.ncols()
    }

    pub fn centers(&self) -> ArrayView2<f32> {
        self.centers.view()
    }

    pub fn options(&self) -> &VocabularyOptions {
        &self.options
    }

    /// 词汇表的 blake3 指纹，依赖它的产物都会记录这个值
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// 最近的视觉词序号
    pub fn nearest_word(&self, descriptor: ArrayView1<f32>) -> usize {
        nearest_centroid(descriptor, self.centers.view()).0
    }

    /// 检查产物记录的指纹是否和当前词汇表一致
    pub fn check_fingerprint(&self, key: &str, fingerprint: &str) -> Result<()> {
        if fingerprint != self.fingerprint {
            return Err(Error::StaleArtifact { key: key.to_string() });
        }
        Ok(())
    }
}

fn fingerprint(centers: ArrayView2<f32>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(centers.nrows() as u64).to_le_bytes());
    hasher.update(&(centers.ncols() as u64).to_le_bytes());
    for v in centers.iter() {
        hasher.update(&v.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
