use ndarray::{Array2, ArrayView2, Axis, concatenate};
use serde::{Deserialize, Serialize};

use crate::config::IndexOptions;
use crate::error::{Error, Result};
use crate::kdtree::{KdForest, Neighbor};

/// 一张图片在拼接后的描述符矩阵中占据的行区间 `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRange {
    pub identity: String,
    pub start: usize,
    pub end: usize,
}

impl RowRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// 行号到图片的映射，区间按添加顺序首尾相接
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRanges {
    ranges: Vec<RowRange>,
}

impl RowRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一张有 `rows` 个描述符的图片
    pub fn push(&mut self, identity: impl Into<String>, rows: usize) {
        let start = self.total_rows();
        self.ranges.push(RowRange { identity: identity.into(), start, end: start + rows });
    }

    pub fn total_rows(&self) -> usize {
        self.ranges.last().map_or(0, |r| r.end)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RowRange> {
        self.ranges.iter()
    }

    /// 找到包含 `row` 的图片序号，二分查找第一个 `end > row` 的区间
    pub fn locate(&self, row: usize) -> Result<usize> {
        let i = self.ranges.partition_point(|r| r.end <= row);
        match self.ranges.get(i) {
            Some(r) if r.start <= row => Ok(i),
            _ => Err(Error::IndexMappingCorrupt { row, total_rows: self.total_rows() }),
        }
    }

    /// 检查区间从 0 开始首尾相接
    pub fn validate(&self) -> Result<()> {
        let mut expected = 0;
        for r in &self.ranges {
            if r.start != expected || r.end < r.start {
                return Err(Error::IndexMappingCorrupt { row: expected, total_rows: self.total_rows() });
            }
            expected = r.end;
        }
        Ok(())
    }
}

impl FromIterator<(String, usize)> for RowRanges {
    fn from_iter<T: IntoIterator<Item = (String, usize)>>(iter: T) -> Self {
        let mut ranges = Self::new();
        for (identity, rows) in iter {
            ranges.push(identity, rows);
        }
        ranges
    }
}

/// 图库描述符索引：kd 森林 + 行区间映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusIndex {
    forest: KdForest,
    ranges: RowRanges,
    /// 构建时图库的指纹，图库变化后需要重建
    corpus_fingerprint: String,
}

impl CorpusIndex {
    /// 按顺序拼接每张图片的描述符并建立索引
    pub fn build(
        descriptors: Vec<(String, Array2<f32>)>,
        dim: usize,
        opts: &IndexOptions,
        corpus_fingerprint: String,
    ) -> Result<Self> {
        for (_, des) in &descriptors {
            if des.nrows() > 0 {
                Error::check_dim(dim, des.ncols())?;
            }
        }
        let ranges = descriptors.iter().map(|(id, des)| (id.clone(), des.nrows())).collect::<RowRanges>();
        let views = descriptors
            .iter()
            .filter(|(_, des)| des.nrows() > 0)
            .map(|(_, des)| des.view())
            .collect::<Vec<_>>();
        let data = if views.is_empty() {
            Array2::zeros((0, dim))
        } else {
            concatenate(Axis(0), &views).map_err(|e| Error::InvalidInput(e.to_string()))?
        };
        debug_assert_eq!(data.nrows(), ranges.total_rows());

        Ok(Self { forest: KdForest::build(data, opts), ranges, corpus_fingerprint })
    }

    pub fn ranges(&self) -> &RowRanges {
        &self.ranges
    }

    pub fn forest(&self) -> &KdForest {
        &self.forest
    }

    pub fn corpus_fingerprint(&self) -> &str {
        &self.corpus_fingerprint
    }

    pub fn set_checks(&mut self, checks: usize) {
        self.forest.set_checks(checks);
    }

    pub fn query(&self, queries: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        self.forest.knn_batch(queries, k)
    }
}
