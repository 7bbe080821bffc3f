use thiserror::Error;

/// 检索流水线中所有可能出现的错误
#[derive(Debug, Error)]
pub enum Error {
    /// 缺少必要的数据，例如没有任何训练描述符
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// 描述符、直方图、模型之间的维度不一致
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 在分类器训练完成之前进行预测
    #[error("classifier model has not been trained")]
    ModelNotTrained,

    /// 近邻行号不属于任何图片区间，说明索引和区间映射不匹配
    #[error("row {row} is not covered by any image range (total rows: {total_rows})")]
    IndexMappingCorrupt { row: usize, total_rows: usize },

    /// 外部查找存储不可用
    #[error("lookup store unavailable: {0}")]
    LookupUnavailable(String),

    /// 缓存的产物与当前词汇表指纹不一致，拒绝混用
    #[error("stale artifact {key}: built against a different vocabulary")]
    StaleArtifact { key: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn check_dim(expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(Error::DimensionMismatch { expected, actual });
        }
        Ok(())
    }
}
