use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::cli::*;

static CACHE_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    ProjectDirs::from("", "imsearch", "imsearch-bow")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("imsearch-bow"))
});

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureOptions {
    /// Fast-Hessian 响应阈值，像素值归一化到 [0, 1] 后计算
    #[arg(long, value_name = "THRESHOLD", default_value_t = 0.0004)]
    pub hessian_threshold: f32,
    /// 尺度金字塔的组数
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub octaves: usize,
    /// 第一组的采样步长，后续每组翻倍
    #[arg(long, value_name = "STEP", default_value_t = 2)]
    pub init_step: usize,
    /// 每张图片最多保留的特征点数量，按响应强度排序
    #[arg(short = 'n', long, value_name = "N", default_value_t = 1000)]
    pub max_features: usize,
    /// 不计算主方向，描述符不具备旋转不变性，但更快
    #[arg(long)]
    pub upright: bool,
    /// 图片最大尺寸，宽或高超过这个尺寸时等比缩放
    #[arg(short = 'S', long, value_name = "WIDTHxHEIGHT", value_parser = parse_size, default_value = "1920x1080")]
    pub max_size: (u32, u32),
}

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyOptions {
    /// 视觉词汇数量，即聚类中心数量
    #[arg(short = 'K', long, value_name = "K", default_value_t = 2500)]
    pub vocab_size: usize,
    /// 词汇表名称，同名词汇表只会构建一次
    #[arg(long, value_name = "NAME", default_value = "default")]
    pub vocab_name: String,
    /// 使用不同随机种子重复聚类的次数，保留最紧凑的结果
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub attempts: usize,
    /// 每次聚类的最大迭代次数
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub max_iter: usize,
    /// 聚类中心最大位移小于该值时认为收敛
    #[arg(long, value_name = "EPS", default_value_t = 0.001)]
    pub epsilon: f32,
    /// 随机种子
    #[arg(long, value_name = "SEED", default_value_t = 42)]
    pub seed: u64,
}

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOptions {
    /// SVM 正则化系数 C
    #[arg(id = "svm_c", long = "svm-c", value_name = "C", default_value_t = 10.0)]
    pub c: f64,
    /// RBF 核带宽参数 gamma
    #[arg(id = "svm_gamma", long = "svm-gamma", value_name = "GAMMA", default_value_t = 10.0)]
    pub gamma: f64,
    /// SMO 停止条件
    #[arg(id = "svm_tol", long = "svm-tol", value_name = "TOL", default_value_t = 1e-3)]
    pub tol: f64,
    /// SMO 最大迭代次数
    #[arg(id = "svm_max_iter", long = "svm-max-iter", value_name = "N", default_value_t = 100_000)]
    pub max_iter: usize,
}

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// kd 森林中随机 kd 树的数量
    #[arg(long, value_name = "N", default_value_t = 8)]
    pub trees: usize,
    /// 每次查询最多检查的叶子点数量，越大越精确
    #[arg(long, value_name = "N", default_value_t = 128)]
    pub checks: usize,
    /// 构建 kd 树时使用的随机种子
    #[arg(id = "index_seed", long = "index-seed", value_name = "SEED", default_value_t = 7)]
    pub seed: u64,
}

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// 每个查询描述符找到的最近邻数量，比率测试至少需要 2
    #[arg(short, value_name = "K", default_value_t = 2, value_parser = parse_knn)]
    pub k: usize,
    /// 比率测试阈值，最近距离必须不大于次近距离的该倍数
    #[arg(long, value_name = "RATIO", default_value_t = 0.6)]
    pub ratio: f32,
    /// 显示的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = 10)]
    pub count: usize,
    /// 先用分类器预测类别，只保留该类别中的图片
    #[arg(long)]
    pub restrict_class: bool,
    /// 使用 LMDB 查找表加速完全重复图片的检索
    #[arg(long)]
    pub lookup: bool,
}

macro_rules! impl_default_from_args {
    ($($ty:ty),*) => {
        $(
            impl Default for $ty {
                fn default() -> Self {
                    Self::parse_from(["imsearch-bow"])
                }
            }
        )*
    };
}

impl_default_from_args!(
    FeatureOptions,
    VocabularyOptions,
    ClassifierOptions,
    IndexOptions,
    SearchOptions
);

/// 完整流水线需要的全部参数
#[derive(Parser, Debug, Clone, Default)]
pub struct PipelineOptions {
    #[command(flatten)]
    pub feature: FeatureOptions,
    #[command(flatten)]
    pub vocabulary: VocabularyOptions,
    #[command(flatten)]
    pub classifier: ClassifierOptions,
    #[command(flatten)]
    pub index: IndexOptions,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "imsearch-bow",
    version,
    subcommand_negates_reqs = true,
    args_conflicts_with_subcommands = true
)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: Option<SubCommand>,
    /// 产物缓存目录，默认按图库路径放在用户缓存目录下
    #[arg(short, long, global = true)]
    pub conf_dir: Option<ConfDir>,
    /// 被搜索的图片路径
    #[arg(required = true)]
    pub image: Option<PathBuf>,
    /// 图库目录
    #[arg(required = true)]
    pub corpus: Option<PathBuf>,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,png")]
    pub suffix: String,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl Opts {
    /// 返回图库对应的产物目录，命令行指定时优先
    pub fn conf_dir_for(&self, corpus: &Path) -> ConfDir {
        match &self.conf_dir {
            Some(conf_dir) => conf_dir.clone(),
            None => ConfDir::for_corpus(corpus),
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 从图库中提取特征并构建视觉词汇表
    Vocab(VocabCommand),
    /// 计算词袋直方图并训练分类器
    Train(TrainCommand),
    /// 构建图库描述符的近邻索引
    Index(IndexCommand),
    /// 从图库中搜索相似图片
    Search(SearchCommand),
    /// 预测图片所属类别
    Classify(ClassifyCommand),
    /// 删除缓存的产物
    Clean(CleanCommand),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 每个图库一个独立目录，目录名为图库绝对路径的哈希
    pub fn for_corpus(corpus: &Path) -> Self {
        let corpus = corpus.canonicalize().unwrap_or_else(|_| corpus.to_path_buf());
        let hash = blake3::hash(corpus.to_string_lossy().as_bytes());
        Self { path: CACHE_DIR.join(&hash.to_hex()[..16]) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回产物存储目录
    pub fn artifacts(&self) -> PathBuf {
        self.path.join("artifacts")
    }

    /// 返回 LMDB 查找表目录
    pub fn lookup(&self) -> PathBuf {
        self.path.join("lookup")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

fn parse_size(s: &str) -> anyhow::Result<(u32, u32)> {
    let parts: Vec<&str> = s.split('x').collect();
    if parts.len() != 2 {
        return Err(anyhow::anyhow!("无效的尺寸: {}", s));
    }
    Ok((parts[0].parse()?, parts[1].parse()?))
}

fn parse_knn(s: &str) -> anyhow::Result<usize> {
    let k = s.parse()?;
    if k < 2 {
        return Err(anyhow::anyhow!("近邻数量至少为 2，否则无法进行比率测试"));
    }
    Ok(k)
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Json,
    Table,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SearchOptions::default();
        assert_eq!(opts.k, 2);
        assert!((opts.ratio - 0.6).abs() < f32::EPSILON);
        assert_eq!(opts.count, 10);
        assert_eq!(VocabularyOptions::default().vocab_size, 2500);
        assert_eq!(FeatureOptions::default().max_size, (1920, 1080));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("640x480").unwrap(), (640, 480));
        assert!(parse_size("640").is_err());
        assert!(parse_size("ax480").is_err());
    }

    #[test]
    fn test_knn_needs_two_neighbors() {
        assert!(SearchOptions::try_parse_from(["imsearch-bow", "-k", "1"]).is_err());
        assert!(SearchOptions::try_parse_from(["imsearch-bow", "-k", "0"]).is_err());
        let opts = SearchOptions::try_parse_from(["imsearch-bow", "-k", "3"]).unwrap();
        assert_eq!(opts.k, 3);
    }

    #[test]
    fn test_opts_positional() {
        let opts = Opts::try_parse_from(["imsearch-bow", "q.png", "corpus"]).unwrap();
        assert!(opts.subcmd.is_none());
        assert_eq!(opts.image, Some(PathBuf::from("q.png")));
        assert_eq!(opts.corpus, Some(PathBuf::from("corpus")));
    }

    #[test]
    fn test_opts_arg_count() {
        assert!(Opts::try_parse_from(["imsearch-bow", "q.png"]).is_err());
        assert!(Opts::try_parse_from(["imsearch-bow", "q.png", "a", "b"]).is_err());
        assert!(Opts::try_parse_from(["imsearch-bow"]).is_err());
    }

    #[test]
    fn test_opts_subcommand() {
        let opts = Opts::try_parse_from(["imsearch-bow", "vocab", "-c", "/tmp/x", "corpus"]).unwrap();
        assert!(matches!(opts.subcmd, Some(SubCommand::Vocab(_))));
        assert_eq!(opts.conf_dir, Some(ConfDir::new("/tmp/x")));
    }

    #[test]
    fn test_conf_dir_for_corpus_is_stable() {
        let a = ConfDir::for_corpus(Path::new("/nonexistent/corpus"));
        let b = ConfDir::for_corpus(Path::new("/nonexistent/corpus"));
        let c = ConfDir::for_corpus(Path::new("/nonexistent/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
