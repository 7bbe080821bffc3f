use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, UNIX_EPOCH};

use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{ConfDir, PipelineOptions, SearchOptions};
use crate::corpus::{self, CorpusImage};
use crate::dhash::d_hash;
use crate::error::{Error, Result};
use crate::histogram::{self, HistogramEncoder, TrainingSet};
use crate::index::CorpusIndex;
use crate::lookup::{LmdbLookup, LookupStore};
use crate::ranking::{self, Match};
use crate::store::{ArtifactCache, ArtifactStore, DirStore, INDEX_KEY};
use crate::surf::{DESCRIPTOR_DIM, SurfDetector};
use crate::svm::Classifier;
use crate::utils::{self, TimeMeasure, pb_style};
use crate::vocabulary::Vocabulary;

/// 打开查找表的超时时间
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(1500);
/// 记录查找表对应的图库指纹
const LOOKUP_KEY: &str = "lookup/corpus";

/// 一个图库：图片列表 + 按需提取的描述符
pub struct Corpus {
    images: Vec<CorpusImage>,
    descriptors: OnceLock<Vec<Array2<f32>>>,
}

impl Corpus {
    pub fn new(images: Vec<CorpusImage>) -> Self {
        Self { images, descriptors: OnceLock::new() }
    }

    pub fn scan(root: impl AsRef<Path>, suffix: &str) -> Result<Self> {
        Ok(Self::new(corpus::list_images(root, suffix)?))
    }

    pub fn images(&self) -> &[CorpusImage] {
        &self.images
    }

    pub fn labels(&self) -> Vec<String> {
        corpus::class_labels(&self.images)
    }

    /// 图库内容的指纹，图片增删或文件修改后会变化
    fn fingerprint(&self, opts: &PipelineOptions) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        for image in &self.images {
            hasher.update(image.identity().as_bytes());
            hasher.update(&[0]);
            if let Ok(meta) = fs::metadata(&image.path) {
                hasher.update(&meta.len().to_le_bytes());
                // 只记录到秒，不同文件系统的时间精度不同
                if let Some(mtime) = meta.modified().ok().and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
                    hasher.update(&mtime.as_secs().to_le_bytes());
                }
            }
        }
        let feature = serde_json::to_vec(&opts.feature).map_err(|e| Error::InvalidInput(e.to_string()))?;
        hasher.update(&feature);
        // checks 只影响查询，加载后再设置
        hasher.update(&(opts.index.trees as u64).to_le_bytes());
        hasher.update(&opts.index.seed.to_le_bytes());
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// 分类所需的全部产物
pub struct Classification {
    pub vocabulary: Vocabulary,
    pub training_set: TrainingSet,
    pub classifier: Classifier,
}

/// 查询前需要准备好的产物
pub struct Prepared {
    pub index: CorpusIndex,
    pub classification: Option<Classification>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// 按票数降序排列的图库图片
    pub matches: Vec<Match>,
    /// 分类器预测的类别
    pub label: Option<String>,
    /// 预测类别中直方图相关系数最高的图片
    pub best_in_class: Option<(String, f64)>,
    /// 查找表中 dHash 完全相同的图片
    pub duplicate: Option<String>,
}

pub struct IMDBBuilder {
    conf_dir: ConfDir,
    opts: PipelineOptions,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl IMDBBuilder {
    pub fn new(conf_dir: ConfDir) -> Self {
        Self { conf_dir, opts: PipelineOptions::default(), store: None }
    }

    pub fn options(mut self, opts: PipelineOptions) -> Self {
        self.opts = opts;
        self
    }

    /// 使用自定义的产物存储，默认存放在 `conf_dir/artifacts`
    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn open(self) -> Result<IMDB> {
        let store = match self.store {
            Some(store) => store,
            None => {
                fs::create_dir_all(self.conf_dir.path())?;
                Arc::new(DirStore::new(self.conf_dir.artifacts()))
            }
        };
        Ok(IMDB {
            detector: SurfDetector::create(self.opts.feature.clone()),
            cache: ArtifactCache::new(store),
            conf_dir: self.conf_dir,
            opts: self.opts,
        })
    }
}

pub struct IMDB {
    conf_dir: ConfDir,
    opts: PipelineOptions,
    cache: ArtifactCache,
    detector: SurfDetector,
}

impl IMDB {
    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn detector(&self) -> &SurfDetector {
        &self.detector
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.opts
    }

    /// 提取一张图库图片的描述符，读取或解码失败时返回空集合
    pub fn extract(&self, image: &CorpusImage) -> Array2<f32> {
        match fs::read(&image.path) {
            Ok(bytes) => self.detector.detect_bytes(&bytes).1,
            Err(e) => {
                warn!("读取图片 {} 失败，跳过: {}", image.path.display(), e);
                Array2::zeros((0, DESCRIPTOR_DIM))
            }
        }
    }

    /// 并行提取图库中所有图片的描述符，结果顺序与图库顺序一致
    pub fn descriptors<'a>(&self, corpus: &'a Corpus) -> &'a [Array2<f32>] {
        corpus.descriptors.get_or_init(|| {
            info!("提取 {} 张图片的特征", corpus.images.len());
            let pb = ProgressBar::new(corpus.images.len() as u64).with_style(pb_style());
            let result = corpus
                .images
                .par_iter()
                .progress_with(pb.clone())
                .map(|image| self.extract(image))
                .collect::<Vec<_>>();
            pb.finish_with_message("特征提取完成");
            result
        })
    }

    /// 构建视觉词汇表，同名词汇表已存在时直接加载
    pub fn build_vocabulary(&self, corpus: &Corpus) -> Result<Vocabulary> {
        Vocabulary::load_or_build(&self.cache, &self.opts.vocabulary, || {
            let views = self
                .descriptors(corpus)
                .iter()
                .filter(|d| d.nrows() > 0)
                .map(|d| d.view())
                .collect::<Vec<_>>();
            if views.is_empty() {
                return Err(Error::InvalidInput("no descriptors found in corpus".into()));
            }
            concatenate(Axis(0), &views).map_err(|e| Error::InvalidInput(e.to_string()))
        })
    }

    /// 计算图库中所有图片的直方图
    pub fn build_histograms(&self, vocab: &Vocabulary, corpus: &Corpus) -> Result<TrainingSet> {
        let encoder = HistogramEncoder::new(vocab, &self.cache);
        encoder.encode_all(corpus.images(), |i, image| match corpus.descriptors.get() {
            Some(descriptors) => descriptors[i].clone(),
            None => self.extract(image),
        })
    }

    /// 加载或训练分类器
    pub fn train(&self, vocab: &Vocabulary, training_set: &TrainingSet) -> Result<Classifier> {
        Classifier::load_or_train(&self.cache, vocab, training_set, &self.opts.classifier)
    }

    /// 加载或构建图库索引，图库变化后重新构建
    pub fn build_index(&self, corpus: &Corpus) -> Result<CorpusIndex> {
        let fingerprint = corpus.fingerprint(&self.opts)?;
        let mut index = self.cache.get_or_rebuild(
            INDEX_KEY,
            |index: &CorpusIndex| index.corpus_fingerprint() == fingerprint,
            || {
                let descriptors = corpus
                    .images
                    .iter()
                    .map(|image| image.identity())
                    .zip(self.descriptors(corpus).iter().cloned())
                    .collect::<Vec<_>>();
                CorpusIndex::build(descriptors, DESCRIPTOR_DIM, &self.opts.index, fingerprint.clone())
            },
        )?;
        index.ranges().validate()?;
        if index.ranges().total_rows() != index.forest().len() {
            return Err(Error::IndexMappingCorrupt {
                row: index.forest().len(),
                total_rows: index.ranges().total_rows(),
            });
        }
        index.set_checks(self.opts.index.checks);
        Ok(index)
    }

    /// 依次构建词汇表、直方图和分类器
    pub fn classification(&self, corpus: &Corpus) -> Result<Classification> {
        let vocabulary = self.build_vocabulary(corpus)?;
        let training_set = self.build_histograms(&vocabulary, corpus)?;
        let classifier = self.train(&vocabulary, &training_set)?;
        Ok(Classification { vocabulary, training_set, classifier })
    }

    /// 构建查询需要的全部产物
    pub fn prepare(&self, corpus: &Corpus, with_classifier: bool) -> Result<Prepared> {
        let index = self.build_index(corpus)?;
        let classification = match with_classifier {
            true => Some(self.classification(corpus)?),
            false => None,
        };
        Ok(Prepared { index, classification })
    }

    /// 用描述符在索引中检索，返回所有图库图片的票数
    pub fn search(
        &self,
        index: &CorpusIndex,
        descriptors: ArrayView2<f32>,
        opts: &SearchOptions,
    ) -> Result<Vec<Match>> {
        let neighbors = index.query(descriptors, opts.k.max(1))?;
        ranking::rank(&neighbors, index.ranges(), opts.ratio)
    }

    /// 预测描述符集合所属的类别
    pub fn classify(&self, classification: &Classification, descriptors: ArrayView2<f32>) -> Result<String> {
        let histogram = histogram::encode(descriptors, &classification.vocabulary)?;
        Ok(classification.classifier.predict(&histogram)?.to_string())
    }

    /// 完整的查询流程
    pub fn query(
        &self,
        prepared: &Prepared,
        image_path: impl AsRef<Path>,
        opts: &SearchOptions,
        lookup: Option<&dyn LookupStore>,
    ) -> Result<QueryResult> {
        let mut time = TimeMeasure::new();
        let image = utils::imread(image_path, self.opts.feature.max_size)?;

        let duplicate = lookup.and_then(|lookup| match lookup.get(&d_hash(&image)) {
            Ok(found) => found,
            Err(e) => {
                warn!("{}，只使用近邻索引", e);
                None
            }
        });

        let (_, descriptors) = time.measure("extract", || self.detector.detect_and_compute(&image));
        let mut matches = time.measure("search", || self.search(&prepared.index, descriptors.view(), opts))?;

        let (mut label, mut best_in_class) = (None, None);
        if let Some(classification) = &prepared.classification {
            let histogram = histogram::encode(descriptors.view(), &classification.vocabulary)?;
            let predicted = classification.classifier.predict(&histogram)?.to_string();
            best_in_class = classification
                .training_set
                .best_in_class(&histogram, &predicted)?
                .map(|(item, score)| (item.identity.clone(), score));
            if opts.restrict_class {
                matches = ranking::restrict_to_labels(matches, &predicted, |id| corpus::class_label_of(id));
            }
            label = Some(predicted);
        }
        matches.truncate(opts.count);

        debug!("extract time: {:.2?}", time.get("extract"));
        debug!("search time : {:.2?}", time.get("search"));
        Ok(QueryResult { matches, label, best_in_class, duplicate })
    }

    /// 打开查找表，失败时返回 [`Error::LookupUnavailable`]
    pub fn open_lookup(&self) -> Result<LmdbLookup> {
        LmdbLookup::open(self.conf_dir.lookup(), LOOKUP_TIMEOUT)
    }

    /// 把图库中每张图片的 dHash 写入查找表，图库未变化时跳过
    pub fn build_lookup(&self, corpus: &Corpus, lookup: &dyn LookupStore) -> Result<()> {
        let fingerprint = corpus.fingerprint(&self.opts)?;
        self.cache.get_or_rebuild(
            LOOKUP_KEY,
            |fp: &String| *fp == fingerprint,
            || {
                info!("写入 {} 张图片的 dHash", corpus.images.len());
                lookup.clear()?;
                let hashes = corpus
                    .images
                    .par_iter()
                    .filter_map(|image| match utils::imread(&image.path, self.opts.feature.max_size) {
                        Ok(gray) => Some((d_hash(&gray), image.identity())),
                        Err(e) => {
                            warn!("读取图片 {} 失败，跳过: {}", image.path.display(), e);
                            None
                        }
                    })
                    .collect::<Vec<_>>();
                lookup.put_all(&hashes)?;
                Ok(fingerprint.clone())
            },
        )?;
        Ok(())
    }

    /// 删除 `prefix` 下的产物，为空时删除全部产物和查找表
    pub fn clean(&self, prefix: &str) -> Result<()> {
        self.cache.store().remove(prefix)?;
        if prefix.is_empty() {
            let lookup = self.conf_dir.lookup();
            if lookup.exists() {
                fs::remove_dir_all(lookup)?;
            }
        }
        Ok(())
    }
}
