use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::warn;

use crate::cli::{CorpusArgs, SubCommandExtend, print_result};
use crate::config::{OutputFormat, PipelineOptions, SearchOptions};
use crate::imdb::{Corpus, Prepared};
use crate::lookup::LookupStore;
use crate::{IMDB, Opts};

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    /// 被搜索的图片路径
    pub image: PathBuf,
    #[command(flatten)]
    pub corpus: CorpusArgs,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let (db, corpus) = self.corpus.open(opts, &self.pipeline)?;
        search_corpus(&db, &corpus, &self.image, &self.search, self.output_format)
    }
}

/// 准备产物、检索并输出结果
///
/// 没有要求按类别过滤时，分类器构建失败只会输出警告。
pub fn search_corpus(
    db: &IMDB,
    corpus: &Corpus,
    image: &Path,
    search: &SearchOptions,
    format: OutputFormat,
) -> Result<()> {
    let index = db.build_index(corpus).context("构建索引失败")?;

    let classification = if search.restrict_class {
        Some(db.classification(corpus).context("构建分类器失败")?)
    } else if !corpus.labels().is_empty() {
        db.classification(corpus)
            .map_err(|e| warn!("无法构建分类器，跳过分类: {}", e))
            .ok()
    } else {
        None
    };
    let prepared = Prepared { index, classification };

    let lookup = match search.lookup {
        true => db
            .open_lookup()
            .and_then(|lookup| db.build_lookup(corpus, &lookup).map(|_| lookup))
            .map_err(|e| warn!("{}，只使用近邻索引", e))
            .ok(),
        false => None,
    };

    let result = db
        .query(&prepared, image, search, lookup.as_ref().map(|l| l as &dyn LookupStore))
        .with_context(|| format!("检索 {} 失败", image.display()))?;
    print_result(&result, format)
}
