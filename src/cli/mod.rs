mod classify;
mod clean;
mod index;
mod search;
mod train;
mod vocab;

pub use classify::*;
pub use clean::*;
pub use index::*;
pub use search::*;
pub use train::*;
pub use vocab::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::{Opts, OutputFormat, PipelineOptions};
use crate::imdb::{Corpus, QueryResult};
use crate::{IMDB, IMDBBuilder};

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> Result<()>;
}

#[derive(Parser, Debug, Clone)]
pub struct CorpusArgs {
    /// 图库目录
    pub corpus: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,png")]
    pub suffix: String,
}

impl CorpusArgs {
    /// 扫描图库并打开对应的产物目录
    pub fn open(&self, opts: &Opts, pipeline: &PipelineOptions) -> Result<(IMDB, Corpus)> {
        open_corpus(opts, &self.corpus, &self.suffix, pipeline)
    }
}

pub fn open_corpus(
    opts: &Opts,
    corpus: &Path,
    suffix: &str,
    pipeline: &PipelineOptions,
) -> Result<(IMDB, Corpus)> {
    let corpus_images =
        Corpus::scan(corpus, suffix).with_context(|| format!("扫描图库 {} 失败", corpus.display()))?;
    let db = IMDBBuilder::new(opts.conf_dir_for(corpus)).options(pipeline.clone()).open()?;
    Ok((db, corpus_images))
}

pub fn print_result(result: &QueryResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            if let Some(duplicate) = &result.duplicate {
                println!("# duplicate\t{}", duplicate);
            }
            if let Some(label) = &result.label {
                println!("# class\t{}", label);
            }
            if let Some((identity, score)) = &result.best_in_class {
                println!("# best\t{:.4}\t{}", score, identity);
            }
            for m in &result.matches {
                println!("{}\t{}", m.votes, m.identity);
            }
        }
    }
    Ok(())
}
