use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use crate::Opts;
use crate::cli::{CorpusArgs, SubCommandExtend};
use crate::config::PipelineOptions;

#[derive(Parser, Debug, Clone)]
pub struct IndexCommand {
    #[command(flatten)]
    pub corpus: CorpusArgs,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
    /// 同时把图片的 dHash 写入 LMDB 查找表
    #[arg(long)]
    pub lookup: bool,
}

impl SubCommandExtend for IndexCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let (db, corpus) = self.corpus.open(opts, &self.pipeline)?;
        let index = db.build_index(&corpus).context("构建索引失败")?;
        info!("索引构建完成: {} 张图片, {} 个描述符", index.ranges().len(), index.forest().len());

        if self.lookup {
            match db.open_lookup() {
                Ok(lookup) => db.build_lookup(&corpus, &lookup).context("写入查找表失败")?,
                Err(e) => warn!("{}", e),
            }
        }
        Ok(())
    }
}
