use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use crate::Opts;
use crate::cli::{CorpusArgs, SubCommandExtend};
use crate::config::PipelineOptions;

#[derive(Parser, Debug, Clone)]
pub struct VocabCommand {
    #[command(flatten)]
    pub corpus: CorpusArgs,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
}

impl SubCommandExtend for VocabCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let (db, corpus) = self.corpus.open(opts, &self.pipeline)?;
        let vocab = db.build_vocabulary(&corpus).context("构建词汇表失败")?;
        info!(
            "词汇表 {} 构建完成: {} 个视觉词, 指纹 {}",
            self.pipeline.vocabulary.vocab_name,
            vocab.size(),
            &vocab.fingerprint()[..16]
        );
        Ok(())
    }
}
