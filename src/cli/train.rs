use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use crate::Opts;
use crate::cli::{CorpusArgs, SubCommandExtend};
use crate::config::PipelineOptions;

#[derive(Parser, Debug, Clone)]
pub struct TrainCommand {
    #[command(flatten)]
    pub corpus: CorpusArgs,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
}

impl SubCommandExtend for TrainCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let (db, corpus) = self.corpus.open(opts, &self.pipeline)?;
        let labels = corpus.labels();
        info!("图库中共有 {} 个类别", labels.len());

        let vocab = db.build_vocabulary(&corpus).context("构建词汇表失败")?;
        let training_set = db.build_histograms(&vocab, &corpus).context("计算直方图失败")?;
        let classifier = db.train(&vocab, &training_set).context("训练分类器失败")?;
        if let Some(model) = classifier.model() {
            info!("分类器训练完成，类别: {}", model.labels().join(", "));
        }
        Ok(())
    }
}
