use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::Opts;
use crate::cli::{CorpusArgs, SubCommandExtend};
use crate::config::{OutputFormat, PipelineOptions};
use crate::histogram;

#[derive(Parser, Debug, Clone)]
pub struct ClassifyCommand {
    /// 需要分类的图片路径
    pub image: PathBuf,
    #[command(flatten)]
    pub corpus: CorpusArgs,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for ClassifyCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let (db, corpus) = self.corpus.open(opts, &self.pipeline)?;
        let classification = db.classification(&corpus).context("构建分类器失败")?;

        let (_, descriptors) = db
            .detector()
            .detect_file(&self.image)
            .with_context(|| format!("读取图片 {} 失败", self.image.display()))?;
        let bins = histogram::encode(descriptors.view(), &classification.vocabulary)?;
        let label = classification.classifier.predict(&bins)?;
        let best = classification
            .training_set
            .best_in_class(&bins, label)?
            .map(|(item, score)| (item.identity.clone(), score));

        match self.output_format {
            OutputFormat::Json => {
                let value = serde_json::json!({ "label": label, "best_in_class": best });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            OutputFormat::Table => {
                println!("{}", label);
                if let Some((identity, score)) = best {
                    println!("{:.4}\t{}", score, identity);
                }
            }
        }
        Ok(())
    }
}
