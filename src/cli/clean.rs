use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::config::PipelineOptions;
use crate::store::{INDEX_KEY, MODEL_KEY, TRAINING_KEY};
use crate::{IMDBBuilder, Opts};

#[derive(Parser, Debug, Clone)]
pub struct CleanCommand {
    /// 图库目录
    pub corpus: PathBuf,
    /// 删除所有词汇表
    #[arg(long)]
    pub vocabulary: bool,
    /// 删除直方图和训练集
    #[arg(long)]
    pub histograms: bool,
    /// 删除分类器模型
    #[arg(long)]
    pub model: bool,
    /// 删除近邻索引
    #[arg(long)]
    pub index: bool,
}

impl CleanCommand {
    fn prefixes(&self) -> Vec<&'static str> {
        let mut prefixes = vec![];
        if self.vocabulary {
            prefixes.push("vocabulary");
        }
        if self.histograms {
            prefixes.extend(["histograms", TRAINING_KEY]);
        }
        if self.model {
            prefixes.push(MODEL_KEY);
        }
        if self.index {
            prefixes.push(INDEX_KEY);
        }
        if prefixes.is_empty() {
            // 没有指定时清理全部
            prefixes.push("");
        }
        prefixes
    }
}

impl SubCommandExtend for CleanCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let db = IMDBBuilder::new(opts.conf_dir_for(&self.corpus))
            .options(PipelineOptions::default())
            .open()?;
        info!("清理缓存中……");
        for prefix in self.prefixes() {
            db.clean(prefix)?;
        }
        info!("清理完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes() {
        let cmd = CleanCommand::try_parse_from(["clean", "corpus"]).unwrap();
        assert_eq!(cmd.prefixes(), [""]);
        let cmd = CleanCommand::try_parse_from(["clean", "corpus", "--histograms", "--index"]).unwrap();
        assert_eq!(cmd.prefixes(), ["histograms", TRAINING_KEY, INDEX_KEY]);
    }
}
