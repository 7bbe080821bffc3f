use std::sync::LazyLock;

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;

use imsearch_bow::Opts;
use imsearch_bow::cli::*;
use imsearch_bow::config::SubCommand;

static OPTS: LazyLock<Opts> = LazyLock::new(Opts::parse);

/// 不带子命令时，用图库检索一张图片
fn search_default(opts: &Opts) -> Result<()> {
    let image = opts.image.as_deref().context("缺少图片路径")?;
    let corpus = opts.corpus.as_deref().context("缺少图库目录")?;
    let (db, corpus) = open_corpus(opts, corpus, &opts.suffix, &opts.pipeline)?;
    search_corpus(&db, &corpus, image, &opts.search, opts.output_format)
}

fn main() -> Result<()> {
    env_logger::init();
    debug!("{:?}", *OPTS);

    match &OPTS.subcmd {
        Some(SubCommand::Vocab(config)) => config.run(&OPTS),
        Some(SubCommand::Train(config)) => config.run(&OPTS),
        Some(SubCommand::Index(config)) => config.run(&OPTS),
        Some(SubCommand::Search(config)) => config.run(&OPTS),
        Some(SubCommand::Classify(config)) => config.run(&OPTS),
        Some(SubCommand::Clean(config)) => config.run(&OPTS),
        None => search_default(&OPTS).context("检索失败"),
    }
}
