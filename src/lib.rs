pub mod cli;
pub mod config;
pub mod corpus;
pub mod dhash;
mod error;
pub mod histogram;
pub mod imdb;
pub mod index;
pub mod kdtree;
pub mod kmeans;
pub mod lookup;
pub mod ranking;
pub mod store;
pub mod surf;
pub mod svm;
pub mod utils;
pub mod vocabulary;

pub use config::Opts;
pub use error::{Error, Result};
pub use imdb::{IMDB, IMDBBuilder};
