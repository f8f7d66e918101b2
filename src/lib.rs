pub mod cli;
pub mod config;
pub mod db;
pub mod descriptor;
pub mod error;
pub mod extract;
pub mod hamming;
pub mod ivf;
pub mod key;
pub mod kmodes;
mod metrics;
pub mod pipeline;
pub mod ranker;
mod server;
pub mod store;
pub mod utils;

pub use config::Opts;
pub use db::{PicDB, SearchMatch};
