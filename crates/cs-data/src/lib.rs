pub mod results;
pub mod storage;

pub use results::*;
pub use storage::*;

use std::path::PathBuf;

/// Default root for pipeline directories when none is configured.
pub fn default_results_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chainsearch")
}
