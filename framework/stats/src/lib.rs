mod bench;
mod folder;
mod percentile;

pub mod prelude {
    pub use crate::bench::{BenchSettings, BenchState, BenchTarget, Benchmark};
    pub use crate::folder::Folder;
    pub use crate::percentile::{percentile, Summary};
}
