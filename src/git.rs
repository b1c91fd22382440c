pub mod fast_import;
mod handle;
pub mod marks;
mod process;
mod sink;

pub use handle::{Backend, FastImportBackend, ProcessHandle};
pub use process::FastImportProcess;
pub use sink::DryRunSink;
