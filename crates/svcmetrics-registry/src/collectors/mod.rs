pub mod build_info;
pub mod process;
pub mod runtime;

pub use build_info::BuildInfo;
pub use process::ProcessCollector;
pub use runtime::RuntimeCollector;
