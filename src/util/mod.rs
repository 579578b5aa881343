pub mod format;
pub mod path;
pub mod retry;

pub use format::format_size;
