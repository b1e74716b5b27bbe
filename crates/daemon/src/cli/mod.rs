pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Add, Daemon, Info, Init, List, Remove, SyncFile, Version};
