pub mod add;
pub mod daemon;
pub mod info;
pub mod init;
pub mod list;
pub mod remove;
pub mod sync;
pub mod version;

pub use add::Add;
pub use daemon::Daemon;
pub use info::Info;
pub use init::Init;
pub use list::List;
pub use remove::Remove;
pub use sync::SyncFile;
pub use version::Version;
