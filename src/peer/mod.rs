//! Peer-side engines: the upload engine serves inbound connections, the
//! download engine discovers peers through the tracker and pulls the
//! pieces the local bitmap lacks. Both share one [`FileSession`].
//!
//! [`FileSession`]: crate::session::FileSession

mod download;
mod server;

pub use download::Downloader;
pub use server::run_upload;
