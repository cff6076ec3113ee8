//! A minimal peer-to-peer file distribution core: a central tracker for
//! peer discovery plus a peer engine that serves and downloads fixed-size
//! pieces of one shared file over a line-oriented TCP protocol.

pub mod bitfield;
pub mod config;
pub mod peer;
pub mod proto;
pub mod session;
pub mod store;
pub mod tracker;
pub mod wire;

/// Zero-based index of one piece of the shared file.
pub type PieceIndex = u32;

/// Every piece is this many bytes, except the final one which holds
/// whatever remains of the file.
pub const PIECE_SIZE: u32 = 65536;
