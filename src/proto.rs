use std::fmt;

use crate::PieceIndex;

/// A command line received by the tracker. Parse failures carry the
/// message the tracker echoes back as `ERROR <msg>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCommand {
    Register {
        file_id: String,
        port: u16,
        bitfield_hex: String,
    },
    GetPeers {
        file_id: String,
    },
    Update {
        file_id: String,
        piece_index: PieceIndex,
    },
}

impl TrackerCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first().copied() {
            Some("REGISTER") => {
                if tokens.len() < 4 {
                    return Err("Invalid REGISTER format".to_string());
                }
                let port = tokens[2]
                    .parse()
                    .map_err(|_| "Invalid REGISTER format".to_string())?;
                Ok(Self::Register {
                    file_id: tokens[1].to_string(),
                    port,
                    bitfield_hex: tokens[3].to_string(),
                })
            }
            Some("GETPEERS") => {
                if tokens.len() < 2 {
                    return Err("Invalid GETPEERS format".to_string());
                }
                Ok(Self::GetPeers {
                    file_id: tokens[1].to_string(),
                })
            }
            Some("UPDATE") => {
                if tokens.len() < 3 {
                    return Err("Invalid UPDATE format".to_string());
                }
                let piece_index = tokens[2]
                    .parse()
                    .map_err(|_| "Invalid UPDATE format".to_string())?;
                Ok(Self::Update {
                    file_id: tokens[1].to_string(),
                    piece_index,
                })
            }
            _ => Err("Unknown command".to_string()),
        }
    }
}

impl fmt::Display for TrackerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register {
                file_id,
                port,
                bitfield_hex,
            } => write!(f, "REGISTER {file_id} {port} {bitfield_hex}"),
            Self::GetPeers { file_id } => write!(f, "GETPEERS {file_id}"),
            Self::Update {
                file_id,
                piece_index,
            } => write!(f, "UPDATE {file_id} {piece_index}"),
        }
    }
}

/// A command line received by the upload engine after the handshake, or
/// the handshake itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Handshake { file_id: String },
    Bitfield { len: usize },
    Request { index: PieceIndex },
    Have { index: PieceIndex },
}

impl PeerCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first().copied() {
            Some("HANDSHAKE") if tokens.len() >= 2 => Ok(Self::Handshake {
                file_id: tokens[1].to_string(),
            }),
            Some("BITFIELD") if tokens.len() >= 2 => {
                let len = tokens[1]
                    .parse()
                    .map_err(|_| format!("invalid BITFIELD length: {}", tokens[1]))?;
                Ok(Self::Bitfield { len })
            }
            Some("REQUEST") if tokens.len() >= 2 => {
                let index = tokens[1]
                    .parse()
                    .map_err(|_| format!("invalid REQUEST index: {}", tokens[1]))?;
                Ok(Self::Request { index })
            }
            Some("HAVE") if tokens.len() >= 2 => {
                let index = tokens[1]
                    .parse()
                    .map_err(|_| format!("invalid HAVE index: {}", tokens[1]))?;
                Ok(Self::Have { index })
            }
            _ => Err(format!("unexpected command: {line}")),
        }
    }
}

impl fmt::Display for PeerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake { file_id } => write!(f, "HANDSHAKE {file_id}"),
            Self::Bitfield { len } => write!(f, "BITFIELD {len}"),
            Self::Request { index } => write!(f, "REQUEST {index}"),
            Self::Have { index } => write!(f, "HAVE {index}"),
        }
    }
}

/// `PIECE <index> <len>` header preceding a piece body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceHeader {
    pub index: PieceIndex,
    pub len: usize,
}

impl PieceHeader {
    /// Parses a downloader-side response line: either a `PIECE` header or
    /// an `ERROR` line, anything else being a protocol violation.
    pub fn parse(line: &str) -> Result<Self, String> {
        if let Some(msg) = line.strip_prefix("ERROR ") {
            return Err(msg.to_string());
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 || tokens[0] != "PIECE" {
            return Err(format!("expected PIECE header, got: {line}"));
        }
        let index = tokens[1]
            .parse()
            .map_err(|_| format!("invalid PIECE index: {}", tokens[1]))?;
        let len = tokens[2]
            .parse()
            .map_err(|_| format!("invalid PIECE length: {}", tokens[2]))?;
        Ok(Self { index, len })
    }
}

impl fmt::Display for PieceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PIECE {} {}", self.index, self.len)
    }
}

pub const HANDSHAKE_OK: &str = "HANDSHAKE_OK";
pub const OK: &str = "OK";

pub fn error_line(msg: &str) -> String {
    format!("ERROR {msg}")
}

pub fn peers_line(peers: &[std::net::SocketAddr]) -> String {
    let csv: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
    format!("PEERS {}", csv.join(","))
}

/// Parses a `PEERS a:p,b:q` reply; an empty list is a bare `PEERS`.
pub fn parse_peers_line(line: &str) -> Result<Vec<std::net::SocketAddr>, String> {
    let rest = line
        .strip_prefix("PEERS")
        .ok_or_else(|| format!("expected PEERS reply, got: {line}"))?
        .trim();
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    rest.split(',')
        .map(|addr| {
            addr.trim()
                .parse()
                .map_err(|_| format!("invalid peer address: {addr}"))
        })
        .collect()
}
