use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::file::FileId;
use crate::filter::Filter;
use crate::network::FilterServerMap;
use crate::predicate::Predicate;
use crate::spec::PieceSpecSet;

/// Records carried on the NOTICE stream of a connection.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Notice {
    /// The sender claims to hold these pieces.
    Available(PieceSpecSet),
    /// The file was removed at the sender.
    Removed(FileId),
}

/// Records carried on the REQUEST stream of a connection. The first record
/// each direction is the sender's predicate; everything after is a demand
/// for pieces.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Request {
    Handshake(Predicate),
    Pieces(PieceSpecSet),
}

/// One TCP exchange with a tracker: the client sends its filter and server
/// address, the tracker replies with the topology and the UDP address for
/// offline reports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerQuery {
    pub filter: Filter,
    pub server: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerReply {
    pub network: FilterServerMap,
    pub reporting: SocketAddr,
}
