//! Public interface to the Quorumcast core library, linked by both the
//! server executable and the client executable.

#[macro_use]
mod utils;

mod client;
mod protocol;
mod server;

pub use client::{ClientConfig, ClientStub, PendingVote};
pub use protocol::{
    Ballot, ClientId, Direction, DiscoveryFrame, FleetState, GroupName,
    SeqNum, ServerId, VoteId, WireMsg, BUF,
};
pub use server::{ServerConfig, ServerNode};
pub use utils::{logger_init, me, set_me, unix_ms, QuorumcastError, Timer, ME};
