//! Wire protocol: typed unicast datagrams and discovery-channel frames.
//!
//! Every unicast datagram is one JSON object discriminated by its `type`
//! field; unknown or malformed datagrams are logged and dropped by the
//! receiver. The multicast discovery channel instead carries bare ASCII
//! frames (`SERVER:<id>`, `CRASH:<id>`, `WHO_IS_LEADER`, `LEADER:<id>`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::QuorumcastError;

/// Server identity: its `host:port` string. Doubles as the ring sort key.
pub type ServerId = String;

/// Client identity string (a UUID minted by the client).
pub type ClientId = String;

/// Poll group name.
pub type GroupName = String;

/// Vote identity string (a UUID minted by the leader).
pub type VoteId = String;

/// Per-group FIFO sequence number.
pub type SeqNum = u64;

/// Max datagram size accepted on either endpoint.
pub const BUF: usize = 4096;

/// Probe travel direction around the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Left,
    Right,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Left => write!(f, "LEFT"),
            Direction::Right => write!(f, "RIGHT"),
        }
    }
}

/// One recorded ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub id: ClientId,
    pub vote: String,
}

/// Client registry entry as shipped in `REPL_STATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub token: String,
    pub addr: String,
}

/// Group entry as shipped in `REPL_STATE`; members normalized to a
/// sorted list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub owner: ClientId,
    pub members: Vec<ClientId>,
}

/// Vote bookkeeping as shipped in `REPL_STATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub group: GroupName,
    pub topic: String,
    pub options: Vec<String>,
    pub votes: Vec<Ballot>,
}

/// Pending FO-multicast entry as shipped in `REPL_STATE`. The deadline
/// is absolute wall-clock (unix millis) so the inheritor preserves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoPendingRecord {
    pub group: GroupName,
    #[serde(rename = "S")]
    pub seq: SeqNum,
    pub pending: Vec<ClientId>,
    pub deadline_ms: u64,
    pub msg: Box<WireMsg>,
    pub vote_id: Option<VoteId>,
}

/// Full authoritative state, shipped from the outgoing leader to the
/// new leader on handoff. All sets are normalized to sorted lists and
/// all maps are ordered, keeping the encoding deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FleetState {
    pub clients: BTreeMap<ClientId, ClientRecord>,
    pub groups: BTreeMap<GroupName, GroupRecord>,
    pub votes: BTreeMap<VoteId, VoteRecord>,
    #[serde(rename = "S")]
    pub seqnums: BTreeMap<GroupName, SeqNum>,
    pub fo_pending: Vec<FoPendingRecord>,
}

/// All typed unicast datagrams, server↔server and client↔leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMsg {
    // server <-> server
    #[serde(rename = "HS_ELECTION")]
    HsElection {
        id: ServerId,
        phase: u32,
        direction: Direction,
        hop: u64,
    },
    #[serde(rename = "HS_REPLY")]
    HsReply { id: ServerId, direction: Direction },
    #[serde(rename = "HS_LEADER")]
    HsLeader { id: ServerId },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { id: ServerId },
    #[serde(rename = "HEARTBEAT_ACK")]
    HeartbeatAck { id: ServerId },
    #[serde(rename = "REPL_REGISTER")]
    ReplRegister {
        id: ClientId,
        token: String,
        addr: String,
    },
    #[serde(rename = "REPL_GROUP")]
    ReplGroup {
        group: GroupName,
        owner: ClientId,
        members: Vec<ClientId>,
        #[serde(rename = "S")]
        seq: SeqNum,
    },
    #[serde(rename = "REPL_VOTE")]
    ReplVote {
        vote_id: VoteId,
        group: GroupName,
        topic: String,
        options: Vec<String>,
        timeout: u64,
        #[serde(rename = "S")]
        seq: SeqNum,
        sender: ServerId,
        deadline_ms: u64,
    },
    #[serde(rename = "REPL_STATE")]
    ReplState {
        #[serde(flatten)]
        state: FleetState,
    },
    #[serde(rename = "NEW_LEADER")]
    NewLeader { id: ServerId },

    // client -> leader
    #[serde(rename = "REGISTER")]
    Register { id: ClientId },
    #[serde(rename = "CREATE_GROUP")]
    CreateGroup {
        id: ClientId,
        token: String,
        group: GroupName,
    },
    #[serde(rename = "JOIN_GROUP")]
    JoinGroup {
        id: ClientId,
        token: String,
        group: GroupName,
    },
    #[serde(rename = "LEAVE_GROUP")]
    LeaveGroup {
        id: ClientId,
        token: String,
        group: GroupName,
    },
    #[serde(rename = "GET_GROUPS")]
    GetGroups {
        #[serde(default)]
        id: Option<ClientId>,
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename = "JOINED_GROUPS")]
    JoinedGroups { id: ClientId, token: String },
    #[serde(rename = "START_VOTE")]
    StartVote {
        id: ClientId,
        token: String,
        group: GroupName,
        topic: String,
        options: Vec<String>,
        timeout: u64,
    },
    #[serde(rename = "VOTE_ACK")]
    VoteAck {
        vote_id: VoteId,
        group: GroupName,
        #[serde(rename = "S")]
        seq: SeqNum,
        id: ClientId,
        vote: String,
        token: String,
    },

    // leader -> client
    #[serde(rename = "REGISTER_OK")]
    RegisterOk { token: String },
    #[serde(rename = "CREATE_GROUP_OK")]
    CreateGroupOk { group: GroupName },
    #[serde(rename = "JOIN_GROUP_OK")]
    JoinGroupOk { group: GroupName },
    #[serde(rename = "LEAVE_GROUP_OK")]
    LeaveGroupOk { group: GroupName },
    #[serde(rename = "GET_GROUPS_OK")]
    GetGroupsOk { groups: Vec<GroupName> },
    #[serde(rename = "JOINED_GROUPS_OK")]
    JoinedGroupsOk { groups: Vec<GroupName> },
    #[serde(rename = "START_VOTE_OK")]
    StartVoteOk {
        group: GroupName,
        topic: String,
        options: Vec<String>,
        timeout: u64,
    },
    #[serde(rename = "VOTE")]
    Vote {
        #[serde(rename = "S")]
        seq: SeqNum,
        sender: ServerId,
        vote_id: VoteId,
        group: GroupName,
        topic: String,
        options: Vec<String>,
    },
    #[serde(rename = "VOTE_RESULT")]
    VoteResult {
        vote_id: VoteId,
        group: GroupName,
        topic: String,
        winner: String,
    },
}

impl WireMsg {
    /// Encodes into one JSON datagram payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, QuorumcastError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a received datagram payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, QuorumcastError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Frames of the ASCII multicast discovery channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryFrame {
    /// Periodic presence beacon.
    Server(ServerId),
    /// Failure notice for a peer.
    Crash(ServerId),
    /// Client asking for the current leader.
    WhoIsLeader,
    /// Unicast reply to `WhoIsLeader`.
    Leader(ServerId),
}

impl DiscoveryFrame {
    /// Parses a discovery frame; `None` for anything unknown or with an
    /// empty id (the receiver logs and drops those).
    pub fn parse(text: &str) -> Option<Self> {
        if text == "WHO_IS_LEADER" {
            return Some(DiscoveryFrame::WhoIsLeader);
        }
        let (tag, id) = text.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match tag {
            "SERVER" => Some(DiscoveryFrame::Server(id.into())),
            "CRASH" => Some(DiscoveryFrame::Crash(id.into())),
            "LEADER" => Some(DiscoveryFrame::Leader(id.into())),
            _ => None,
        }
    }
}

impl fmt::Display for DiscoveryFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiscoveryFrame::Server(id) => write!(f, "SERVER:{}", id),
            DiscoveryFrame::Crash(id) => write!(f, "CRASH:{}", id),
            DiscoveryFrame::WhoIsLeader => write!(f, "WHO_IS_LEADER"),
            DiscoveryFrame::Leader(id) => write!(f, "LEADER:{}", id),
        }
    }
}
