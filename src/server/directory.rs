//! Quorumcast server -- authoritative client/group/vote state.
//!
//! Everything the leader owns and replicates lives here: the client
//! registry, poll groups, open votes with their duplicate-suppression
//! index, per-group FIFO sequencers, and the FO-multicast pending
//! table. All mutations are plain synchronous methods so the whole
//! store is exercised in tests without sockets.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use rand::Rng;

use crate::protocol::{
    Ballot, ClientId, ClientRecord, FleetState, FoPendingRecord, GroupName,
    GroupRecord, SeqNum, VoteId, VoteRecord, WireMsg,
};
use crate::utils::QuorumcastError;

/// Winner sentinel for a vote that closed without any ballots.
pub const NO_WINNER: &str = "No votes, no winner";

/// One registered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    pub token: String,
    pub addr: SocketAddr,
}

/// One poll group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub owner: ClientId,
    pub members: HashSet<ClientId>,
}

/// One open (or finalizing) vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteState {
    pub group: GroupName,
    pub topic: String,
    pub options: Vec<String>,
    pub ballots: Vec<Ballot>,
}

/// One pending FO-multicast entry awaiting acks or its deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct FoEntry {
    /// Members still expected to ack; snapshot taken at send time.
    pub pending: HashSet<ClientId>,
    /// Absolute wall-clock deadline (unix millis).
    pub deadline_ms: u64,
    /// The message to retransmit, stored verbatim.
    pub msg: WireMsg,
    /// Vote to finalize once this entry finishes.
    pub vote_id: Option<VoteId>,
}

/// A finished FO entry swept out of the pending table.
#[derive(Debug, Clone, PartialEq)]
pub struct FoFinished {
    pub group: GroupName,
    pub seq: SeqNum,
    pub vote_id: Option<VoteId>,
}

/// The replicated application state of one server.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub clients: HashMap<ClientId, ClientEntry>,
    pub groups: HashMap<GroupName, GroupEntry>,
    pub votes: HashMap<VoteId, VoteState>,
    /// Duplicate-suppression index: who already cast in each vote.
    client_votes: HashMap<VoteId, HashSet<ClientId>>,
    /// Next FO sequence number per group.
    seqnums: HashMap<GroupName, SeqNum>,
    fo_pending: HashMap<(GroupName, SeqNum), FoEntry>,
}

/// Mints a cryptographically random 128-bit hex token.
fn mint_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Directory {
    pub fn new() -> Self {
        Directory::default()
    }

    // -- client registry --

    /// Registers (or re-registers) a client, minting a fresh token.
    pub fn register_client(&mut self, id: &str, addr: SocketAddr) -> String {
        let token = mint_token();
        self.clients.insert(
            id.to_string(),
            ClientEntry {
                token: token.clone(),
                addr,
            },
        );
        token
    }

    /// Installs a replicated registration verbatim.
    pub fn install_client(&mut self, id: &str, token: &str, addr: SocketAddr) {
        self.clients.insert(
            id.to_string(),
            ClientEntry {
                token: token.to_string(),
                addr,
            },
        );
    }

    /// Checks a presented token against the registry.
    pub fn check_token(&self, id: &str, token: &str) -> bool {
        self.clients
            .get(id)
            .map(|entry| entry.token == token)
            .unwrap_or(false)
    }

    pub fn client_addr(&self, id: &str) -> Option<SocketAddr> {
        self.clients.get(id).map(|entry| entry.addr)
    }

    // -- groups --

    /// Creates a group owned by (and containing) `owner`. The group's
    /// FO sequencer starts at 0.
    pub fn create_group(
        &mut self,
        owner: &str,
        name: &str,
    ) -> Result<(), QuorumcastError> {
        if self.groups.contains_key(name) {
            return Err(QuorumcastError::msg(format!(
                "group already exists: {}",
                name
            )));
        }
        self.groups.insert(
            name.to_string(),
            GroupEntry {
                owner: owner.to_string(),
                members: HashSet::from([owner.to_string()]),
            },
        );
        self.seqnums.insert(name.to_string(), 0);
        Ok(())
    }

    pub fn join_group(
        &mut self,
        id: &str,
        name: &str,
    ) -> Result<(), QuorumcastError> {
        match self.groups.get_mut(name) {
            Some(group) => {
                group.members.insert(id.to_string());
                Ok(())
            }
            None => Err(QuorumcastError::msg(format!(
                "group does not exist: {}",
                name
            ))),
        }
    }

    pub fn leave_group(
        &mut self,
        id: &str,
        name: &str,
    ) -> Result<(), QuorumcastError> {
        let group = self.groups.get_mut(name).ok_or_else(|| {
            QuorumcastError::msg(format!("group does not exist: {}", name))
        })?;
        if !group.members.remove(id) {
            return Err(QuorumcastError::msg(format!(
                "not a member of group {}",
                name
            )));
        }
        Ok(())
    }

    /// All group names, sorted.
    pub fn group_names(&self) -> Vec<GroupName> {
        let mut names: Vec<GroupName> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the groups `id` belongs to, sorted.
    pub fn joined_groups(&self, id: &str) -> Vec<GroupName> {
        let mut names: Vec<GroupName> = self
            .groups
            .iter()
            .filter(|(_, group)| group.members.contains(id))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_member(&self, id: &str, name: &str) -> bool {
        self.groups
            .get(name)
            .map(|group| group.members.contains(id))
            .unwrap_or(false)
    }

    /// Sorted member list, for replication records.
    pub fn member_list(&self, name: &str) -> Vec<ClientId> {
        let mut members: Vec<ClientId> = self
            .groups
            .get(name)
            .map(|group| group.members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Installs a replicated group snapshot verbatim.
    pub fn install_group(
        &mut self,
        name: &str,
        owner: &str,
        members: Vec<ClientId>,
        seq: SeqNum,
    ) {
        self.groups.insert(
            name.to_string(),
            GroupEntry {
                owner: owner.to_string(),
                members: members.into_iter().collect(),
            },
        );
        self.seqnums.insert(name.to_string(), seq);
    }

    // -- votes --

    /// Opens a new vote with an empty ballot box.
    pub fn open_vote(
        &mut self,
        vote_id: &str,
        group: &str,
        topic: &str,
        options: Vec<String>,
    ) {
        self.votes.insert(
            vote_id.to_string(),
            VoteState {
                group: group.to_string(),
                topic: topic.to_string(),
                options,
                ballots: vec![],
            },
        );
        self.client_votes
            .insert(vote_id.to_string(), HashSet::new());
    }

    pub fn vote(&self, vote_id: &str) -> Option<&VoteState> {
        self.votes.get(vote_id)
    }

    // -- FO-multicast pending table --

    /// The sequence number the next multicast in this group will carry.
    pub fn next_seq(&self, group: &str) -> SeqNum {
        self.seqnums.get(group).copied().unwrap_or(0)
    }

    /// Inserts a pending entry for `(group, seq)`: snapshots the current
    /// members as the pending-ack set, stores the message, and advances
    /// the group sequencer past `seq`. Returns the snapshot.
    pub fn fo_insert(
        &mut self,
        group: &str,
        seq: SeqNum,
        msg: WireMsg,
        deadline_ms: u64,
        vote_id: Option<VoteId>,
    ) -> Vec<ClientId> {
        let pending: HashSet<ClientId> = self
            .groups
            .get(group)
            .map(|g| g.members.clone())
            .unwrap_or_default();
        let snapshot: Vec<ClientId> = pending.iter().cloned().collect();
        self.fo_pending.insert(
            (group.to_string(), seq),
            FoEntry {
                pending,
                deadline_ms,
                msg,
                vote_id,
            },
        );
        let next = self.seqnums.entry(group.to_string()).or_insert(0);
        if *next <= seq {
            *next = seq + 1;
        }
        snapshot
    }

    /// One retransmission-scheduler pass: sweeps out finished entries
    /// (all acked, or past deadline) and lists the per-client
    /// retransmissions still owed for the live ones.
    pub fn fo_tick(
        &mut self,
        now_ms: u64,
    ) -> (Vec<(SocketAddr, WireMsg)>, Vec<FoFinished>) {
        let mut resends = vec![];
        let mut finished = vec![];

        for ((group, seq), entry) in &self.fo_pending {
            if entry.pending.is_empty() || now_ms > entry.deadline_ms {
                finished.push(FoFinished {
                    group: group.clone(),
                    seq: *seq,
                    vote_id: entry.vote_id.clone(),
                });
                continue;
            }
            for cid in &entry.pending {
                if let Some(addr) = self.client_addr(cid) {
                    resends.push((addr, entry.msg.clone()));
                }
            }
        }

        for fin in &finished {
            self.fo_pending.remove(&(fin.group.clone(), fin.seq));
        }
        (resends, finished)
    }

    /// Records a client's ballot carried on a `VOTE_ACK`. Validation
    /// order: pending entry must exist (else the ack is out of order),
    /// the vote must name a known option, and the client must not have
    /// cast already. Only a fully valid ack removes the client from the
    /// pending-ack set.
    pub fn record_vote_ack(
        &mut self,
        vote_id: &str,
        group: &str,
        seq: SeqNum,
        id: &str,
        vote: &str,
    ) -> Result<(), QuorumcastError> {
        if !self.fo_pending.contains_key(&(group.to_string(), seq)) {
            return Err(QuorumcastError::msg(format!(
                "out-of-order or unknown ack for {} seq={}",
                group, seq
            )));
        }
        let state = self.votes.get_mut(vote_id).ok_or_else(|| {
            QuorumcastError::msg(format!("unknown vote: {}", vote_id))
        })?;
        if !state.options.iter().any(|opt| opt == vote) {
            return Err(QuorumcastError::msg(format!(
                "invalid vote option '{}' for vote {}",
                vote, vote_id
            )));
        }
        let cast = self
            .client_votes
            .entry(vote_id.to_string())
            .or_default();
        if !cast.insert(id.to_string()) {
            return Err(QuorumcastError::msg(format!(
                "duplicate ballot from {} for vote {}",
                id, vote_id
            )));
        }
        state.ballots.push(Ballot {
            id: id.to_string(),
            vote: vote.to_string(),
        });
        if let Some(entry) =
            self.fo_pending.get_mut(&(group.to_string(), seq))
        {
            entry.pending.remove(id);
        }
        Ok(())
    }

    // -- handoff normalization --

    /// Exports the full state with sets normalized to sorted lists.
    pub fn export_state(&self) -> FleetState {
        let mut state = FleetState::default();
        for (cid, entry) in &self.clients {
            state.clients.insert(
                cid.clone(),
                ClientRecord {
                    token: entry.token.clone(),
                    addr: entry.addr.to_string(),
                },
            );
        }
        for (name, group) in &self.groups {
            state.groups.insert(
                name.clone(),
                GroupRecord {
                    owner: group.owner.clone(),
                    members: self.member_list(name),
                },
            );
        }
        for (vote_id, vote) in &self.votes {
            state.votes.insert(
                vote_id.clone(),
                VoteRecord {
                    group: vote.group.clone(),
                    topic: vote.topic.clone(),
                    options: vote.options.clone(),
                    votes: vote.ballots.clone(),
                },
            );
        }
        state.seqnums = self
            .seqnums
            .iter()
            .map(|(g, s)| (g.clone(), *s))
            .collect();
        let mut pending: Vec<&(GroupName, SeqNum)> =
            self.fo_pending.keys().collect();
        pending.sort();
        for key in pending {
            let entry = &self.fo_pending[key];
            let mut members: Vec<ClientId> =
                entry.pending.iter().cloned().collect();
            members.sort();
            state.fo_pending.push(FoPendingRecord {
                group: key.0.clone(),
                seq: key.1,
                pending: members,
                deadline_ms: entry.deadline_ms,
                msg: Box::new(entry.msg.clone()),
                vote_id: entry.vote_id.clone(),
            });
        }
        state
    }

    /// Replaces this directory with a shipped state, converting lists
    /// back into sets and rebuilding the duplicate-suppression index
    /// from the recorded ballots.
    pub fn import_state(
        &mut self,
        state: FleetState,
    ) -> Result<(), QuorumcastError> {
        self.clients.clear();
        for (cid, rec) in state.clients {
            let addr: SocketAddr = rec.addr.parse()?;
            self.clients.insert(
                cid,
                ClientEntry {
                    token: rec.token,
                    addr,
                },
            );
        }

        self.groups = state
            .groups
            .into_iter()
            .map(|(name, rec)| {
                (
                    name,
                    GroupEntry {
                        owner: rec.owner,
                        members: rec.members.into_iter().collect(),
                    },
                )
            })
            .collect();

        self.votes.clear();
        self.client_votes.clear();
        for (vote_id, rec) in state.votes {
            let cast: HashSet<ClientId> =
                rec.votes.iter().map(|b| b.id.clone()).collect();
            self.client_votes.insert(vote_id.clone(), cast);
            self.votes.insert(
                vote_id,
                VoteState {
                    group: rec.group,
                    topic: rec.topic,
                    options: rec.options,
                    ballots: rec.votes,
                },
            );
        }

        self.seqnums = state.seqnums.into_iter().collect();

        self.fo_pending.clear();
        for rec in state.fo_pending {
            self.fo_pending.insert(
                (rec.group, rec.seq),
                FoEntry {
                    pending: rec.pending.into_iter().collect(),
                    deadline_ms: rec.deadline_ms,
                    msg: *rec.msg,
                    vote_id: rec.vote_id,
                },
            );
        }
        Ok(())
    }
}

/// Tallies ballots and picks the winner: most ballots, ties broken by
/// earliest position in the original options list.
pub(crate) fn winner_of(options: &[String], ballots: &[Ballot]) -> String {
    if ballots.is_empty() {
        return NO_WINNER.to_string();
    }
    let mut winner = NO_WINNER.to_string();
    let mut best = 0usize;
    for option in options {
        let count = ballots.iter().filter(|b| &b.vote == option).count();
        if count > best {
            best = count;
            winner = option.clone();
        }
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn vote_msg(group: &str, seq: SeqNum) -> WireMsg {
        WireMsg::Vote {
            seq,
            sender: "10.0.0.1:5001".into(),
            vote_id: "v1".into(),
            group: group.into(),
            topic: "lunch".into(),
            options: vec!["A".into(), "B".into(), "C".into()],
        }
    }

    fn entry<'d>(
        dir: &'d Directory,
        group: &str,
        seq: SeqNum,
    ) -> Option<&'d FoEntry> {
        dir.fo_pending.get(&(group.to_string(), seq))
    }

    /// Directory with client x registered and group G created by x.
    fn base_dir() -> Directory {
        let mut dir = Directory::new();
        dir.register_client("x", addr(7001));
        dir.create_group("x", "G").unwrap();
        dir
    }

    #[test]
    fn token_minted_and_checked() {
        let mut dir = Directory::new();
        let token = dir.register_client("x", addr(7001));
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(dir.check_token("x", &token));
        assert!(!dir.check_token("x", "deadbeef"));
        assert!(!dir.check_token("y", &token));

        // re-registration mints a fresh token and invalidates the old
        let token2 = dir.register_client("x", addr(7002));
        assert_ne!(token, token2);
        assert!(!dir.check_token("x", &token));
        assert_eq!(dir.client_addr("x"), Some(addr(7002)));
    }

    #[test]
    fn duplicate_group_rejected_and_owner_kept() {
        let mut dir = base_dir();
        assert!(dir.create_group("y", "G").is_err());
        assert_eq!(dir.groups["G"].owner, "x");
    }

    #[test]
    fn owner_is_member_at_creation() {
        let dir = base_dir();
        assert!(dir.is_member("x", "G"));
        assert_eq!(dir.next_seq("G"), 0);
    }

    #[test]
    fn join_and_leave() {
        let mut dir = base_dir();
        assert!(dir.join_group("y", "G").is_ok());
        assert!(dir.is_member("y", "G"));
        assert!(dir.join_group("y", "NOPE").is_err());

        assert!(dir.leave_group("y", "G").is_ok());
        assert!(!dir.is_member("y", "G"));
        assert!(dir.leave_group("y", "G").is_err());
        assert!(dir.leave_group("y", "NOPE").is_err());
    }

    #[test]
    fn group_listings_sorted() {
        let mut dir = base_dir();
        dir.create_group("x", "B").unwrap();
        dir.create_group("x", "A").unwrap();
        assert_eq!(dir.group_names(), vec!["A", "B", "G"]);
        dir.join_group("y", "A").unwrap();
        assert_eq!(dir.joined_groups("y"), vec!["A"]);
        assert_eq!(dir.joined_groups("x"), vec!["A", "B", "G"]);
    }

    #[test]
    fn seqnums_strictly_monotone() {
        let mut dir = base_dir();
        let s0 = dir.next_seq("G");
        dir.fo_insert("G", s0, vote_msg("G", s0), 10_000, None);
        let s1 = dir.next_seq("G");
        dir.fo_insert("G", s1, vote_msg("G", s1), 10_000, None);
        assert_eq!((s0, s1), (0, 1));
        assert_eq!(dir.next_seq("G"), 2);
    }

    #[test]
    fn pending_snapshot_excludes_late_joiner() {
        let mut dir = base_dir();
        dir.register_client("y", addr(7002));
        dir.open_vote("v1", "G", "lunch", vec!["A".into(), "B".into()]);
        dir.fo_insert("G", 0, vote_msg("G", 0), u64::MAX, Some("v1".into()));

        // y joins mid-vote: accepted, but not added to the open entry
        dir.join_group("y", "G").unwrap();
        let entry = entry(&dir, "G", 0).unwrap();
        assert!(!entry.pending.contains("y"));
        assert!(entry.pending.contains("x"));
    }

    #[test]
    fn vote_ack_validation_chain() {
        let mut dir = base_dir();
        dir.open_vote("v1", "G", "lunch", vec!["A".into(), "B".into()]);
        dir.fo_insert("G", 0, vote_msg("G", 0), u64::MAX, Some("v1".into()));

        // out-of-order ack: no pending entry for that seq
        assert!(dir.record_vote_ack("v1", "G", 7, "x", "A").is_err());

        // unknown option rejected, client stays pending
        assert!(dir.record_vote_ack("v1", "G", 0, "x", "Z").is_err());
        assert!(entry(&dir, "G", 0).unwrap().pending.contains("x"));

        // valid ack recorded and pending cleared
        assert!(dir.record_vote_ack("v1", "G", 0, "x", "A").is_ok());
        assert!(!entry(&dir, "G", 0).unwrap().pending.contains("x"));
        assert_eq!(dir.vote("v1").unwrap().ballots.len(), 1);

        // duplicate ballot is a no-op on the ballot box
        assert!(dir.record_vote_ack("v1", "G", 0, "x", "B").is_err());
        assert_eq!(dir.vote("v1").unwrap().ballots.len(), 1);
    }

    #[test]
    fn fo_tick_retransmits_then_sweeps() {
        let mut dir = base_dir();
        dir.register_client("y", addr(7002));
        dir.join_group("y", "G").unwrap();
        dir.open_vote("v1", "G", "lunch", vec!["A".into(), "B".into()]);
        dir.fo_insert("G", 0, vote_msg("G", 0), 5_000, Some("v1".into()));

        // both members still owed a retransmission
        let (resends, finished) = dir.fo_tick(1_000);
        assert_eq!(resends.len(), 2);
        assert!(finished.is_empty());

        // all acked: swept as finished, carrying the vote id
        dir.record_vote_ack("v1", "G", 0, "x", "A").unwrap();
        dir.record_vote_ack("v1", "G", 0, "y", "B").unwrap();
        let (resends, finished) = dir.fo_tick(1_000);
        assert!(resends.is_empty());
        assert_eq!(
            finished,
            vec![FoFinished {
                group: "G".into(),
                seq: 0,
                vote_id: Some("v1".into()),
            }]
        );
        assert!(entry(&dir, "G", 0).is_none());
    }

    #[test]
    fn fo_deadline_sweeps_unacked() {
        let mut dir = base_dir();
        dir.open_vote("v1", "G", "lunch", vec!["A".into()]);
        dir.fo_insert("G", 0, vote_msg("G", 0), 5_000, Some("v1".into()));
        let (_, finished) = dir.fo_tick(5_001);
        assert_eq!(finished.len(), 1);
        assert!(entry(&dir, "G", 0).is_none());
    }

    #[test]
    fn winner_simple_majority() {
        let options = vec!["A".to_string(), "B".to_string()];
        let ballots = vec![
            Ballot {
                id: "p".into(),
                vote: "B".into(),
            },
            Ballot {
                id: "q".into(),
                vote: "B".into(),
            },
            Ballot {
                id: "r".into(),
                vote: "A".into(),
            },
        ];
        assert_eq!(winner_of(&options, &ballots), "B");
    }

    #[test]
    fn winner_tie_breaks_by_options_order() {
        let options =
            vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let ballots = vec![
            Ballot {
                id: "p".into(),
                vote: "C".into(),
            },
            Ballot {
                id: "q".into(),
                vote: "B".into(),
            },
            Ballot {
                id: "r".into(),
                vote: "A".into(),
            },
        ];
        assert_eq!(winner_of(&options, &ballots), "A");
    }

    #[test]
    fn winner_sentinel_without_ballots() {
        let options = vec!["A".to_string()];
        assert_eq!(winner_of(&options, &[]), NO_WINNER);
    }

    #[test]
    fn state_export_import_roundtrip() {
        let mut dir = base_dir();
        dir.register_client("y", addr(7002));
        dir.join_group("y", "G").unwrap();
        dir.open_vote("v1", "G", "lunch", vec!["A".into(), "B".into()]);
        dir.fo_insert("G", 0, vote_msg("G", 0), 99_000, Some("v1".into()));
        dir.record_vote_ack("v1", "G", 0, "x", "A").unwrap();

        let state = dir.export_state();
        let mut other = Directory::new();
        other.import_state(state.clone()).unwrap();

        // equal as mappings (invariant on handoff)
        assert_eq!(other.clients, dir.clients);
        assert_eq!(other.groups, dir.groups);
        assert_eq!(other.votes, dir.votes);
        assert_eq!(other.export_state(), state);

        // duplicate index rebuilt from ballots: x still cannot re-cast
        assert!(other
            .record_vote_ack("v1", "G", 0, "x", "B")
            .is_err());
        // but y still can
        assert!(other.record_vote_ack("v1", "G", 0, "y", "B").is_ok());
    }

    #[test]
    fn state_survives_wire_encoding() {
        let mut dir = base_dir();
        dir.open_vote("v1", "G", "lunch", vec!["A".into()]);
        dir.fo_insert("G", 0, vote_msg("G", 0), 99_000, Some("v1".into()));

        let msg = WireMsg::ReplState {
            state: dir.export_state(),
        };
        let decoded = WireMsg::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
