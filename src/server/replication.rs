//! Quorumcast server -- leader-to-follower replication and handoff.
//!
//! Mutating handlers on the leader emit incremental `REPL_*` records to
//! every other server; a leader being replaced ships its entire state
//! as one `REPL_STATE`. Followers mirror enough (including pending
//! multicasts with their original deadlines) to take over even when
//! the previous leader died without a handoff.

use std::net::SocketAddr;

use crate::protocol::{
    FleetState, GroupName, SeqNum, ServerId, VoteId, WireMsg,
};

use super::ServerNode;

// ServerNode replication logic
impl ServerNode {
    /// Sends a replication record to every other server in the view.
    pub(super) async fn bcast_repl(&self, msg: WireMsg) {
        let peers: Vec<ServerId> = self
            .view
            .servers
            .iter()
            .filter(|sid| **sid != self.id)
            .cloned()
            .collect();
        for sid in peers {
            self.send_to_server(&sid, &msg).await;
        }
    }

    /// Outgoing leader shipping its full state to the new leader.
    pub(super) async fn send_repl_state(&self, new_leader: &str) {
        pf_info!("shipping authoritative state to {}", new_leader);
        let msg = WireMsg::ReplState {
            state: self.dir.export_state(),
        };
        self.send_to_server(new_leader, &msg).await;
    }

    /// Follower applying a replicated registration.
    pub(super) fn apply_repl_register(
        &mut self,
        id: &str,
        token: &str,
        addr: &str,
    ) {
        match addr.parse::<SocketAddr>() {
            Ok(addr) => {
                pf_debug!("replicated registration of client {}", id);
                self.dir.install_client(id, token, addr);
            }
            Err(e) => pf_warn!("bad addr in REPL_REGISTER: {}", e),
        }
    }

    /// Follower applying a replicated vote: mirrors the vote record and
    /// the pending multicast entry, so the vote can still retransmit
    /// and finalize if leadership lands here.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn apply_repl_vote(
        &mut self,
        vote_id: VoteId,
        group: GroupName,
        topic: String,
        options: Vec<String>,
        seq: SeqNum,
        sender: ServerId,
        deadline_ms: u64,
    ) {
        pf_debug!("replicated vote {} in group {}", vote_id, group);
        self.dir
            .open_vote(&vote_id, &group, &topic, options.clone());
        let msg = WireMsg::Vote {
            seq,
            sender,
            vote_id: vote_id.clone(),
            group: group.clone(),
            topic,
            options,
        };
        self.dir
            .fo_insert(&group, seq, msg, deadline_ms, Some(vote_id));
    }

    /// New leader applying the outgoing leader's full state, then
    /// repointing every client at itself.
    pub(super) async fn apply_repl_state(&mut self, state: FleetState) {
        match self.dir.import_state(state) {
            Ok(()) => {
                pf_info!("applied authoritative state from outgoing leader");
                self.on_promoted().await;
            }
            Err(e) => pf_error!("failed to apply REPL_STATE: {}", e),
        }
    }
}
