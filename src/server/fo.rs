//! Quorumcast server -- FIFO reliable multicast and vote finalization.
//!
//! The leader stamps every `VOTE` with the group's next sequence number
//! and keeps retransmitting to members that have not acked, until the
//! pending set drains or the vote's deadline passes. Whichever happens
//! first finishes the entry and triggers finalization, making the
//! deadline the liveness guarantee for every vote.

use crate::protocol::{SeqNum, WireMsg};
use crate::utils::unix_ms;

use super::directory::winner_of;
use super::ServerNode;

// ServerNode FO-multicast logic
impl ServerNode {
    /// FO-multicasts a `VOTE` to a group: allocates the sequence
    /// number, snapshots the current members as the pending-ack set,
    /// stores the entry for retransmission, and unicasts to every
    /// member. Returns the sequence number and absolute deadline for
    /// the replication record.
    pub(super) async fn fo_multicast_vote(
        &mut self,
        group: &str,
        vote_id: &str,
        topic: &str,
        options: Vec<String>,
        timeout_s: u64,
    ) -> (SeqNum, u64) {
        let seq = self.dir.next_seq(group);
        let deadline_ms = unix_ms() + timeout_s.saturating_mul(1000);
        let msg = WireMsg::Vote {
            seq,
            sender: self.id.clone(),
            vote_id: vote_id.to_string(),
            group: group.to_string(),
            topic: topic.to_string(),
            options,
        };
        let pending = self.dir.fo_insert(
            group,
            seq,
            msg.clone(),
            deadline_ms,
            Some(vote_id.to_string()),
        );
        pf_debug!(
            "FO multicast {} seq={} to {} members",
            group,
            seq,
            pending.len()
        );

        for cid in pending {
            match self.dir.client_addr(&cid) {
                Some(addr) => self.send_msg(addr, &msg).await,
                None => pf_warn!("no known address for member {}", cid),
            }
        }
        (seq, deadline_ms)
    }

    /// One pass of the retransmission scheduler. Only the leader
    /// drives deliveries; followers hold their mirrored entries until
    /// leadership possibly lands on them.
    pub(super) async fn fo_retransmit_tick(&mut self) {
        if !self.view.is_leader() {
            return;
        }
        let (resends, finished) = self.dir.fo_tick(unix_ms());
        for (addr, msg) in resends {
            self.send_msg(addr, &msg).await;
        }
        for fin in finished {
            pf_info!("FO multicast completed: {}, seq={}", fin.group, fin.seq);
            if let Some(vote_id) = fin.vote_id {
                self.finalize_vote(&vote_id).await;
            }
        }
    }

    /// Tallies a finished vote and announces the winner to every
    /// current member of the group by best-effort unicast.
    pub(super) async fn finalize_vote(&self, vote_id: &str) {
        pf_info!("finalizing vote {}", vote_id);
        let Some(vote) = self.dir.vote(vote_id) else {
            pf_warn!("vote {} not found", vote_id);
            return;
        };

        let winner = winner_of(&vote.options, &vote.ballots);
        let result = WireMsg::VoteResult {
            vote_id: vote_id.to_string(),
            group: vote.group.clone(),
            topic: vote.topic.clone(),
            winner,
        };

        for cid in self.dir.member_list(&vote.group) {
            match self.dir.client_addr(&cid) {
                Some(addr) => self.send_msg(addr, &result).await,
                None => pf_warn!("no known address for member {}", cid),
            }
        }
    }
}
