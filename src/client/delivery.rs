//! Quorumcast client -- FIFO delivery state for FO-multicast.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{GroupName, SeqNum, ServerId, WireMsg};

/// Per-(group, sender) in-order delivery with holdback buffering.
/// Sequence `s` from a sender is delivered only after `0..s` all were;
/// early arrivals wait in the holdback buffer, late duplicates drop.
#[derive(Debug, Default)]
pub(super) struct DeliveryState {
    /// Next expected sequence per group per sender.
    next: HashMap<GroupName, HashMap<ServerId, SeqNum>>,

    /// Buffered future messages per group per sender.
    holdback: HashMap<GroupName, HashMap<ServerId, BTreeMap<SeqNum, WireMsg>>>,
}

impl DeliveryState {
    pub(super) fn new() -> Self {
        DeliveryState::default()
    }

    /// Accepts one received message and returns everything now
    /// deliverable, in order. Gaps buffer; duplicates return empty.
    pub(super) fn accept(
        &mut self,
        group: &str,
        sender: &str,
        seq: SeqNum,
        msg: WireMsg,
    ) -> Vec<WireMsg> {
        let next = self
            .next
            .entry(group.to_string())
            .or_default()
            .entry(sender.to_string())
            .or_insert(0);
        let holdback = self
            .holdback
            .entry(group.to_string())
            .or_default()
            .entry(sender.to_string())
            .or_default();

        if seq == *next {
            let mut delivered = vec![msg];
            *next += 1;
            // drain any consecutively buffered successors
            while let Some(buffered) = holdback.remove(next) {
                delivered.push(buffered);
                *next += 1;
            }
            delivered
        } else if seq > *next {
            holdback.insert(seq, msg);
            vec![]
        } else {
            // retransmission of something already delivered
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(group: &str, sender: &str, seq: SeqNum) -> WireMsg {
        WireMsg::Vote {
            seq,
            sender: sender.into(),
            vote_id: format!("v{}", seq),
            group: group.into(),
            topic: "t".into(),
            options: vec!["A".into()],
        }
    }

    fn seqs(delivered: &[WireMsg]) -> Vec<SeqNum> {
        delivered
            .iter()
            .map(|m| match m {
                WireMsg::Vote { seq, .. } => *seq,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn in_order_delivery() {
        let mut ds = DeliveryState::new();
        for seq in 0..3 {
            let out = ds.accept("G", "s:1", seq, vote("G", "s:1", seq));
            assert_eq!(seqs(&out), vec![seq]);
        }
    }

    #[test]
    fn gap_buffers_then_drains() {
        let mut ds = DeliveryState::new();
        assert!(ds.accept("G", "s:1", 2, vote("G", "s:1", 2)).is_empty());
        assert!(ds.accept("G", "s:1", 1, vote("G", "s:1", 1)).is_empty());
        let out = ds.accept("G", "s:1", 0, vote("G", "s:1", 0));
        assert_eq!(seqs(&out), vec![0, 1, 2]);
    }

    #[test]
    fn duplicates_dropped() {
        let mut ds = DeliveryState::new();
        assert_eq!(
            seqs(&ds.accept("G", "s:1", 0, vote("G", "s:1", 0))),
            vec![0]
        );
        assert!(ds.accept("G", "s:1", 0, vote("G", "s:1", 0)).is_empty());

        // buffered duplicate also collapses to one delivery
        assert!(ds.accept("G", "s:1", 2, vote("G", "s:1", 2)).is_empty());
        assert!(ds.accept("G", "s:1", 2, vote("G", "s:1", 2)).is_empty());
        let out = ds.accept("G", "s:1", 1, vote("G", "s:1", 1));
        assert_eq!(seqs(&out), vec![1, 2]);
    }

    #[test]
    fn senders_and_groups_independent() {
        let mut ds = DeliveryState::new();
        assert_eq!(
            seqs(&ds.accept("G", "s:1", 0, vote("G", "s:1", 0))),
            vec![0]
        );
        // a different sender in the same group starts from 0 again
        assert!(ds.accept("G", "s:2", 1, vote("G", "s:2", 1)).is_empty());
        assert_eq!(
            seqs(&ds.accept("G", "s:2", 0, vote("G", "s:2", 0))),
            vec![0, 1]
        );
        // a different group is its own sequence space
        assert_eq!(
            seqs(&ds.accept("H", "s:1", 0, vote("H", "s:1", 0))),
            vec![0]
        );
    }

    #[test]
    fn deliveries_strictly_contiguous() {
        // shuffled arrival with duplicates still yields 0,1,2,...
        let mut ds = DeliveryState::new();
        let arrivals = [3, 0, 3, 2, 5, 1, 0, 4];
        let mut delivered = vec![];
        for seq in arrivals {
            delivered
                .extend(seqs(&ds.accept("G", "s:1", seq, vote("G", "s:1", seq))));
        }
        assert_eq!(delivered, vec![0, 1, 2, 3, 4, 5]);
    }
}
