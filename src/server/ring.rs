//! Quorumcast server -- membership view and ring construction.

use std::collections::BTreeSet;

use crate::protocol::ServerId;

/// Membership view of the server fleet plus the derived ring neighbors.
/// The ring is rebuilt from the sorted member set on every change; the
/// neighbors are never stored as references into it.
#[derive(Debug, Clone)]
pub struct RingView {
    /// My own `host:port` id.
    pub me: ServerId,

    /// Known server ids. Always contains `me`.
    pub servers: BTreeSet<ServerId>,

    /// Ring neighbor toward descending ids (wrapping).
    pub left: Option<ServerId>,

    /// Ring neighbor toward ascending ids (wrapping).
    pub right: Option<ServerId>,

    /// Current leader, if any is known.
    pub leader: Option<ServerId>,
}

impl RingView {
    /// Creates a fresh single-member view.
    pub fn new(me: ServerId) -> Self {
        let mut view = RingView {
            me: me.clone(),
            servers: BTreeSet::from([me]),
            left: None,
            right: None,
            leader: None,
        };
        view.rebuild();
        view
    }

    /// Whether this node currently believes it is the leader.
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.leader.as_deref() == Some(self.me.as_str())
    }

    /// Recomputes `left`/`right` from the sorted member set. With a
    /// single member both neighbors point at self.
    pub fn rebuild(&mut self) {
        self.servers.insert(self.me.clone());
        let ordered: Vec<&ServerId> = self.servers.iter().collect();
        let n = ordered.len();
        let idx = ordered
            .iter()
            .position(|sid| **sid == self.me)
            .unwrap_or(0);
        self.left = Some(ordered[(idx + n - 1) % n].clone());
        self.right = Some(ordered[(idx + 1) % n].clone());
    }

    /// Adds a server id; returns true (and rebuilds the ring) if it was
    /// not yet in the view.
    pub fn add(&mut self, sid: &str) -> bool {
        if self.servers.contains(sid) {
            return false;
        }
        self.servers.insert(sid.to_string());
        self.rebuild();
        true
    }

    /// Removes a server id; self is never removed. Returns true (and
    /// rebuilds the ring) if the id was present.
    pub fn remove(&mut self, sid: &str) -> bool {
        if sid == self.me {
            return false;
        }
        if !self.servers.remove(sid) {
            return false;
        }
        self.rebuild();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_member_self_ring() {
        let view = RingView::new("10.0.0.1:5001".into());
        assert_eq!(view.left.as_deref(), Some("10.0.0.1:5001"));
        assert_eq!(view.right.as_deref(), Some("10.0.0.1:5001"));
    }

    #[test]
    fn two_member_ring() {
        let mut view = RingView::new("10.0.0.1:5001".into());
        assert!(view.add("10.0.0.1:5002"));
        assert_eq!(view.left.as_deref(), Some("10.0.0.1:5002"));
        assert_eq!(view.right.as_deref(), Some("10.0.0.1:5002"));
    }

    #[test]
    fn three_member_neighbors() {
        // sorted order: :5001, :5002, :5003
        let mut view = RingView::new("10.0.0.1:5002".into());
        view.add("10.0.0.1:5001");
        view.add("10.0.0.1:5003");
        assert_eq!(view.left.as_deref(), Some("10.0.0.1:5001"));
        assert_eq!(view.right.as_deref(), Some("10.0.0.1:5003"));

        // wrap-around at both ends
        let mut first = RingView::new("10.0.0.1:5001".into());
        first.add("10.0.0.1:5002");
        first.add("10.0.0.1:5003");
        assert_eq!(first.left.as_deref(), Some("10.0.0.1:5003"));
        assert_eq!(first.right.as_deref(), Some("10.0.0.1:5002"));
    }

    #[test]
    fn duplicate_add_is_noop() {
        let mut view = RingView::new("a:1".into());
        assert!(view.add("b:2"));
        assert!(!view.add("b:2"));
        assert_eq!(view.servers.len(), 2);
    }

    #[test]
    fn never_removes_self() {
        let mut view = RingView::new("a:1".into());
        view.add("b:2");
        assert!(!view.remove("a:1"));
        assert!(view.servers.contains("a:1"));
        assert!(view.remove("b:2"));
        assert_eq!(view.left.as_deref(), Some("a:1"));
    }

    #[test]
    fn leader_flag_derived() {
        let mut view = RingView::new("a:1".into());
        assert!(!view.is_leader());
        view.leader = Some("a:1".into());
        assert!(view.is_leader());
        view.leader = Some("b:2".into());
        assert!(!view.is_leader());
    }
}
