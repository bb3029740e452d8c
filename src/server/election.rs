//! Quorumcast server -- Hirschberg-Sinclair leader election.
//!
//! Bidirectional variant: each phase probes both neighbors at distance
//! `2^phase` and waits for both replies before doubling. The node with
//! the largest id wins. All functions here only mutate the view and
//! election state and return the `(target, message)` pairs to transmit,
//! so the state machine is exercised without sockets.

use std::cmp::Ordering;

use tokio::sync::watch;
use tokio::time::Duration;

use crate::protocol::{Direction, ServerId, WireMsg};
use crate::server::ring::RingView;

/// Outgoing transmissions produced by one election step.
pub(crate) type Sends = Vec<(ServerId, WireMsg)>;

/// Election bookkeeping for one node.
#[derive(Debug)]
pub struct ElectionState {
    /// Current probe phase; distance is `2^phase`.
    pub phase: u32,

    /// Outstanding replies to my own probes, 0..=2.
    pub pending_replies: u8,

    /// Whether an election round is currently running.
    pub in_progress: bool,

    // one-shot latch flipped when an election round settles
    done_tx: watch::Sender<bool>,
}

impl Default for ElectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ElectionState {
    pub fn new() -> Self {
        let (done_tx, _) = watch::channel(false);
        ElectionState {
            phase: 0,
            pending_replies: 0,
            in_progress: false,
            done_tx,
        }
    }

    fn signal_done(&self) {
        self.done_tx.send_replace(true);
    }

    fn clear_done(&self) {
        self.done_tx.send_replace(false);
    }

    /// Watch handle on the done latch, for bounded waits on manually
    /// triggered elections and for the settle watchdog.
    pub fn done_watch(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }
}

/// Waits up to `timeout` on a done-latch handle for the election round
/// to settle. Returns true if it did.
pub(crate) async fn wait_done(
    mut rx: watch::Receiver<bool>,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok()
}

/// Declares this node leader without running a round: applies at
/// bootstrap when the view holds no peer to elect against, and after
/// the only remaining peer crashed.
pub(crate) fn hs_bootstrap_leader(view: &mut RingView, es: &mut ElectionState) {
    view.leader = Some(view.me.clone());
    es.in_progress = false;
    es.signal_done();
    pf_info!("HS: leader elected: {} (no peer to elect against)", view.me);
}

/// Probe distance for a phase, saturating far above any real ring size.
#[inline]
fn probe_distance(phase: u32) -> u64 {
    1u64.checked_shl(phase).unwrap_or(u64::MAX)
}

/// Starts an HS election round. No-op if one is already in progress, if
/// the view has no peer to elect against, or if the ring cannot supply
/// both neighbors even after a rebuild.
pub(crate) fn hs_start(view: &mut RingView, es: &mut ElectionState) -> Sends {
    if es.in_progress {
        pf_debug!("election already in progress");
        return vec![];
    }
    if view.servers.len() <= 1 {
        pf_debug!("cannot start election: only one server in view");
        return vec![];
    }
    if view.left.is_none() || view.right.is_none() {
        view.rebuild();
        if view.left.is_none() || view.right.is_none() {
            pf_warn!("cannot start election: ring not ready after rebuild");
            es.in_progress = false;
            es.phase = 0;
            return vec![];
        }
    }

    es.in_progress = true;
    es.clear_done();
    view.leader = None;
    es.phase = 0;
    pf_info!("starting Hirschberg-Sinclair election");
    send_neighbors(view, es)
}

/// Emits this phase's probes to both neighbors.
fn send_neighbors(view: &RingView, es: &mut ElectionState) -> Sends {
    let distance = probe_distance(es.phase);
    es.pending_replies = 2;

    let mut sends = vec![];
    for direction in [Direction::Left, Direction::Right] {
        let neighbor = match direction {
            Direction::Left => view.left.as_ref(),
            Direction::Right => view.right.as_ref(),
        };
        match neighbor {
            Some(nid) => sends.push((
                nid.clone(),
                WireMsg::HsElection {
                    id: view.me.clone(),
                    phase: es.phase,
                    direction,
                    hop: distance,
                },
            )),
            None => {
                pf_warn!("probe skipped: no {} neighbor", direction);
                es.pending_replies -= 1;
            }
        }
    }

    // both neighbors missing: abort the round entirely
    if es.pending_replies == 0 {
        es.in_progress = false;
        es.phase = 0;
        es.signal_done();
        return vec![];
    }
    sends
}

/// Handler of an incoming `HS_ELECTION` probe.
pub(crate) fn hs_election(
    view: &mut RingView,
    es: &mut ElectionState,
    cid: &str,
    phase: u32,
    direction: Direction,
    hop: u64,
) -> Sends {
    let neighbor = match direction {
        Direction::Left => view.left.clone(),
        Direction::Right => view.right.clone(),
    };
    let Some(neighbor) = neighbor else {
        pf_warn!("probe dropped: no {} neighbor", direction);
        return vec![];
    };

    match cid.cmp(view.me.as_str()) {
        Ordering::Less => {
            // swallow probes from smaller ids; contest with my own round
            if !es.in_progress {
                return hs_start(view, es);
            }
            vec![]
        }
        Ordering::Greater if hop > 1 => vec![(
            neighbor,
            WireMsg::HsElection {
                id: cid.to_string(),
                phase,
                direction,
                hop: hop - 1,
            },
        )],
        Ordering::Greater => vec![(
            neighbor,
            WireMsg::HsReply {
                id: cid.to_string(),
                direction,
            },
        )],
        Ordering::Equal => {
            // own probe echoing back as a probe; replies are routed via
            // HS_REPLY, so this is a protocol error
            pf_warn!("dropped own probe arriving as HS_ELECTION");
            vec![]
        }
    }
}

/// Handler of an incoming `HS_REPLY`. Forwards until the reply reaches
/// its originator, then accounts it; once both directions answered,
/// either doubles the distance or declares victory.
pub(crate) fn hs_reply(
    view: &mut RingView,
    es: &mut ElectionState,
    cid: &str,
    direction: Direction,
) -> Sends {
    let neighbor = match direction {
        Direction::Left => view.left.clone(),
        Direction::Right => view.right.clone(),
    };
    let Some(neighbor) = neighbor else {
        pf_warn!("reply dropped: no {} neighbor", direction);
        return vec![];
    };

    if cid != view.me {
        return vec![(
            neighbor,
            WireMsg::HsReply {
                id: cid.to_string(),
                direction,
            },
        )];
    }

    if !es.in_progress || es.pending_replies == 0 {
        pf_warn!("stray reply to own id outside an election round");
        return vec![];
    }

    es.pending_replies = es.pending_replies.saturating_sub(1);
    if es.pending_replies > 0 {
        return vec![];
    }

    let covered = probe_distance(es.phase + 1);
    if covered >= view.servers.len() as u64 {
        hs_declare_leader(view, es)
    } else {
        es.phase += 1;
        send_neighbors(view, es)
    }
}

/// Declares this node the leader and starts `HS_LEADER` propagation
/// around the ring.
pub(crate) fn hs_declare_leader(
    view: &mut RingView,
    es: &mut ElectionState,
) -> Sends {
    pf_info!("HS: I am the leader");
    view.leader = Some(view.me.clone());
    es.in_progress = false;
    es.signal_done();

    match view.left.clone() {
        Some(left) if left != view.me => vec![(
            left,
            WireMsg::HsLeader {
                id: view.me.clone(),
            },
        )],
        _ => vec![],
    }
}

/// Handler of an incoming `HS_LEADER` announcement. Returns whether this
/// node was leader until now and must hand its state off to `cid`, plus
/// the propagation sends.
pub(crate) fn hs_leader(
    view: &mut RingView,
    es: &mut ElectionState,
    cid: &str,
) -> (bool, Sends) {
    let demoted = view.is_leader() && cid != view.me;

    view.leader = Some(cid.to_string());
    es.in_progress = false;
    es.signal_done();
    pf_info!("HS: leader elected: {}", cid);

    let sends = match view.left.clone() {
        Some(left) if left != cid => vec![(
            left,
            WireMsg::HsLeader {
                id: cid.to_string(),
            },
        )],
        _ => vec![],
    };
    (demoted, sends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    fn fleet(ids: &[&str]) -> HashMap<ServerId, (RingView, ElectionState)> {
        ids.iter()
            .map(|id| {
                let mut view = RingView::new(id.to_string());
                for other in ids {
                    view.add(other);
                }
                (id.to_string(), (view, ElectionState::new()))
            })
            .collect()
    }

    /// Runs queued messages to quiescence across a simulated fleet.
    fn run_to_quiet(
        nodes: &mut HashMap<ServerId, (RingView, ElectionState)>,
        queue: &mut VecDeque<(ServerId, WireMsg)>,
    ) {
        let mut steps = 0;
        while let Some((to, msg)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 10_000, "election did not converge");
            let (view, es) = nodes.get_mut(&to).unwrap();
            let sends = match msg {
                WireMsg::HsElection {
                    id,
                    phase,
                    direction,
                    hop,
                } => hs_election(view, es, &id, phase, direction, hop),
                WireMsg::HsReply { id, direction } => {
                    hs_reply(view, es, &id, direction)
                }
                WireMsg::HsLeader { id } => hs_leader(view, es, &id).1,
                other => panic!("unexpected message in sim: {:?}", other),
            };
            queue.extend(sends);
        }
    }

    #[test]
    fn probe_from_smaller_id_swallowed() {
        // node B receives a probe from A < B: swallow, start own round
        let mut nodes = fleet(&["10.0.0.1:5001", "10.0.0.1:5002"]);
        let (view, es) = nodes.get_mut("10.0.0.1:5002").unwrap();
        let sends =
            hs_election(view, es, "10.0.0.1:5001", 0, Direction::Left, 1);
        assert!(es.in_progress);
        assert_eq!(es.phase, 0);
        assert_eq!(sends.len(), 2);
        for (_, msg) in &sends {
            match msg {
                WireMsg::HsElection { id, hop, .. } => {
                    assert_eq!(id, "10.0.0.1:5002");
                    assert_eq!(*hop, 1);
                }
                other => panic!("expected probe, got {:?}", other),
            }
        }
    }

    #[test]
    fn probe_from_larger_id_forwarded_or_answered() {
        let mut nodes = fleet(&["a:1", "b:2", "c:3"]);
        let (view, es) = nodes.get_mut("a:1").unwrap();

        // hop > 1: forwarded with hop decremented, same direction
        let sends = hs_election(view, es, "c:3", 0, Direction::Left, 2);
        assert_eq!(
            sends,
            vec![(
                "c:3".to_string(),
                WireMsg::HsElection {
                    id: "c:3".into(),
                    phase: 0,
                    direction: Direction::Left,
                    hop: 1,
                }
            )]
        );

        // hop == 1: turned into a reply toward the same direction
        let (view, es) = nodes.get_mut("a:1").unwrap();
        let sends = hs_election(view, es, "b:2", 0, Direction::Right, 1);
        assert_eq!(
            sends,
            vec![(
                "b:2".to_string(),
                WireMsg::HsReply {
                    id: "b:2".into(),
                    direction: Direction::Right,
                }
            )]
        );
    }

    #[test]
    fn start_requires_a_peer() {
        let mut view = RingView::new("a:1".into());
        let mut es = ElectionState::new();
        assert!(hs_start(&mut view, &mut es).is_empty());
        assert!(!es.in_progress);
    }

    #[test]
    fn start_is_idempotent_while_running() {
        let mut nodes = fleet(&["a:1", "b:2"]);
        let (view, es) = nodes.get_mut("a:1").unwrap();
        let first = hs_start(view, es);
        assert_eq!(first.len(), 2);
        assert!(hs_start(view, es).is_empty());
    }

    #[test]
    fn two_node_election_single_phase() {
        let ids = ["10.0.0.1:5001", "10.0.0.1:5002"];
        let mut nodes = fleet(&ids);
        let mut queue = VecDeque::new();
        {
            let (view, es) = nodes.get_mut(ids[0]).unwrap();
            queue.extend(hs_start(view, es));
        }
        run_to_quiet(&mut nodes, &mut queue);

        // winner is the larger id and it never left phase 0
        let (view, es) = &nodes[ids[1]];
        assert!(view.is_leader());
        assert_eq!(es.phase, 0);
        for (view, es) in nodes.values() {
            assert_eq!(view.leader.as_deref(), Some(ids[1]));
            assert!(!es.in_progress);
        }
    }

    #[test]
    fn largest_id_wins_three_nodes() {
        let ids = ["10.0.0.1:5001", "10.0.0.1:5002", "10.0.0.1:5003"];
        let mut nodes = fleet(&ids);
        let mut queue = VecDeque::new();
        {
            let (view, es) = nodes.get_mut(ids[0]).unwrap();
            queue.extend(hs_start(view, es));
        }
        run_to_quiet(&mut nodes, &mut queue);

        let leaders: Vec<&ServerId> = nodes
            .values()
            .filter(|(view, _)| view.is_leader())
            .map(|(view, _)| &view.me)
            .collect();
        assert_eq!(leaders, vec![ids[2]]);
        for (view, _) in nodes.values() {
            assert_eq!(view.leader.as_deref(), Some(ids[2]));
        }
    }

    #[test]
    fn largest_id_wins_five_nodes_any_initiator() {
        let ids = ["h:10", "h:11", "h:12", "h:13", "h:14"];
        for starter in &ids {
            let mut nodes = fleet(&ids);
            let mut queue = VecDeque::new();
            {
                let (view, es) = nodes.get_mut(*starter).unwrap();
                queue.extend(hs_start(view, es));
            }
            run_to_quiet(&mut nodes, &mut queue);
            for (view, _) in nodes.values() {
                assert_eq!(view.leader.as_deref(), Some("h:14"));
            }
        }
    }

    #[test]
    fn demotion_flag_on_leader_change() {
        let mut nodes = fleet(&["a:1", "b:2"]);
        let (view, es) = nodes.get_mut("a:1").unwrap();
        view.leader = Some("a:1".into());
        let (demoted, _) = hs_leader(view, es, "b:2");
        assert!(demoted);
        assert!(!view.is_leader());

        // the new leader itself is not "demoted" by its own announcement
        let (view, es) = nodes.get_mut("b:2").unwrap();
        view.leader = Some("b:2".into());
        let (demoted, _) = hs_leader(view, es, "b:2");
        assert!(!demoted);
    }

    #[tokio::test]
    async fn done_latch_settles() {
        let ids = ["a:1", "b:2"];
        let mut nodes = fleet(&ids);
        let mut queue = VecDeque::new();
        {
            let (view, es) = nodes.get_mut("a:1").unwrap();
            queue.extend(hs_start(view, es));
            let rx = es.done_watch();
            assert!(!wait_done(rx, Duration::from_millis(10)).await);
        }
        run_to_quiet(&mut nodes, &mut queue);
        let (_, es) = &nodes["a:1"];
        let rx = es.done_watch();
        assert!(wait_done(rx, Duration::from_millis(10)).await);
    }
}
