//! Quorumcast server node: state, event loop, and message routing.
//!
//! All shared mutable state (membership view, election bookkeeping,
//! failure detector, and the replicated directory) is owned by one
//! `ServerNode` and mutated exclusively from its event loop, which
//! multiplexes the two sockets, the periodic timers, and the shutdown
//! watch. The per-concern logic lives in sibling files as `impl
//! ServerNode` blocks.

mod directory;
mod discovery;
mod election;
mod fo;
mod handlers;
mod heartbeat;
mod replication;
mod ring;
mod transport;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::protocol::{DiscoveryFrame, ServerId, WireMsg, BUF};
use crate::utils::{set_me, QuorumcastError, Timer};

use directory::Directory;
use election::ElectionState;
use heartbeat::HeartbeatState;
use ring::RingView;

/// Server tunables, overridable via a TOML config string.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Multicast discovery group address.
    pub mcast_group: String,

    /// Multicast discovery port.
    pub mcast_port: u16,

    /// Discovery beacon (and heartbeat) interval in ms.
    pub beacon_interval_ms: u64,

    /// Failure detector timeout in ms.
    pub heartbeat_timeout_ms: u64,

    /// Settle delay between broadcasting a crash notice and starting
    /// the re-election, in ms. Long enough for peers to observe the
    /// removal first.
    pub crash_settle_ms: u64,

    /// FO-multicast retransmission scheduler period in ms.
    pub retransmit_interval_ms: u64,

    /// Bounded wait on manually triggered elections, in ms.
    pub election_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            mcast_group: "224.1.1.1".into(),
            mcast_port: 5007,
            beacon_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
            crash_settle_ms: 2000,
            retransmit_interval_ms: 500,
            election_wait_ms: 10_000,
        }
    }
}

/// One Quorumcast server instance.
pub struct ServerNode {
    /// My `host:port` id, stable for the process lifetime.
    id: ServerId,

    config: ServerConfig,

    /// Multicast group destination for beacon/crash frames.
    mcast_dest: SocketAddr,

    /// Unicast endpoint bound to my own address.
    unicast: Arc<UdpSocket>,

    /// Multicast endpoint joined to the discovery group.
    mcast: Arc<UdpSocket>,

    /// Membership view and ring neighbors.
    view: RingView,

    /// Election bookkeeping.
    election: ElectionState,

    /// Failure detector bookkeeping.
    hb: HeartbeatState,

    /// Replicated client/group/vote state.
    dir: Directory,

    /// Fleet-wide shutdown watch, tripped on SIGINT/SIGTERM.
    shutdown: watch::Receiver<bool>,
}

impl ServerNode {
    /// Creates a new server node: derives the host address, binds both
    /// endpoints, and initializes a single-member view.
    pub async fn new_and_setup(
        port: u16,
        config: ServerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, QuorumcastError> {
        let ip = transport::local_ip();
        let addr = SocketAddr::new(ip, port);
        let unicast = Arc::new(transport::bind_unicast(addr)?);

        let group: Ipv4Addr = config.mcast_group.parse().map_err(|e| {
            QuorumcastError::msg(format!(
                "bad mcast_group '{}': {}",
                config.mcast_group, e
            ))
        })?;
        let mcast = Arc::new(transport::bind_multicast(
            group,
            config.mcast_port,
        )?);
        let mcast_dest =
            SocketAddr::new(IpAddr::V4(group), config.mcast_port);

        let id = addr.to_string();
        set_me(&id);
        pf_info!("server node ready on {}", id);

        Ok(ServerNode {
            id: id.clone(),
            config,
            mcast_dest,
            unicast,
            mcast,
            view: RingView::new(id),
            election: ElectionState::new(),
            hb: HeartbeatState::new(),
            dir: Directory::new(),
            shutdown,
        })
    }

    /// Runs the node until the shutdown watch trips. Sockets close on
    /// return.
    pub async fn run(&mut self) -> Result<(), QuorumcastError> {
        // bootstrap rule: alone in the view, there is no peer to elect
        // against, so declare leadership immediately
        self.mcast_send(&DiscoveryFrame::Server(self.id.clone()))
            .await;
        if self.view.servers.len() <= 1 {
            election::hs_bootstrap_leader(&mut self.view, &mut self.election);
        }

        let unicast = Arc::clone(&self.unicast);
        let mcast = Arc::clone(&self.mcast);
        let mut shutdown = self.shutdown.clone();
        let mut settle = Timer::new();
        let mut beacon = time::interval(Duration::from_millis(
            self.config.beacon_interval_ms,
        ));
        beacon.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retransmit = time::interval(Duration::from_millis(
            self.config.retransmit_interval_ms,
        ));
        retransmit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ubuf = vec![0u8; BUF];
        let mut mbuf = vec![0u8; BUF];

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        pf_info!("shutting down");
                        break;
                    }
                }

                res = unicast.recv_from(&mut ubuf) => match res {
                    Ok((len, src)) => {
                        self.handle_unicast(&ubuf[..len], src).await;
                    }
                    Err(e) => pf_warn!("unicast recv error: {}", e),
                },

                res = mcast.recv_from(&mut mbuf) => match res {
                    Ok((len, src)) => {
                        self.handle_mcast(&mbuf[..len], src).await;
                    }
                    Err(e) => pf_warn!("multicast recv error: {}", e),
                },

                _ = beacon.tick() => {
                    if self.beacon_tick().await {
                        // crash declared: give peers time to observe the
                        // removal, then re-elect
                        settle.kickoff(Duration::from_millis(
                            self.config.crash_settle_ms,
                        ));
                    }
                }

                _ = retransmit.tick() => self.fo_retransmit_tick().await,

                _ = settle.ticked() => self.post_crash_election().await,
            }
        }
        Ok(())
    }

    /// Election kickoff after the crash-settle delay. With no peer left
    /// the bootstrap rule applies instead of a round.
    async fn post_crash_election(&mut self) {
        if self.view.servers.len() <= 1 {
            let was_leader = self.view.is_leader();
            election::hs_bootstrap_leader(&mut self.view, &mut self.election);
            if !was_leader {
                self.on_promoted().await;
            }
            return;
        }
        let sends = election::hs_start(&mut self.view, &mut self.election);
        self.dispatch(sends).await;

        // settle watchdog: bounded wait on the done latch, mirroring
        // the manual-election wait; a stuck round surfaces in the logs
        let rx = self.election.done_watch();
        let wait = Duration::from_millis(self.config.election_wait_ms);
        tokio::spawn(async move {
            if !election::wait_done(rx, wait).await {
                pf_warn!(
                    "election still unsettled after {} ms",
                    wait.as_millis()
                );
            }
        });
    }

    /// Demultiplexes one unicast datagram by its `type` tag. A bad
    /// datagram never terminates the loop.
    async fn handle_unicast(&mut self, bytes: &[u8], src: SocketAddr) {
        let msg = match WireMsg::from_bytes(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                pf_warn!("undecodable datagram from {}: {}", src, e);
                return;
            }
        };

        match msg {
            WireMsg::HsElection {
                id,
                phase,
                direction,
                hop,
            } => {
                let sends = election::hs_election(
                    &mut self.view,
                    &mut self.election,
                    &id,
                    phase,
                    direction,
                    hop,
                );
                self.dispatch(sends).await;
            }
            WireMsg::HsReply { id, direction } => {
                let was_leader = self.view.is_leader();
                let sends = election::hs_reply(
                    &mut self.view,
                    &mut self.election,
                    &id,
                    direction,
                );
                self.dispatch(sends).await;
                if !was_leader && self.view.is_leader() {
                    self.on_promoted().await;
                }
            }
            WireMsg::HsLeader { id } => {
                let (demoted, sends) = election::hs_leader(
                    &mut self.view,
                    &mut self.election,
                    &id,
                );
                if demoted {
                    // hand the authoritative state to the new leader
                    self.send_repl_state(&id).await;
                }
                self.dispatch(sends).await;
            }

            WireMsg::Heartbeat { id } => {
                pf_trace!("heartbeat from {}", id);
                self.send_msg(
                    src,
                    &WireMsg::HeartbeatAck {
                        id: self.id.clone(),
                    },
                )
                .await;
            }
            WireMsg::HeartbeatAck { .. } => {
                self.hb.touch(Instant::now());
            }

            WireMsg::ReplRegister { id, token, addr } => {
                self.apply_repl_register(&id, &token, &addr);
            }
            WireMsg::ReplGroup {
                group,
                owner,
                members,
                seq,
            } => {
                self.dir.install_group(&group, &owner, members, seq);
            }
            WireMsg::ReplVote {
                vote_id,
                group,
                topic,
                options,
                seq,
                sender,
                deadline_ms,
                ..
            } => {
                self.apply_repl_vote(
                    vote_id, group, topic, options, seq, sender,
                    deadline_ms,
                );
            }
            WireMsg::ReplState { state } => {
                self.apply_repl_state(state).await;
            }
            WireMsg::NewLeader { .. } => {
                pf_trace!("ignoring NEW_LEADER addressed to a client");
            }

            req @ (WireMsg::Register { .. }
            | WireMsg::CreateGroup { .. }
            | WireMsg::JoinGroup { .. }
            | WireMsg::LeaveGroup { .. }
            | WireMsg::GetGroups { .. }
            | WireMsg::JoinedGroups { .. }
            | WireMsg::StartVote { .. }
            | WireMsg::VoteAck { .. }) => {
                if !self.view.is_leader() {
                    pf_debug!(
                        "dropping client request from {}: not leader",
                        src
                    );
                    return;
                }
                self.handle_client_req(req, src).await;
            }

            other => {
                pf_warn!("unexpected message from {}: {:?}", src, other);
            }
        }
    }

    /// Ran when this node just became leader: repoint every registered
    /// client at me. Inherited `fo_pending` entries resume on the next
    /// retransmit tick with their original deadlines.
    async fn on_promoted(&self) {
        pf_info!(
            "leading; notifying {} registered clients",
            self.dir.clients.len()
        );
        let msg = WireMsg::NewLeader {
            id: self.id.clone(),
        };
        let addrs: Vec<SocketAddr> =
            self.dir.clients.values().map(|c| c.addr).collect();
        for addr in addrs {
            self.send_msg(addr, &msg).await;
        }
    }
}
