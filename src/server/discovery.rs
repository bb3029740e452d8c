//! Quorumcast server -- multicast discovery and beaconing.

use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

use crate::protocol::{DiscoveryFrame, WireMsg};

use super::election;
use super::heartbeat::{detector_tick, HeartbeatVerdict};
use super::ServerNode;

// ServerNode discovery duties
impl ServerNode {
    /// One beacon tick: announce presence on the multicast group, then
    /// run the failure detector against the left neighbor. Returns true
    /// if a crash was just declared, so the caller arms the settle
    /// timer for re-election.
    pub(super) async fn beacon_tick(&mut self) -> bool {
        self.mcast_send(&DiscoveryFrame::Server(self.id.clone()))
            .await;

        let timeout =
            Duration::from_millis(self.config.heartbeat_timeout_ms);
        match detector_tick(&self.view, &mut self.hb, Instant::now(), timeout)
        {
            HeartbeatVerdict::Quiescent => false,
            HeartbeatVerdict::Probe(left) => {
                self.send_to_server(
                    &left,
                    &WireMsg::Heartbeat {
                        id: self.id.clone(),
                    },
                )
                .await;
                false
            }
            HeartbeatVerdict::Crashed(left) => {
                pf_warn!("heartbeat timeout for {}, assuming crash", left);
                self.mcast_send(&DiscoveryFrame::Crash(left.clone()))
                    .await;
                self.view.remove(&left);
                true
            }
        }
    }

    /// Handler of one datagram from the multicast discovery channel.
    pub(super) async fn handle_mcast(
        &mut self,
        bytes: &[u8],
        src: SocketAddr,
    ) {
        let Ok(text) = std::str::from_utf8(bytes) else {
            pf_trace!("non-text discovery datagram from {}", src);
            return;
        };
        let Some(frame) = DiscoveryFrame::parse(text.trim()) else {
            pf_trace!("unknown discovery frame: {:?}", text);
            return;
        };

        match frame {
            DiscoveryFrame::Server(sid) => {
                if self.view.add(&sid) {
                    pf_info!("server joined: {}", sid);
                    // a fresh peer invalidates the leader choice; elect
                    // as soon as the ring can carry probes
                    if !self.election.in_progress
                        && self.view.servers.len() > 1
                        && self.view.left.is_some()
                        && self.view.right.is_some()
                    {
                        let sends = election::hs_start(
                            &mut self.view,
                            &mut self.election,
                        );
                        self.dispatch(sends).await;
                    }
                }
            }
            DiscoveryFrame::WhoIsLeader => {
                pf_debug!("discovery got leader request from {}", src);
                if self.view.is_leader() {
                    self.send_frame(
                        src,
                        &DiscoveryFrame::Leader(self.id.clone()),
                    )
                    .await;
                }
            }
            DiscoveryFrame::Crash(sid) => {
                // never remove self on hearsay
                if sid != self.id && self.view.remove(&sid) {
                    pf_warn!("server left: {}", sid);
                }
            }
            DiscoveryFrame::Leader(_) => {
                // unicast reply type; nothing to do on the group channel
            }
        }
    }
}
