//! Quorumcast client stub: leader discovery, registration, background
//! FIFO delivery, and the request operations the interactive menu
//! drives.

mod delivery;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{self, Duration};

use uuid::Uuid;

use crate::protocol::{
    ClientId, DiscoveryFrame, GroupName, SeqNum, ServerId, VoteId, WireMsg,
    BUF,
};
use crate::utils::{set_me, QuorumcastError};

use delivery::DeliveryState;

/// Client tunables, overridable via a TOML config string.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Multicast discovery group address.
    pub mcast_group: String,

    /// Multicast discovery port.
    pub mcast_port: u16,

    /// How long to wait for a reply before re-sending a request, ms.
    pub reply_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            mcast_group: "224.1.1.1".into(),
            mcast_port: 5007,
            reply_timeout_ms: 2000,
        }
    }
}

/// A vote delivered to this client, awaiting the user's ballot.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingVote {
    pub group: GroupName,
    pub topic: String,
    pub options: Vec<String>,
    pub sender: ServerId,
    pub seq: SeqNum,
    pub answered: bool,
}

/// Client stub: owns the socket and the state shared with the
/// background listener.
pub struct ClientStub {
    /// My client id, a fresh UUID per process.
    pub id: ClientId,

    /// Registration token minted by the leader.
    token: String,

    sock: Arc<UdpSocket>,

    /// Current leader id; repointed by `NEW_LEADER` messages.
    leader: Arc<Mutex<Option<ServerId>>>,

    /// Votes offered to this client, keyed by vote id.
    pending: Arc<Mutex<HashMap<VoteId, PendingVote>>>,
}

impl ClientStub {
    /// Creates the stub: binds an ephemeral socket, discovers the
    /// leader via multicast (re-asking on every timeout), registers to
    /// obtain the token (same retry pattern), then spawns the
    /// background listener.
    pub async fn new_and_setup(
        config: ClientConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, QuorumcastError> {
        let id: ClientId = Uuid::new_v4().to_string();
        set_me(&id);

        let sock = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let group: Ipv4Addr = config.mcast_group.parse().map_err(|e| {
            QuorumcastError::msg(format!(
                "bad mcast_group '{}': {}",
                config.mcast_group, e
            ))
        })?;
        let mcast_dest =
            SocketAddr::new(IpAddr::V4(group), config.mcast_port);
        let reply_timeout = Duration::from_millis(config.reply_timeout_ms);
        let mut buf = vec![0u8; BUF];

        // leader discovery
        pf_info!("requesting leader via multicast");
        let leader_id = loop {
            sock.send_to(
                DiscoveryFrame::WhoIsLeader.to_string().as_bytes(),
                mcast_dest,
            )
            .await?;
            match time::timeout(reply_timeout, sock.recv_from(&mut buf)).await
            {
                Ok(recv) => {
                    let (len, _) = recv?;
                    if let Ok(text) = std::str::from_utf8(&buf[..len]) {
                        if let Some(DiscoveryFrame::Leader(sid)) =
                            DiscoveryFrame::parse(text.trim())
                        {
                            break sid;
                        }
                    }
                }
                Err(_) => continue, // timeout: ask again
            }
        };
        pf_info!("leader is {}", leader_id);
        let leader_addr: SocketAddr = leader_id.parse()?;

        // registration
        pf_info!("registering client");
        let token = loop {
            let req = WireMsg::Register { id: id.clone() };
            sock.send_to(&req.to_bytes()?, leader_addr).await?;
            match time::timeout(reply_timeout, sock.recv_from(&mut buf)).await
            {
                Ok(recv) => {
                    let (len, _) = recv?;
                    match WireMsg::from_bytes(&buf[..len]) {
                        Ok(WireMsg::RegisterOk { token }) => break token,
                        Ok(_) => continue, // not for this phase; drop
                        Err(e) => {
                            pf_warn!("undecodable reply: {}", e);
                        }
                    }
                }
                Err(_) => continue, // timeout: register again
            }
        };
        pf_info!("registered successfully");

        let stub = ClientStub {
            id,
            token,
            sock,
            leader: Arc::new(Mutex::new(Some(leader_id))),
            pending: Arc::new(Mutex::new(HashMap::new())),
        };
        stub.spawn_listener(shutdown);
        Ok(stub)
    }

    /// Background receive loop: FIFO delivery of `VOTE` messages into
    /// the pending table, result announcements, leader repointing, and
    /// reply printing.
    fn spawn_listener(&self, mut shutdown: watch::Receiver<bool>) {
        let sock = Arc::clone(&self.sock);
        let leader = Arc::clone(&self.leader);
        let pending = Arc::clone(&self.pending);

        tokio::spawn(async move {
            let mut delivery = DeliveryState::new();
            let mut buf = vec![0u8; BUF];
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    res = sock.recv_from(&mut buf) => {
                        let (len, _) = match res {
                            Ok(recv) => recv,
                            Err(e) => {
                                pf_warn!("recv error: {}", e);
                                continue;
                            }
                        };
                        match WireMsg::from_bytes(&buf[..len]) {
                            Ok(msg) => handle_incoming(
                                msg, &mut delivery, &leader, &pending,
                            ),
                            Err(e) => {
                                pf_trace!("undecodable message: {}", e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Currently known leader id.
    pub fn leader(&self) -> Option<ServerId> {
        self.leader.lock().ok().and_then(|l| l.clone())
    }

    fn leader_addr(&self) -> Result<SocketAddr, QuorumcastError> {
        let leader = self
            .leader
            .lock()
            .map_err(|_| QuorumcastError::msg("leader lock poisoned"))?;
        match leader.as_ref() {
            Some(sid) => Ok(sid.parse()?),
            None => logged_err!("no known leader"),
        }
    }

    async fn send_leader(&self, msg: &WireMsg) -> Result<(), QuorumcastError> {
        let addr = self.leader_addr()?;
        self.sock.send_to(&msg.to_bytes()?, addr).await?;
        Ok(())
    }

    pub async fn create_group(
        &self,
        name: &str,
    ) -> Result<(), QuorumcastError> {
        self.send_leader(&WireMsg::CreateGroup {
            id: self.id.clone(),
            token: self.token.clone(),
            group: name.to_string(),
        })
        .await
    }

    pub async fn join_group(&self, name: &str) -> Result<(), QuorumcastError> {
        self.send_leader(&WireMsg::JoinGroup {
            id: self.id.clone(),
            token: self.token.clone(),
            group: name.to_string(),
        })
        .await
    }

    pub async fn leave_group(
        &self,
        name: &str,
    ) -> Result<(), QuorumcastError> {
        self.send_leader(&WireMsg::LeaveGroup {
            id: self.id.clone(),
            token: self.token.clone(),
            group: name.to_string(),
        })
        .await
    }

    pub async fn get_groups(&self) -> Result<(), QuorumcastError> {
        self.send_leader(&WireMsg::GetGroups {
            id: Some(self.id.clone()),
            token: Some(self.token.clone()),
        })
        .await
    }

    pub async fn joined_groups(&self) -> Result<(), QuorumcastError> {
        self.send_leader(&WireMsg::JoinedGroups {
            id: self.id.clone(),
            token: self.token.clone(),
        })
        .await
    }

    pub async fn start_vote(
        &self,
        group: &str,
        topic: &str,
        options: Vec<String>,
        timeout_s: u64,
    ) -> Result<(), QuorumcastError> {
        self.send_leader(&WireMsg::StartVote {
            id: self.id.clone(),
            token: self.token.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            options,
            timeout: timeout_s,
        })
        .await
    }

    /// Votes still waiting for this user's ballot.
    pub fn pending_votes(&self) -> Vec<(VoteId, PendingVote)> {
        let Ok(pending) = self.pending.lock() else {
            return vec![];
        };
        let mut open: Vec<(VoteId, PendingVote)> = pending
            .iter()
            .filter(|(_, v)| !v.answered)
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        open
    }

    /// Casts a ballot for a pending vote: validates the choice against
    /// the offered options, marks the vote answered, and acks to the
    /// leader.
    pub async fn cast_vote(
        &self,
        vote_id: &str,
        choice: &str,
    ) -> Result<(), QuorumcastError> {
        let (group, seq) = {
            let mut pending = self.pending.lock().map_err(|_| {
                QuorumcastError::msg("pending lock poisoned")
            })?;
            let vote = pending.get_mut(vote_id).ok_or_else(|| {
                QuorumcastError::msg(format!("no pending vote {}", vote_id))
            })?;
            if vote.answered {
                return Err(QuorumcastError::msg(format!(
                    "already voted in {}",
                    vote_id
                )));
            }
            if !vote.options.iter().any(|opt| opt == choice) {
                return Err(QuorumcastError::msg(format!(
                    "{} is not a valid option",
                    choice
                )));
            }
            vote.answered = true;
            (vote.group.clone(), vote.seq)
        };

        self.send_leader(&WireMsg::VoteAck {
            vote_id: vote_id.to_string(),
            group,
            seq,
            id: self.id.clone(),
            vote: choice.to_string(),
            token: self.token.clone(),
        })
        .await?;
        pf_info!("sent ballot for vote {} to leader", vote_id);
        Ok(())
    }
}

/// Listener-side handling of one decoded message.
fn handle_incoming(
    msg: WireMsg,
    delivery: &mut DeliveryState,
    leader: &Arc<Mutex<Option<ServerId>>>,
    pending: &Arc<Mutex<HashMap<VoteId, PendingVote>>>,
) {
    match msg {
        WireMsg::Vote {
            seq,
            sender,
            vote_id,
            group,
            topic,
            options,
        } => {
            let msg = WireMsg::Vote {
                seq,
                sender: sender.clone(),
                vote_id,
                group: group.clone(),
                topic,
                options,
            };
            for delivered in delivery.accept(&group, &sender, seq, msg) {
                let WireMsg::Vote {
                    seq,
                    sender,
                    vote_id,
                    group,
                    topic,
                    options,
                } = delivered
                else {
                    continue;
                };
                let Ok(mut pending) = pending.lock() else {
                    return;
                };
                if !pending.contains_key(&vote_id) {
                    pf_info!(
                        "new vote available for {}: {} (vote {}, S={})",
                        group,
                        topic,
                        vote_id,
                        seq
                    );
                    pending.insert(
                        vote_id,
                        PendingVote {
                            group,
                            topic,
                            options,
                            sender,
                            seq,
                            answered: false,
                        },
                    );
                }
            }
        }
        WireMsg::VoteResult {
            vote_id,
            topic,
            winner,
            ..
        } => {
            let Ok(mut pending) = pending.lock() else {
                return;
            };
            if pending.remove(&vote_id).is_some() {
                pf_info!(
                    "vote finished: {} ({}), result: {}",
                    vote_id,
                    topic,
                    winner
                );
            } else {
                pf_warn!("result for unknown vote: {}", vote_id);
            }
        }
        WireMsg::NewLeader { id } => {
            pf_info!("new leader: {}", id);
            if let Ok(mut leader) = leader.lock() {
                *leader = Some(id);
            }
        }
        WireMsg::GetGroupsOk { groups } => {
            pf_info!("available groups: {}", groups.join(", "));
        }
        WireMsg::JoinedGroupsOk { groups } => {
            pf_info!("joined groups: {}", groups.join(", "));
        }
        WireMsg::CreateGroupOk { group } => {
            pf_info!("group created: {}", group);
        }
        WireMsg::JoinGroupOk { group } => {
            pf_info!("joined group: {}", group);
        }
        WireMsg::LeaveGroupOk { group } => {
            pf_info!("left group: {}", group);
        }
        WireMsg::StartVoteOk { topic, .. } => {
            pf_info!("vote accepted by leader: {}", topic);
        }
        WireMsg::RegisterOk { .. } => {
            // a late duplicate of the setup-phase reply
        }
        other => pf_trace!("ignoring message: {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.mcast_group, "224.1.1.1");
        assert_eq!(config.mcast_port, 5007);
        assert_eq!(config.reply_timeout_ms, 2000);
    }

    #[test]
    fn incoming_vote_lands_in_pending_once() {
        let mut delivery = DeliveryState::new();
        let leader = Arc::new(Mutex::new(Some("a:1".to_string())));
        let pending = Arc::new(Mutex::new(HashMap::new()));

        let vote = WireMsg::Vote {
            seq: 0,
            sender: "a:1".into(),
            vote_id: "v1".into(),
            group: "G".into(),
            topic: "t".into(),
            options: vec!["A".into()],
        };
        handle_incoming(vote.clone(), &mut delivery, &leader, &pending);
        assert_eq!(pending.lock().unwrap().len(), 1);

        // a retransmission neither duplicates nor resets the entry
        pending.lock().unwrap().get_mut("v1").unwrap().answered = true;
        handle_incoming(vote, &mut delivery, &leader, &pending);
        let table = pending.lock().unwrap();
        assert_eq!(table.len(), 1);
        assert!(table["v1"].answered);
    }

    #[test]
    fn new_leader_repoints() {
        let mut delivery = DeliveryState::new();
        let leader = Arc::new(Mutex::new(Some("a:1".to_string())));
        let pending = Arc::new(Mutex::new(HashMap::new()));
        handle_incoming(
            WireMsg::NewLeader { id: "b:2".into() },
            &mut delivery,
            &leader,
            &pending,
        );
        assert_eq!(leader.lock().unwrap().as_deref(), Some("b:2"));
    }

    #[test]
    fn result_clears_pending() {
        let mut delivery = DeliveryState::new();
        let leader = Arc::new(Mutex::new(None));
        let pending = Arc::new(Mutex::new(HashMap::from([(
            "v1".to_string(),
            PendingVote {
                group: "G".into(),
                topic: "t".into(),
                options: vec!["A".into()],
                sender: "a:1".into(),
                seq: 0,
                answered: true,
            },
        )])));
        handle_incoming(
            WireMsg::VoteResult {
                vote_id: "v1".into(),
                group: "G".into(),
                topic: "t".into(),
                winner: "A".into(),
            },
            &mut delivery,
            &leader,
            &pending,
        );
        assert!(pending.lock().unwrap().is_empty());
    }
}
