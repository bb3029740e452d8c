//! Quorumcast server -- client request handlers (leader-only).
//!
//! Handlers validate, mutate the directory, replicate the effect to
//! followers, and reply with the matching `*_OK`. Failed validation is
//! logged and produces no reply; the client's own retry/timeout covers
//! it. All requests except `REGISTER` must present the client's minted
//! token.

use std::net::SocketAddr;

use uuid::Uuid;

use crate::protocol::{GroupName, SeqNum, VoteId, WireMsg};

use super::ServerNode;

// ServerNode client request handlers
impl ServerNode {
    /// Routes one client request. The caller has already checked that
    /// this node is the leader.
    pub(super) async fn handle_client_req(
        &mut self,
        req: WireMsg,
        src: SocketAddr,
    ) {
        match req {
            WireMsg::Register { id } => self.handle_register(&id, src).await,
            WireMsg::CreateGroup { id, token, group } => {
                self.handle_create_group(&id, &token, &group, src).await;
            }
            WireMsg::JoinGroup { id, token, group } => {
                self.handle_join_group(&id, &token, &group, src).await;
            }
            WireMsg::LeaveGroup { id, token, group } => {
                self.handle_leave_group(&id, &token, &group, src).await;
            }
            WireMsg::GetGroups { id, token } => {
                self.handle_get_groups(id, token, src).await;
            }
            WireMsg::JoinedGroups { id, token } => {
                self.handle_joined_groups(&id, &token, src).await;
            }
            WireMsg::StartVote {
                id,
                token,
                group,
                topic,
                options,
                timeout,
            } => {
                self.handle_start_vote(
                    &id, &token, &group, &topic, options, timeout, src,
                )
                .await;
            }
            WireMsg::VoteAck {
                vote_id,
                group,
                seq,
                id,
                vote,
                token,
            } => {
                self.handle_vote_ack(vote_id, group, seq, &id, &vote, &token)
                    .await;
            }
            other => pf_warn!("not a client request: {:?}", other),
        }
    }

    /// True if the presented token matches the registry; logs the
    /// rejection otherwise.
    fn authenticated(&self, id: &str, token: &str) -> bool {
        if self.dir.check_token(id, token) {
            true
        } else {
            pf_warn!("token check failed for client {}", id);
            false
        }
    }

    async fn handle_register(&mut self, id: &str, src: SocketAddr) {
        let token = self.dir.register_client(id, src);
        pf_info!("registered client {} at {}", id, src);
        self.bcast_repl(WireMsg::ReplRegister {
            id: id.to_string(),
            token: token.clone(),
            addr: src.to_string(),
        })
        .await;
        self.send_msg(src, &WireMsg::RegisterOk { token }).await;
    }

    async fn handle_create_group(
        &mut self,
        id: &str,
        token: &str,
        group: &str,
        src: SocketAddr,
    ) {
        if !self.authenticated(id, token) {
            return;
        }
        match self.dir.create_group(id, group) {
            Ok(()) => {
                pf_info!("group created: {} (owner {})", group, id);
                self.repl_group(group).await;
                self.send_msg(
                    src,
                    &WireMsg::CreateGroupOk {
                        group: group.to_string(),
                    },
                )
                .await;
            }
            Err(e) => pf_warn!("CREATE_GROUP rejected: {}", e),
        }
    }

    async fn handle_join_group(
        &mut self,
        id: &str,
        token: &str,
        group: &str,
        src: SocketAddr,
    ) {
        if !self.authenticated(id, token) {
            return;
        }
        match self.dir.join_group(id, group) {
            Ok(()) => {
                pf_info!("client {} joined group {}", id, group);
                self.repl_group(group).await;
                self.send_msg(
                    src,
                    &WireMsg::JoinGroupOk {
                        group: group.to_string(),
                    },
                )
                .await;
            }
            Err(e) => pf_warn!("JOIN_GROUP rejected: {}", e),
        }
    }

    async fn handle_leave_group(
        &mut self,
        id: &str,
        token: &str,
        group: &str,
        src: SocketAddr,
    ) {
        if !self.authenticated(id, token) {
            return;
        }
        match self.dir.leave_group(id, group) {
            Ok(()) => {
                pf_info!("client {} left group {}", id, group);
                self.repl_group(group).await;
                self.send_msg(
                    src,
                    &WireMsg::LeaveGroupOk {
                        group: group.to_string(),
                    },
                )
                .await;
            }
            Err(e) => pf_warn!("LEAVE_GROUP rejected: {}", e),
        }
    }

    async fn handle_get_groups(
        &mut self,
        id: Option<String>,
        token: Option<String>,
        src: SocketAddr,
    ) {
        // token is validated when presented; the listing itself is not
        // sensitive
        if let (Some(id), Some(token)) = (&id, &token) {
            if !self.authenticated(id, token) {
                return;
            }
        }
        self.send_msg(
            src,
            &WireMsg::GetGroupsOk {
                groups: self.dir.group_names(),
            },
        )
        .await;
    }

    async fn handle_joined_groups(
        &mut self,
        id: &str,
        token: &str,
        src: SocketAddr,
    ) {
        if !self.authenticated(id, token) {
            return;
        }
        self.send_msg(
            src,
            &WireMsg::JoinedGroupsOk {
                groups: self.dir.joined_groups(id),
            },
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_start_vote(
        &mut self,
        id: &str,
        token: &str,
        group: &str,
        topic: &str,
        options: Vec<String>,
        timeout: u64,
        src: SocketAddr,
    ) {
        if !self.authenticated(id, token) {
            return;
        }
        if !self.dir.groups.contains_key(group) {
            pf_warn!("START_VOTE rejected: group does not exist: {}", group);
            return;
        }
        if !self.dir.is_member(id, group) {
            pf_warn!("START_VOTE rejected: {} not a member of {}", id, group);
            return;
        }

        self.send_msg(
            src,
            &WireMsg::StartVoteOk {
                group: group.to_string(),
                topic: topic.to_string(),
                options: options.clone(),
                timeout,
            },
        )
        .await;

        let vote_id: VoteId = Uuid::new_v4().to_string();
        pf_info!(
            "vote {} started in group {} on '{}'",
            vote_id,
            group,
            topic
        );
        self.dir.open_vote(&vote_id, group, topic, options.clone());
        let (seq, deadline_ms) = self
            .fo_multicast_vote(group, &vote_id, topic, options.clone(), timeout)
            .await;
        self.bcast_repl(WireMsg::ReplVote {
            vote_id,
            group: group.to_string(),
            topic: topic.to_string(),
            options,
            timeout,
            seq,
            sender: self.id.clone(),
            deadline_ms,
        })
        .await;
    }

    async fn handle_vote_ack(
        &mut self,
        vote_id: VoteId,
        group: GroupName,
        seq: SeqNum,
        id: &str,
        vote: &str,
        token: &str,
    ) {
        if !self.authenticated(id, token) {
            return;
        }
        match self.dir.record_vote_ack(&vote_id, &group, seq, id, vote) {
            Ok(()) => {
                pf_info!("ballot recorded: {} voted in {}", id, vote_id);
            }
            Err(e) => pf_warn!("VOTE_ACK dropped: {}", e),
        }
    }

    /// Replicates the current membership snapshot of one group.
    async fn repl_group(&self, group: &str) {
        let Some(owner) =
            self.dir.groups.get(group).map(|g| g.owner.clone())
        else {
            return;
        };
        self.bcast_repl(WireMsg::ReplGroup {
            group: group.to_string(),
            owner,
            members: self.dir.member_list(group),
            seq: self.dir.next_seq(group),
        })
        .await;
    }
}
