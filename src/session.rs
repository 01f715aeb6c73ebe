//! WebSocket session handler
//!
//! Per-connection state machine with two states: unidentified and
//! identified. The first frame must be `identify`; until then every other
//! frame is answered with `not_identified`. Once identified, the session is
//! the only code path that injects `from` into outgoing messages, so a
//! client cannot spoof its sender.
//!
//! Bus events reach the session through per-topic forwarder tasks feeding
//! the bounded outbound queue; frames originated by this session's own agent
//! are never echoed back to it.

use crate::bus::HubEvent;
use crate::bus::topic;
use crate::channels::{ChannelError, HistoryQuery};
use crate::dispatch::decide_with_escalation;
use crate::domain_types::{AgentId, ChannelName, MessageId, TaskId};
use crate::error::slug;
use crate::hub::Hub;
use crate::message::{Message, MessageKind};
use crate::presence::{AgentMeta, SESSION_QUEUE_DEPTH};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::rate_limit::{LimitChannel, LimitDecision, LimitTier};
use crate::router::RouterError;
use crate::tasks::{FailOutcome, Recovery, TaskError};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runs one WebSocket connection to completion.
pub async fn run(socket: WebSocket, hub: Arc<Hub>) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerFrame>(SESSION_QUEUE_DEPTH);
    let writer = tokio::spawn(write_loop(sink, rx));

    let mut session = Session {
        hub,
        tx,
        agent: None,
        forwarders: HashMap::new(),
    };
    session.read_loop(stream).await;
    session.cleanup();
    writer.abort();
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<ServerFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, "failed to encode outbound frame");
                continue;
            }
        };
        if sink.send(WsMessage::Text(json.into())).await.is_err() {
            break;
        }
    }
}

struct Session {
    hub: Arc<Hub>,
    tx: mpsc::Sender<ServerFrame>,
    agent: Option<AgentId>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Session {
    async fn read_loop(&mut self, mut stream: SplitStream<WebSocket>) {
        while let Some(incoming) = stream.next().await {
            match incoming {
                Ok(WsMessage::Text(text)) => self.handle_text(text.as_str()).await,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {} // binary/ping/pong frames are not part of the protocol
                Err(err) => {
                    debug!(%err, "websocket transport error, closing session");
                    break;
                }
            }
        }
    }

    fn cleanup(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
        if let Some(agent) = &self.agent {
            self.hub.presence.unregister_handle(agent, &self.tx);
        }
    }

    async fn push(&self, frame: ServerFrame) {
        // The session's own replies use the same bounded queue as async
        // pushes; a closed receiver means the writer died and the read loop
        // will notice shortly.
        let _ = self.tx.send(frame).await;
    }

    async fn handle_text(&mut self, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => {
                self.push(ServerFrame::error(slug::INVALID_JSON)).await;
                return;
            }
        };
        let frame: ClientFrame = match serde_json::from_value(value) {
            Ok(frame) => frame,
            Err(err) => {
                let slug = if err.to_string().contains("unknown variant") {
                    slug::UNKNOWN_MESSAGE_TYPE
                } else {
                    slug::INVALID_JSON
                };
                self.push(ServerFrame::error(slug)).await;
                return;
            }
        };
        match (self.agent.clone(), frame) {
            (None, ClientFrame::Identify { agent_id, token, name, status, capabilities }) => {
                self.identify(agent_id, token, name, status, capabilities).await;
            }
            (None, _) => self.push(ServerFrame::error(slug::NOT_IDENTIFIED)).await,
            (Some(me), frame) => self.dispatch(me, frame).await,
        }
    }

    async fn identify(
        &mut self,
        agent_id: String,
        token: String,
        name: Option<String>,
        status: Option<String>,
        capabilities: Vec<String>,
    ) {
        let verified = match self.hub.auth.verify(&token).await {
            Some(verified) => verified,
            None => {
                self.push(ServerFrame::error(slug::INVALID_TOKEN)).await;
                return;
            }
        };
        if verified.as_str() != agent_id {
            self.push(ServerFrame::error(slug::TOKEN_AGENT_MISMATCH)).await;
            return;
        }

        self.hub.presence.register(
            verified.clone(),
            AgentMeta {
                name,
                status,
                capabilities,
            },
            self.tx.clone(),
        );
        self.agent = Some(verified.clone());

        self.spawn_forwarder(topic::MESSAGES.to_string());
        self.spawn_forwarder(topic::PRESENCE.to_string());
        match self.hub.channels.channels_of(&verified).await {
            Ok(channels) => {
                for channel in channels {
                    self.spawn_forwarder(topic::channel(&channel));
                }
            }
            Err(err) => warn!(%err, "failed to restore channel subscriptions"),
        }

        info!(agent_id = %verified, "session identified");
        self.push(ServerFrame::Identified {
            agent_id: verified.to_string(),
        })
        .await;
    }

    fn spawn_forwarder(&mut self, topic_name: String) {
        if self.forwarders.contains_key(&topic_name) {
            return;
        }
        let Some(me) = self.agent.clone() else { return };
        let mut rx = self.hub.bus.subscribe(&topic_name);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(frame) = frame_for_event(event, &me) {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session forwarder lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.insert(topic_name, handle);
    }

    fn drop_forwarder(&mut self, topic_name: &str) {
        if let Some(handle) = self.forwarders.remove(topic_name) {
            handle.abort();
        }
    }

    /// Rate-limit gate for message-bearing frames. Returns false (after
    /// replying) when the frame must be rejected.
    async fn admit(&self, me: &AgentId, tier: LimitTier) -> bool {
        match self.hub.limiter.check(me, LimitChannel::Ws, tier) {
            LimitDecision::Allow { .. } | LimitDecision::Exempt => true,
            LimitDecision::Warn { remaining } => {
                debug!(agent_id = %me, remaining, "rate limit warning");
                true
            }
            LimitDecision::Deny { .. } => {
                let retry = self.hub.limiter.record_violation(me);
                self.push(ServerFrame::rate_limited(retry)).await;
                false
            }
        }
    }

    async fn dispatch(&mut self, me: AgentId, frame: ClientFrame) {
        match frame {
            // A repeated identify refreshes metadata.
            ClientFrame::Identify { agent_id, token, name, status, capabilities } => {
                self.identify(agent_id, token, name, status, capabilities).await;
            }
            ClientFrame::Message {
                to,
                kind,
                payload,
                reply_to,
            } => self.handle_message(me, to, kind, payload, reply_to).await,
            ClientFrame::Status { status } => {
                self.hub.presence.update_status(&me, status);
            }
            ClientFrame::Ping => {
                self.hub.presence.touch(&me);
                self.push(ServerFrame::Pong).await;
            }
            ClientFrame::ListAgents => {
                let agents = self.hub.presence.list();
                self.push(ServerFrame::Agents { agents }).await;
            }
            ClientFrame::ListChannels => match self.hub.channels.list().await {
                Ok(channels) => self.push(ServerFrame::Channels { channels }).await,
                Err(err) => self.push(self.channel_error(&err)).await,
            },
            ClientFrame::ChannelSubscribe { channel } => self.handle_subscribe(me, channel).await,
            ClientFrame::ChannelUnsubscribe { channel } => {
                self.handle_unsubscribe(me, channel).await;
            }
            ClientFrame::ChannelPublish {
                channel,
                payload,
                kind,
                reply_to,
            } => self.handle_channel_publish(me, channel, payload, kind, reply_to).await,
            ClientFrame::ChannelHistory {
                channel,
                limit,
                since,
            } => self.handle_history(channel, limit, since).await,
            ClientFrame::GetThread { message_id } => {
                let id = MessageId::new(message_id);
                match self.hub.threads.get_thread(&id).await {
                    Ok(messages) => self.push(ServerFrame::Thread { messages }).await,
                    Err(err) => {
                        warn!(%err, "thread lookup failed");
                        self.push(ServerFrame::error(slug::NOT_FOUND)).await;
                    }
                }
            }
            ClientFrame::TaskRequest { capabilities } => {
                self.handle_task_request(me, capabilities).await;
            }
            ClientFrame::TaskAccepted { task_id, generation } => {
                let id = TaskId::new(task_id);
                let ack = match self.hub.tasks.accept_task(&id, generation).await {
                    Ok(task) => ServerFrame::TaskAck {
                        task_id: task.id.to_string(),
                        status: task.status.to_string(),
                        error: None,
                    },
                    Err(err) => task_ack_error(&id, "task_accept_failed", &err),
                };
                self.push(ack).await;
            }
            ClientFrame::TaskProgress { task_id } => {
                let id = TaskId::new(task_id);
                let ack = match self.hub.tasks.update_progress(&id).await {
                    Ok(()) => ServerFrame::TaskAck {
                        task_id: id.to_string(),
                        status: "working".to_string(),
                        error: None,
                    },
                    Err(err) => task_ack_error(&id, "task_progress_failed", &err),
                };
                self.push(ack).await;
            }
            ClientFrame::TaskComplete {
                task_id,
                generation,
                result,
            } => {
                let id = TaskId::new(task_id);
                let ack = match self.hub.tasks.complete_task(&id, generation, result).await {
                    Ok(task) => ServerFrame::TaskAck {
                        task_id: task.id.to_string(),
                        status: task.status.to_string(),
                        error: None,
                    },
                    Err(err) => task_ack_error(&id, slug::TASK_COMPLETE_FAILED, &err),
                };
                self.push(ack).await;
            }
            ClientFrame::TaskFailed {
                task_id,
                generation,
                error,
            } => {
                let id = TaskId::new(task_id);
                let ack = match self.hub.tasks.fail_task(&id, generation, error).await {
                    Ok(FailOutcome::Retried(task)) => ServerFrame::TaskAck {
                        task_id: task.id.to_string(),
                        status: "retried".to_string(),
                        error: None,
                    },
                    Ok(FailOutcome::DeadLetter(task)) => ServerFrame::TaskAck {
                        task_id: task.id.to_string(),
                        status: task.status.to_string(),
                        error: None,
                    },
                    Err(err) => task_ack_error(&id, slug::TASK_FAIL_FAILED, &err),
                };
                self.push(ack).await;
            }
            ClientFrame::TaskRecovering { task_id } => {
                let id = TaskId::new(task_id);
                let reply = match self.hub.tasks.recover_task(&id, &me).await {
                    Ok(Recovery::Continue(task)) => ServerFrame::TaskRecovery {
                        task_id: task.id.to_string(),
                        outcome: "continue".to_string(),
                        generation: Some(task.generation),
                        description: Some(task.description),
                    },
                    Ok(Recovery::Reassign) => ServerFrame::TaskRecovery {
                        task_id: id.to_string(),
                        outcome: "reassign".to_string(),
                        generation: None,
                        description: None,
                    },
                    Err(err) => {
                        warn!(%err, "task recovery failed");
                        ServerFrame::error(slug::NOT_FOUND)
                    }
                };
                self.push(reply).await;
            }
            ClientFrame::EndpointReport { endpoint } => {
                self.hub.endpoints.report(endpoint);
            }
        }
    }

    async fn handle_message(
        &mut self,
        me: AgentId,
        to: Option<String>,
        kind: Option<MessageKind>,
        payload: serde_json::Value,
        reply_to: Option<String>,
    ) {
        let kind = kind.unwrap_or_default();
        let tier = match kind {
            MessageKind::Status | MessageKind::Ping => LimitTier::Light,
            _ => LimitTier::Normal,
        };
        if !self.admit(&me, tier).await {
            return;
        }
        let message = Message::build(me, to, kind, payload, reply_to.map(MessageId::new));
        match self.hub.router.route(&message).await {
            Ok(outcome) => {
                self.push(ServerFrame::MessageSent {
                    id: message.id.to_string(),
                    result: outcome.as_str().to_string(),
                })
                .await;
            }
            Err(RouterError::AgentOffline(recipient)) => {
                // Undeliverable direct sends fall back to the mailbox here,
                // at the session layer.
                match self.hub.mailbox.enqueue(&recipient, message.clone()).await {
                    Ok(seq) => {
                        debug!(to = %recipient, seq, "message queued to mailbox");
                        self.push(ServerFrame::MessageSent {
                            id: message.id.to_string(),
                            result: "queued".to_string(),
                        })
                        .await;
                    }
                    Err(err) => self.push(store_error_frame(&err)).await,
                }
            }
            Err(RouterError::InvalidRecipient) => {
                self.push(ServerFrame::error(slug::AGENT_OFFLINE)).await;
            }
            Err(RouterError::Store(err)) => self.push(store_error_frame(&err)).await,
        }
    }

    async fn handle_subscribe(&mut self, me: AgentId, channel: String) {
        let Ok(name) = ChannelName::try_new(channel) else {
            self.push(ServerFrame::error(slug::CHANNEL_NOT_FOUND)).await;
            return;
        };
        match self.hub.channels.subscribe(&name, &me).await {
            Ok(()) => {
                self.spawn_forwarder(topic::channel(&name));
                self.push(ServerFrame::ChannelSubscribed {
                    channel: name.to_string(),
                    agent_id: me.to_string(),
                })
                .await;
            }
            Err(err) => self.push(self.channel_error(&err)).await,
        }
    }

    async fn handle_unsubscribe(&mut self, me: AgentId, channel: String) {
        let Ok(name) = ChannelName::try_new(channel) else {
            self.push(ServerFrame::error(slug::CHANNEL_NOT_FOUND)).await;
            return;
        };
        match self.hub.channels.unsubscribe(&name, &me).await {
            Ok(()) => self.drop_forwarder(&topic::channel(&name)),
            Err(err) => self.push(self.channel_error(&err)).await,
        }
    }

    async fn handle_channel_publish(
        &mut self,
        me: AgentId,
        channel: String,
        payload: serde_json::Value,
        kind: Option<MessageKind>,
        reply_to: Option<String>,
    ) {
        if !self.admit(&me, LimitTier::Normal).await {
            return;
        }
        let Ok(name) = ChannelName::try_new(channel) else {
            self.push(ServerFrame::error(slug::CHANNEL_NOT_FOUND)).await;
            return;
        };
        let message = Message::build(
            me,
            Some(name.to_string()),
            kind.unwrap_or_default(),
            payload,
            reply_to.map(MessageId::new),
        );
        if let Err(err) = self.hub.threads.index(&message).await {
            self.push(store_error_frame(&err)).await;
            return;
        }
        match self.hub.channels.publish(&name, message.clone()).await {
            Ok(_seq) => {
                self.push(ServerFrame::MessageSent {
                    id: message.id.to_string(),
                    result: "published".to_string(),
                })
                .await;
            }
            Err(err) => self.push(self.channel_error(&err)).await,
        }
    }

    async fn handle_history(&mut self, channel: String, limit: Option<usize>, since: Option<u64>) {
        let Ok(name) = ChannelName::try_new(channel) else {
            self.push(ServerFrame::error(slug::CHANNEL_NOT_FOUND)).await;
            return;
        };
        match self
            .hub
            .channels
            .history(&name, HistoryQuery { limit, since })
            .await
        {
            Ok(entries) => {
                self.push(ServerFrame::ChannelHistory {
                    channel: name.to_string(),
                    entries,
                })
                .await;
            }
            Err(err) => self.push(self.channel_error(&err)).await,
        }
    }

    async fn handle_task_request(&mut self, me: AgentId, capabilities: Vec<String>) {
        match self.hub.tasks.assign_next(&me, &capabilities).await {
            Ok(Some(task)) => {
                let decision = decide_with_escalation(
                    task.complexity.effective_tier,
                    &self.hub.endpoints.list(),
                    &self.hub.config.premium_model,
                );
                self.push(ServerFrame::TaskAssign {
                    task_id: task.id.to_string(),
                    description: task.description,
                    metadata: task.metadata,
                    priority: task.priority,
                    generation: task.generation,
                    decision,
                })
                .await;
            }
            Ok(None) => self.push(ServerFrame::QueueEmpty).await,
            Err(err) => {
                warn!(%err, "task assignment failed");
                self.push(ServerFrame::error(slug::NOT_FOUND)).await;
            }
        }
    }

    fn channel_error(&self, err: &ChannelError) -> ServerFrame {
        match err {
            ChannelError::NotFound(_) => ServerFrame::error(slug::CHANNEL_NOT_FOUND),
            ChannelError::Store(err) => store_error_frame(err),
        }
    }
}

fn store_error_frame(err: &crate::storage::StoreError) -> ServerFrame {
    warn!(%err, "storage failure on session path");
    if err.is_corruption() {
        ServerFrame::error(slug::TABLE_CORRUPTED)
    } else {
        ServerFrame::error("internal_error")
    }
}

fn task_ack_error(task_id: &TaskId, slug: &str, err: &TaskError) -> ServerFrame {
    ServerFrame::TaskAck {
        task_id: task_id.to_string(),
        status: slug.to_string(),
        error: Some(err.to_string()),
    }
}

/// Maps a bus event to the frame pushed at this session, suppressing echoes
/// of the agent's own activity.
fn frame_for_event(event: HubEvent, me: &AgentId) -> Option<ServerFrame> {
    match event {
        HubEvent::Broadcast(message) => {
            if &message.from == me {
                return None;
            }
            Some(ServerFrame::Message { message })
        }
        HubEvent::AgentJoined { agent_id, name } => {
            if &agent_id == me {
                return None;
            }
            Some(ServerFrame::AgentJoined {
                agent_id: agent_id.to_string(),
                name,
            })
        }
        HubEvent::AgentLeft { agent_id } => {
            if &agent_id == me {
                return None;
            }
            Some(ServerFrame::AgentLeft {
                agent_id: agent_id.to_string(),
            })
        }
        HubEvent::StatusChanged { agent_id, status } => {
            if &agent_id == me {
                return None;
            }
            Some(ServerFrame::StatusChanged {
                agent_id: agent_id.to_string(),
                status,
            })
        }
        HubEvent::ChannelMessage {
            channel,
            seq,
            message,
        } => {
            if &message.from == me {
                return None;
            }
            Some(ServerFrame::ChannelMessage {
                channel: channel.to_string(),
                seq,
                message,
            })
        }
        HubEvent::ChannelSubscribed { channel, agent_id } => {
            if &agent_id == me {
                return None;
            }
            Some(ServerFrame::ChannelSubscribed {
                channel: channel.to_string(),
                agent_id: agent_id.to_string(),
            })
        }
        // Goal/task lifecycle events stay on the internal bus.
        HubEvent::Goal { .. } | HubEvent::Task { .. } => None,
    }
}
