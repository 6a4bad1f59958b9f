use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::push::{self, PushNotifier};
use crate::registry::{ConnectionRegistry, Outbound, PairingChange, RegistryError};
use crate::signaling::{decode, ClientMessage, ConnectionId, DeclaredRole, Role, ServerMessage};

/// How the counterpart of a signaling message is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// An offer pairs the caller with one admin; answers and candidates
    /// follow that pairing (or an explicit `to`).
    #[default]
    Paired,
    /// Legacy single-admin mode: offers go to every admin, answers to every
    /// client, candidates to everyone else.
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    SenderGone,
    NoResponder,
    UnknownRecipient,
    Unpaired,
    NoTargets,
    IdRejected,
}

impl DropReason {
    fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::SenderGone => "sender_gone",
            DropReason::NoResponder => "no_responder",
            DropReason::UnknownRecipient => "unknown_recipient",
            DropReason::Unpaired => "unpaired",
            DropReason::NoTargets => "no_targets",
            DropReason::IdRejected => "id_rejected",
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sender metadata changed; nothing forwarded.
    Updated,
    /// The sender now lives under this id; the transport must use it for
    /// every later frame.
    Rekeyed(ConnectionId),
    Delivered(Vec<ConnectionId>),
    Dropped(DropReason),
}

/// Turns decoded messages into registry updates and deliveries.
#[derive(Clone)]
pub struct SignalingRouter {
    registry: ConnectionRegistry,
    policy: RoutingPolicy,
    notifier: Arc<dyn PushNotifier>,
}

impl SignalingRouter {
    pub fn new(
        registry: ConnectionRegistry,
        policy: RoutingPolicy,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        Self {
            registry,
            policy,
            notifier,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Admit a new connection, optionally under a caller-chosen id.
    pub fn connect(
        &self,
        requested: Option<ConnectionId>,
        outbound: Outbound,
    ) -> Result<ConnectionId, RegistryError> {
        let id = match requested {
            Some(id) => self.registry.register_with_id(id, outbound)?,
            None => self.registry.register(outbound),
        };
        counter!("beach_beacon_connections_total", 1);
        Ok(id)
    }

    /// Forget a closed connection. Its peer, if any, becomes unpaired.
    pub fn disconnect(&self, id: &ConnectionId) {
        if let Some(removed) = self.registry.unregister(id) {
            info!(
                connection_id = %id,
                role = removed.role.as_str(),
                former_peer = ?removed.peer,
                "connection removed"
            );
        }
    }

    /// Decode and dispatch one text frame. Bad frames are dropped; the
    /// connection stays open.
    pub fn handle_text(&self, sender: &ConnectionId, text: &str) -> RouteOutcome {
        match decode(text) {
            Ok(message) => self.dispatch(sender, message),
            Err(err) => {
                warn!(connection_id = %sender, error = %err, "dropping malformed message");
                self.dropped(DropReason::Malformed)
            }
        }
    }

    pub fn dispatch(&self, sender: &ConnectionId, message: ClientMessage) -> RouteOutcome {
        let Some(current) = self.registry.find_by_id(sender) else {
            debug!(connection_id = %sender, "message from closed connection ignored");
            return self.dropped(DropReason::SenderGone);
        };
        counter!("beach_beacon_messages_received_total", 1, "type" => message.kind());

        match message {
            ClientMessage::Register { role, client_id } => self.register(sender, role, client_id),
            ClientMessage::FcmToken { token } => {
                let stored = !token.trim().is_empty();
                self.registry.set_push_token(sender, Some(token));
                debug!(connection_id = %sender, stored, "push token updated");
                RouteOutcome::Updated
            }
            ClientMessage::Offer { offer, to } => {
                expect_role(sender, current.role, Role::Client, "offer");
                self.route_offer(sender, offer, to)
            }
            ClientMessage::Answer { answer, to } => {
                expect_role(sender, current.role, Role::Admin, "answer");
                self.route_answer(sender, answer, to)
            }
            ClientMessage::Ice { candidate, to } => self.route_ice(sender, candidate, to),
        }
    }

    /// Apply a `register`: claim the requested address first, then the role.
    /// A taken or blank address rejects the whole message.
    fn register(
        &self,
        sender: &ConnectionId,
        role: Option<DeclaredRole>,
        client_id: Option<ConnectionId>,
    ) -> RouteOutcome {
        let requested = client_id
            .map(|id| ConnectionId::from(id.as_str().trim()))
            .filter(|id| id != sender);

        let current = match requested {
            Some(requested) => match self.registry.rename(sender, requested.clone()) {
                Ok(()) => {
                    info!(connection_id = %sender, client_id = %requested, "connection re-keyed");
                    requested
                }
                Err(err) => {
                    warn!(connection_id = %sender, error = %err, "register rejected");
                    return self.dropped(DropReason::IdRejected);
                }
            },
            None => sender.clone(),
        };

        if let Some(role) = role {
            let role = Role::from(role);
            let previous = self.registry.set_role(&current, role);
            info!(
                connection_id = %current,
                role = role.as_str(),
                previous = ?previous,
                "connection registered"
            );
        }

        if &current == sender {
            RouteOutcome::Updated
        } else {
            RouteOutcome::Rekeyed(current)
        }
    }

    fn route_offer(
        &self,
        sender: &ConnectionId,
        offer: Value,
        to: Option<ConnectionId>,
    ) -> RouteOutcome {
        let message = ServerMessage::Offer {
            offer,
            from: sender.clone(),
        };

        let targets = match self.policy {
            RoutingPolicy::Broadcast => {
                let admins: Vec<ConnectionId> = self
                    .registry
                    .find_by_role(Role::Admin)
                    .into_iter()
                    .filter(|id| id != sender)
                    .collect();
                if admins.is_empty() {
                    info!(connection_id = %sender, "offer dropped; no admin connected");
                    return self.dropped(DropReason::NoResponder);
                }
                admins
            }
            RoutingPolicy::Paired => {
                let addressed = to.is_some();
                let paired = match to {
                    Some(target) => self
                        .registry
                        .pair(sender, &target)
                        .map(|change| (target, change)),
                    None => self.registry.pair_first_available(sender, Role::Admin),
                };
                let Some((admin, change)) = paired else {
                    let reason = if addressed {
                        DropReason::UnknownRecipient
                    } else {
                        DropReason::NoResponder
                    };
                    info!(connection_id = %sender, reason = reason.as_str(), "offer dropped");
                    return self.dropped(reason);
                };
                log_pairing(sender, &admin, &change);
                vec![admin]
            }
        };

        let delivered = self.forward(sender, targets, message);
        for target in &delivered {
            if let Some(token) = self.registry.push_token(target) {
                push::trigger(self.notifier.clone(), target.clone(), token);
            }
        }
        self.outcome(delivered)
    }

    fn route_answer(
        &self,
        sender: &ConnectionId,
        answer: Value,
        to: Option<ConnectionId>,
    ) -> RouteOutcome {
        let message = ServerMessage::Answer {
            answer,
            from: sender.clone(),
        };

        let targets = match self.policy {
            RoutingPolicy::Broadcast => self
                .registry
                .find_by_role(Role::Client)
                .into_iter()
                .filter(|id| id != sender)
                .collect(),
            RoutingPolicy::Paired => {
                let target = match self.resolve_target(sender, to.as_ref()) {
                    Ok(target) => target,
                    Err(reason) => return self.dropped(reason),
                };
                // An addressed answer links the two sides only when the
                // target is free; it never breaks up another call.
                if to.is_some()
                    && self.registry.resolve_peer(sender).as_ref() != Some(&target)
                    && self.registry.resolve_peer(&target).is_none()
                {
                    if let Some(change) = self.registry.pair(sender, &target) {
                        log_pairing(sender, &target, &change);
                    }
                }
                vec![target]
            }
        };

        let delivered = self.forward(sender, targets, message);
        self.outcome(delivered)
    }

    fn route_ice(
        &self,
        sender: &ConnectionId,
        candidate: Value,
        to: Option<ConnectionId>,
    ) -> RouteOutcome {
        let message = ServerMessage::Ice {
            candidate,
            from: sender.clone(),
        };

        let targets = match self.policy {
            RoutingPolicy::Broadcast => self.registry.all_except(sender),
            RoutingPolicy::Paired => match self.resolve_target(sender, to.as_ref()) {
                Ok(target) => vec![target],
                Err(reason) => return self.dropped(reason),
            },
        };

        let delivered = self.forward(sender, targets, message);
        self.outcome(delivered)
    }

    /// Explicit `to` wins over the recorded pairing.
    fn resolve_target(
        &self,
        sender: &ConnectionId,
        to: Option<&ConnectionId>,
    ) -> Result<ConnectionId, DropReason> {
        match to {
            Some(target) if target != sender && self.registry.contains(target) => {
                Ok(target.clone())
            }
            Some(target) => {
                debug!(connection_id = %sender, to = %target, "recipient not connected");
                Err(DropReason::UnknownRecipient)
            }
            None => self.registry.resolve_peer(sender).ok_or_else(|| {
                debug!(connection_id = %sender, "no paired peer for message");
                DropReason::Unpaired
            }),
        }
    }

    fn forward(
        &self,
        sender: &ConnectionId,
        targets: Vec<ConnectionId>,
        message: ServerMessage,
    ) -> Vec<ConnectionId> {
        let kind = message.kind();
        let delivered: Vec<ConnectionId> = targets
            .into_iter()
            .filter(|target| self.registry.deliver(target, message.clone()))
            .collect();

        if !delivered.is_empty() {
            counter!(
                "beach_beacon_messages_forwarded_total",
                delivered.len() as u64,
                "type" => kind
            );
        }
        debug!(
            connection_id = %sender,
            kind,
            delivered = delivered.len(),
            "forwarded signaling message"
        );
        delivered
    }

    fn outcome(&self, delivered: Vec<ConnectionId>) -> RouteOutcome {
        if delivered.is_empty() {
            self.dropped(DropReason::NoTargets)
        } else {
            RouteOutcome::Delivered(delivered)
        }
    }

    fn dropped(&self, reason: DropReason) -> RouteOutcome {
        counter!("beach_beacon_messages_dropped_total", 1, "reason" => reason.as_str());
        RouteOutcome::Dropped(reason)
    }
}

fn expect_role(sender: &ConnectionId, actual: Role, expected: Role, kind: &'static str) {
    if actual != expected {
        warn!(
            connection_id = %sender,
            kind,
            role = actual.as_str(),
            expected = expected.as_str(),
            "routing message from unexpected role"
        );
    }
}

fn log_pairing(sender: &ConnectionId, peer: &ConnectionId, change: &PairingChange) {
    if change.displaced.is_empty() {
        info!(connection_id = %sender, peer = %peer, "connections paired");
    } else {
        info!(
            connection_id = %sender,
            peer = %peer,
            displaced = ?change.displaced,
            "connections paired; previous call abandoned"
        );
    }
}
