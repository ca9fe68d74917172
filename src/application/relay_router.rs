//! Relay router
//!
//! Receives transport events, runs them through the signaling state machine
//! against the session registry and carries out the resulting effects:
//! telephony allocation and release, and outbound sends. Errors never leave
//! this boundary; they become a `call_error` for the originating client or
//! are dropped.
//!
//! Sends are delivered while the locks of the transition that produced them
//! are still held, so every client observes messages in transition order.
//! PBX work runs afterwards, outside any session lock.

use crate::application::metrics::{
    record_call_connected, record_call_failed, record_call_offered, record_protocol_violation,
    record_telephony_release, update_active_sessions,
};
use crate::config::Config;
use crate::domain::shared::error::{Result, SignalingError};
use crate::domain::shared::value_objects::SessionId;
use crate::domain::signaling::{
    Effect, IceCandidate, Phase, Session, SessionRegistry, SignalingMessage, SignalingStateMachine,
    Transport,
};
use crate::domain::telephony::{establish_leg, TelephonyControl, TelephonyLeg};
use crate::domain::user::UserDirectory;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

type TransportMap = HashMap<SessionId, Arc<dyn Transport>>;

/// Router settings
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// PBX endpoint dialled for each offer
    pub endpoint: String,
    /// Violations before a session is closed; 0 never closes
    pub max_protocol_violations: u32,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.telephony.endpoint.clone(),
            max_protocol_violations: config.signaling.max_protocol_violations,
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Work left once a transition's sends went out
#[derive(Debug, Default)]
struct Pending {
    allocations: Vec<SessionId>,
    releases: Vec<(SessionId, TelephonyLeg)>,
    /// Sessions that lost an unanswered counterpart
    rendezvous: Vec<SessionId>,
    /// Sessions whose transport failed; handled like a disconnect
    failed: Vec<SessionId>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.allocations.is_empty()
            && self.releases.is_empty()
            && self.rendezvous.is_empty()
            && self.failed.is_empty()
    }

    fn fail(&mut self, id: SessionId) {
        if !self.failed.contains(&id) {
            self.failed.push(id);
        }
    }

    fn merge(&mut self, other: Pending) {
        self.allocations.extend(other.allocations);
        self.releases.extend(other.releases);
        self.rendezvous.extend(other.rendezvous);
        for id in other.failed {
            self.fail(id);
        }
    }
}

/// Relay router
pub struct RelayRouter {
    registry: Arc<SessionRegistry>,
    telephony: Arc<dyn TelephonyControl>,
    users: Arc<dyn UserDirectory>,
    /// Outbound handles, session_id -> transport; never held across an await
    transports: RwLock<TransportMap>,
    settings: RouterSettings,
}

impl RelayRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        telephony: Arc<dyn TelephonyControl>,
        users: Arc<dyn UserDirectory>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            telephony,
            users,
            transports: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Transport established: create the session and offer it any waiting
    /// caller
    ///
    /// The transport is registered before the session, so a rendezvous can
    /// never pick a session it cannot deliver to.
    pub async fn on_connect(&self, id: SessionId, transport: Arc<dyn Transport>) -> Result<()> {
        {
            let mut transports = self.transports_mut();
            if transports.contains_key(&id) {
                return Err(SignalingError::DuplicateSession(id));
            }
            transports.insert(id, transport);
        }
        if let Err(e) = self.registry.create(id).await {
            self.transports_mut().remove(&id);
            return Err(e);
        }
        update_active_sessions(self.registry.len().await);
        info!("Session {} connected", id);

        let pending = self.rendezvous_as_callee(id).await;
        self.run(pending).await;
        Ok(())
    }

    /// Inbound client message
    pub async fn on_inbound_message(&self, id: SessionId, message: SignalingMessage) {
        if !self.registry.contains(id).await {
            debug!("Dropping {} from unknown session {}", message.kind(), id);
            return;
        }
        debug!("Received {} from session {}", message.kind(), id);

        let result = match message {
            SignalingMessage::Offer { sdp } => self.handle_offer(id, sdp).await,
            SignalingMessage::Answer { sdp } => self.handle_answer(id, sdp).await,
            SignalingMessage::IceCandidate { candidate } => {
                // Logged only; the sender is never told about relay failures
                if let Err(e) = self.handle_ice_candidate(id, candidate).await {
                    warn!("Error handling ICE candidate from session {}: {}", id, e);
                }
                return;
            }
            SignalingMessage::Register { username, password } => {
                self.handle_register(id, &username, &password).await;
                return;
            }
            other => {
                debug!("Ignoring server-only message {} from session {}", other.kind(), id);
                return;
            }
        };

        if let Err(e) = result {
            self.reject(id, e).await;
        }
    }

    /// Transport gone; safe to call more than once
    pub async fn on_disconnect(&self, id: SessionId) {
        info!("Session {} disconnected", id);
        let pending = self.close_session(id, true).await;
        self.run(pending).await;
    }

    /// Commit an offer and allocate its PBX leg
    ///
    /// On success nothing goes back to the sender: its `answer` arrives once
    /// a counterpart picks the offer up and answers. Failures come back as
    /// `call_error`. An unanswered offer relayed to this session is handed
    /// back to its caller first.
    async fn handle_offer(&self, id: SessionId, sdp: String) -> Result<()> {
        let pending = self
            .registry
            .update_with_peer(id, |s, peer| {
                SignalingStateMachine::offer(s, peer, sdp).map(|effects| self.dispatch(effects))
            })
            .await??;

        info!("Offer from session {}, allocating telephony", id);
        record_call_offered();
        self.run(pending).await;
        Ok(())
    }

    async fn handle_answer(&self, id: SessionId, sdp: String) -> Result<()> {
        let session = self.registry.get(id).await?;
        let caller = SignalingStateMachine::check_answer(&session)?;

        let pending = self
            .registry
            .update_pair(id, caller, |callee, caller| {
                SignalingStateMachine::answer(callee, caller, sdp).map(|effects| self.dispatch(effects))
            })
            .await??;

        info!("Session {} answered, call with {} connected", id, caller);
        record_call_connected();
        self.run(pending).await;
        Ok(())
    }

    async fn handle_ice_candidate(&self, id: SessionId, candidate: IceCandidate) -> Result<()> {
        let pending = self
            .registry
            .update_with_peer(id, |s, peer| {
                SignalingStateMachine::ice_candidate(s, peer, candidate)
                    .map(|effects| self.dispatch(effects))
            })
            .await??;

        self.run(pending).await;
        Ok(())
    }

    async fn handle_register(&self, id: SessionId, username: &str, password: &str) {
        let reply = match self.users.register(username, password).await {
            Ok(user) => SignalingMessage::RegistrationSuccess {
                username: user.username,
            },
            Err(e) => {
                warn!("Registration failed for session {}: {}", id, e);
                SignalingMessage::RegistrationError {
                    message: e.to_string(),
                }
            }
        };

        let pending = self.dispatch(vec![Effect::Send {
            to: id,
            message: reply,
        }]);
        self.run(pending).await;
    }

    /// Report an error to the originating session only
    async fn reject(&self, id: SessionId, error: SignalingError) {
        match &error {
            SignalingError::NotFound(missing) if *missing == id => {
                debug!("Session {} is gone, dropping message", id);
                return;
            }
            SignalingError::DuplicateSession(_) => {
                error!("Registry inconsistency for session {}: {}", id, error);
                return;
            }
            _ => {}
        }

        warn!("Rejecting message from session {}: {}", id, error);
        let mut pending = self.dispatch(vec![Effect::Send {
            to: id,
            message: SignalingMessage::CallError {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        }]);

        if matches!(error, SignalingError::ProtocolViolation(_)) {
            record_protocol_violation();
            let count = self
                .registry
                .update(id, Session::record_violation)
                .await
                .unwrap_or(0);
            let limit = self.settings.max_protocol_violations;
            if limit > 0 && count >= limit {
                warn!("Session {} reached {} protocol violations, closing", id, count);
                pending.merge(self.close_session(id, false).await);
            }
        }

        self.run(pending).await;
    }

    /// Drive a session to Closed; `forget` also drops it from the registry
    /// once no allocation is in flight
    async fn close_session(&self, id: SessionId, forget: bool) -> Pending {
        let (deferred, pending) = match self
            .registry
            .update_with_peer(id, |s, peer| {
                let teardown = SignalingStateMachine::disconnect(s, peer);
                (teardown.deferred, self.dispatch(teardown.effects))
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!("Session {} already removed", id);
                if forget {
                    self.forget(id).await;
                }
                return Pending::default();
            }
        };

        if deferred {
            info!("Session {} closes once its telephony allocation completes", id);
            if forget {
                self.transports_mut().remove(&id);
            }
        } else if forget {
            self.forget(id).await;
        }

        pending
    }

    async fn forget(&self, id: SessionId) {
        self.registry.remove(id).await;
        self.transports_mut().remove(&id);
        update_active_sessions(self.registry.len().await);
    }

    /// Allocate the PBX leg for an offering session and commit the outcome
    async fn allocate(&self, id: SessionId) -> Pending {
        let outcome = establish_leg(self.telephony.as_ref(), &self.settings.endpoint).await;

        let mut pending = match outcome {
            Ok(leg) => {
                let committed = leg.clone();
                match self
                    .registry
                    .update(id, move |s| {
                        SignalingStateMachine::allocation_succeeded(s, committed)
                            .map(|effects| self.dispatch(effects))
                    })
                    .await
                {
                    Ok(Ok(pending)) => pending,
                    Ok(Err(e)) | Err(e) => {
                        error!("Cannot commit telephony leg for session {}: {}", id, e);
                        Pending {
                            releases: vec![(id, leg)],
                            ..Pending::default()
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Telephony allocation failed for session {}: {}", id, e);
                record_call_failed("telephony");
                self.registry
                    .update(id, |s| self.dispatch(SignalingStateMachine::allocation_failed(s, &e)))
                    .await
                    .unwrap_or_default()
            }
        };

        // Only a disconnect drops the transport; other closes keep the entry
        let disconnected = !self.transports().contains_key(&id);
        match self.registry.get(id).await {
            Ok(session) if session.phase() == Phase::Offered => {
                pending.merge(self.rendezvous_as_caller(id).await);
            }
            Ok(session)
                if session.phase() == Phase::Closed && session.close_requested() && disconnected =>
            {
                info!("Completed deferred close of session {}", id);
                self.forget(id).await;
            }
            _ => {}
        }

        pending
    }

    /// Find a new counterpart for a session that lost its unanswered one
    async fn rendezvous(&self, id: SessionId) -> Pending {
        match self.registry.get(id).await {
            Ok(session) if session.is_waiting_for_callee() => self.rendezvous_as_caller(id).await,
            Ok(session) if session.is_available_callee() => self.rendezvous_as_callee(id).await,
            _ => Pending::default(),
        }
    }

    async fn rendezvous_as_caller(&self, caller: SessionId) -> Pending {
        for callee in self.registry.available_callees(caller).await {
            if let Some(pending) = self.try_pair(caller, callee).await {
                return pending;
            }
        }

        info!("Session {} is waiting for a counterpart", caller);
        Pending::default()
    }

    async fn rendezvous_as_callee(&self, callee: SessionId) -> Pending {
        for caller in self.registry.waiting_callers(callee).await {
            if let Some(pending) = self.try_pair(caller, callee).await {
                return pending;
            }
        }

        Pending::default()
    }

    /// Relay the caller's offer; `None` if either side moved on meanwhile
    async fn try_pair(&self, caller: SessionId, callee: SessionId) -> Option<Pending> {
        match self
            .registry
            .update_pair(caller, callee, |caller, callee| {
                SignalingStateMachine::pair(caller, callee).map(|effects| self.dispatch(effects))
            })
            .await
        {
            Ok(Ok(pending)) => {
                info!("Relayed offer from session {} to session {}", caller, callee);
                Some(pending)
            }
            Ok(Err(e)) | Err(e) => {
                debug!("Cannot pair {} with {}: {}", caller, callee, e);
                None
            }
        }
    }

    /// Carry out PBX work and transport failures until nothing is left
    async fn run(&self, mut pending: Pending) {
        while !pending.is_empty() {
            for (session_id, leg) in std::mem::take(&mut pending.releases) {
                info!(
                    "Releasing telephony for session {}: channel {} bridge {:?}",
                    session_id,
                    leg.channel_id,
                    leg.bridge_id.as_ref().map(|b| b.as_str())
                );
                self.telephony.release(Some(leg.channel_id), leg.bridge_id).await;
                record_telephony_release();
            }

            for id in std::mem::take(&mut pending.rendezvous) {
                let next = self.rendezvous(id).await;
                pending.merge(next);
            }

            for id in std::mem::take(&mut pending.allocations) {
                let next = self.allocate(id).await;
                pending.merge(next);
            }

            for id in std::mem::take(&mut pending.failed) {
                let next = self.close_session(id, true).await;
                pending.merge(next);
            }
        }
    }

    /// Deliver sends now and collect the rest
    fn dispatch(&self, effects: Vec<Effect>) -> Pending {
        let mut pending = Pending::default();

        for effect in effects {
            match effect {
                Effect::Send { to, message } => {
                    let kind = message.kind();
                    if let Err(e) = self.deliver(to, message) {
                        warn!("Failed to send {} to session {}: {}", kind, to, e);
                        pending.fail(to);
                    }
                }
                Effect::AllocateTelephony { session_id } => pending.allocations.push(session_id),
                Effect::ReleaseTelephony { session_id, leg } => {
                    pending.releases.push((session_id, leg))
                }
                Effect::Rendezvous { session_id } => pending.rendezvous.push(session_id),
            }
        }

        pending
    }

    fn deliver(&self, to: SessionId, message: SignalingMessage) -> Result<()> {
        let transport = self.transports().get(&to).cloned().ok_or_else(|| {
            SignalingError::TransportError(format!("no transport for session {}", to))
        })?;

        transport.send(message)
    }

    fn transports(&self) -> RwLockReadGuard<'_, TransportMap> {
        self.transports.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn transports_mut(&self) -> RwLockWriteGuard<'_, TransportMap> {
        self.transports.write().unwrap_or_else(PoisonError::into_inner)
    }
}
