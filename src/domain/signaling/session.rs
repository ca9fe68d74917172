//! Session entity - per-client signaling state

use crate::domain::shared::error::{Result, SignalingError};
use crate::domain::shared::value_objects::SessionId;
use crate::domain::signaling::message::IceCandidate;
use crate::domain::telephony::TelephonyLeg;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Call setup phase
///
/// Declaration order is the forward order: a session never moves to an
/// earlier phase, though it may jump straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No call of our own; may hold a relayed offer not yet answered
    Idle,
    /// Telephony allocation for our own offer is in flight
    Offering,
    /// Caller: our offer is committed. Callee: our answer is being taken
    Offered,
    /// Callee answer accepted, relay to the caller pending
    Answering,
    Connected,
    Closing,
    Closed,
}

impl Phase {
    /// Check if phase transition is valid
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;

        match (*self, next) {
            (Idle, Offering) => true,
            (Idle, Offered) => true,
            (Offering, Offered) => true,
            (Offered, Answering) => true,
            (Offered, Connected) => true,
            (Answering, Connected) => true,

            (Closing, Closed) => true,
            (Closed, _) => false,
            (Closing, _) => false,
            (_, Closing) => true,
            (_, Closed) => true,

            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed)
    }
}

/// Which side of the exchange a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Callee,
}

/// One connected client
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    id: SessionId,
    phase: Phase,
    role: Option<Role>,
    /// Counterpart, lookup only
    peer: Option<SessionId>,
    telephony: Option<TelephonyLeg>,
    #[serde(skip)]
    offer_sdp: Option<String>,
    /// Our client has been handed the counterpart's description
    remote_description_set: bool,
    /// Candidates from our client not yet deliverable to the counterpart
    #[serde(skip)]
    pending_ice_candidates: Vec<IceCandidate>,
    /// Caller candidates already handed to a callee that has not answered;
    /// replayed to the next callee if this one withdraws
    #[serde(skip)]
    relayed_candidates: Vec<IceCandidate>,
    close_requested: bool,
    /// Rejected client messages so far
    violations: u32,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            phase: Phase::Idle,
            role: None,
            peer: None,
            telephony: None,
            offer_sdp: None,
            remote_description_set: false,
            pending_ice_candidates: Vec::new(),
            relayed_candidates: Vec::new(),
            close_requested: false,
            violations: 0,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn transition_to(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(SignalingError::ProtocolViolation(format!(
                "Cannot transition from {:?} to {:?}",
                self.phase, next
            )));
        }

        self.phase = next;
        Ok(())
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        self.role = Some(role);
    }

    pub(crate) fn link_peer(&mut self, peer: SessionId) {
        self.peer = Some(peer);
    }

    pub(crate) fn unlink_peer(&mut self) -> Option<SessionId> {
        self.peer.take()
    }

    pub(crate) fn attach_telephony(&mut self, leg: TelephonyLeg) {
        self.telephony = Some(leg);
    }

    pub(crate) fn take_telephony(&mut self) -> Option<TelephonyLeg> {
        self.telephony.take()
    }

    pub(crate) fn set_offer_sdp(&mut self, sdp: String) {
        self.offer_sdp = Some(sdp);
    }

    pub(crate) fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
    }

    pub(crate) fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_ice_candidates.push(candidate);
    }

    pub(crate) fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_ice_candidates)
    }

    pub(crate) fn record_relayed(&mut self, candidate: IceCandidate) {
        self.relayed_candidates.push(candidate);
    }

    pub(crate) fn clear_relayed(&mut self) {
        self.relayed_candidates.clear();
    }

    /// Put relayed candidates back in front of the pending ones
    pub(crate) fn restore_relayed(&mut self) {
        let mut restored = std::mem::take(&mut self.relayed_candidates);
        restored.append(&mut self.pending_ice_candidates);
        self.pending_ice_candidates = restored;
    }

    /// Drop a relayed offer that was never answered, back to a plain Idle
    /// session
    pub(crate) fn withdraw_offer(&mut self) {
        self.role = None;
        self.peer = None;
        self.remote_description_set = false;
        self.pending_ice_candidates.clear();
    }

    pub(crate) fn request_close(&mut self) {
        self.close_requested = true;
    }

    pub(crate) fn record_violation(&mut self) -> u32 {
        self.violations += 1;
        self.violations
    }

    // Getters
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn peer(&self) -> Option<SessionId> {
        self.peer
    }

    pub fn telephony(&self) -> Option<&TelephonyLeg> {
        self.telephony.as_ref()
    }

    pub fn offer_sdp(&self) -> Option<&str> {
        self.offer_sdp.as_deref()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_ice_candidates(&self) -> &[IceCandidate] {
        &self.pending_ice_candidates
    }

    pub fn relayed_candidates(&self) -> &[IceCandidate] {
        &self.relayed_candidates
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }

    /// Caller with a committed offer and nobody to deliver it to yet
    pub fn is_waiting_for_callee(&self) -> bool {
        self.phase == Phase::Offered && self.role == Some(Role::Caller) && self.peer.is_none()
    }

    /// Fresh session that can be handed a relayed offer
    pub fn is_available_callee(&self) -> bool {
        self.phase == Phase::Idle && self.peer.is_none() && !self.close_requested
    }

    /// Holds a relayed offer it has neither answered nor replaced with its own
    pub fn has_pending_offer(&self) -> bool {
        self.phase == Phase::Idle && self.role == Some(Role::Callee) && self.peer.is_some()
    }
}
