//! Signaling state machine
//!
//! Pure, synchronous transitions over [`Session`] values. Each transition
//! validates the current phase, mutates the session(s) it was handed and
//! returns the [`Effect`]s the caller must carry out. Nothing here performs
//! I/O; the relay router executes the effects.
//!
//! Transitions that involve both parties take both sessions so that the
//! caller can apply them under both session locks at once.

use crate::domain::shared::error::{Result, SignalingError};
use crate::domain::shared::value_objects::SessionId;
use crate::domain::signaling::message::{IceCandidate, SignalingMessage};
use crate::domain::signaling::session::{Phase, Role, Session};
use crate::domain::telephony::TelephonyLeg;

/// Work produced by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Deliver a message to one session's transport
    Send {
        to: SessionId,
        message: SignalingMessage,
    },
    /// Allocate channel and bridge for the session, then report back through
    /// `allocation_succeeded` / `allocation_failed`
    AllocateTelephony { session_id: SessionId },
    /// Release PBX resources that belonged to the session
    ReleaseTelephony {
        session_id: SessionId,
        leg: TelephonyLeg,
    },
    /// Session lost its counterpart before a call was set up; look for a
    /// new one
    Rendezvous { session_id: SessionId },
}

impl Effect {
    fn send(to: SessionId, message: SignalingMessage) -> Self {
        Effect::Send { to, message }
    }

    fn candidate(to: SessionId, candidate: IceCandidate) -> Self {
        Effect::Send {
            to,
            message: SignalingMessage::IceCandidate { candidate },
        }
    }
}

/// Outcome of a disconnect
#[derive(Debug, Clone, PartialEq)]
pub struct Teardown {
    pub effects: Vec<Effect>,
    /// Allocation still in flight; it finishes the close when it completes
    pub deferred: bool,
}

/// Signaling transitions
pub struct SignalingStateMachine;

impl SignalingStateMachine {
    /// Client sent an offer: Idle -> Offering
    ///
    /// A session holding a relayed offer it has not answered gives that
    /// offer back first; `peer` is the caller it came from, which goes back
    /// to waiting.
    pub fn offer(
        session: &mut Session,
        peer: Option<&mut Session>,
        sdp: String,
    ) -> Result<Vec<Effect>> {
        if session.phase() != Phase::Idle {
            return Err(SignalingError::protocol(format!(
                "offer not allowed in phase {:?}",
                session.phase()
            )));
        }

        let mut effects = Vec::new();
        if session.has_pending_offer() {
            effects.extend(Self::withdraw(session, peer));
        }

        session.transition_to(Phase::Offering)?;
        session.set_role(Role::Caller);
        session.set_offer_sdp(sdp);

        effects.push(Effect::AllocateTelephony {
            session_id: session.id(),
        });
        Ok(effects)
    }

    /// PBX leg ready: Offering -> Offered
    ///
    /// If the client disconnected meanwhile the fresh leg is released and
    /// the session closes instead.
    pub fn allocation_succeeded(session: &mut Session, leg: TelephonyLeg) -> Result<Vec<Effect>> {
        match session.phase() {
            Phase::Offering => {
                session.transition_to(Phase::Offered)?;
                session.attach_telephony(leg);
                Ok(Vec::new())
            }
            Phase::Closing if session.close_requested() => {
                session.transition_to(Phase::Closed)?;
                Ok(vec![Effect::ReleaseTelephony {
                    session_id: session.id(),
                    leg,
                }])
            }
            phase => Err(SignalingError::protocol(format!(
                "allocation completed in phase {:?}",
                phase
            ))),
        }
    }

    /// PBX allocation failed: Offering -> Closed
    ///
    /// Partial resources were already released by the allocation itself.
    pub fn allocation_failed(session: &mut Session, error: &SignalingError) -> Vec<Effect> {
        let notify = !session.close_requested();
        if session.phase().is_terminal() {
            return Vec::new();
        }

        session.take_pending_candidates();
        let _ = session.transition_to(Phase::Closed);

        if notify {
            vec![Effect::send(
                session.id(),
                SignalingMessage::CallError {
                    code: error.code().to_string(),
                    message: error.to_string(),
                },
            )]
        } else {
            Vec::new()
        }
    }

    /// Rendezvous: relay a waiting caller's offer to a fresh session
    ///
    /// The callee stays Idle until it answers, so it can still place a call
    /// of its own instead.
    pub fn pair(caller: &mut Session, callee: &mut Session) -> Result<Vec<Effect>> {
        if !caller.is_waiting_for_callee() {
            return Err(SignalingError::protocol(format!(
                "session {} is not waiting for a callee",
                caller.id()
            )));
        }
        if !callee.is_available_callee() {
            return Err(SignalingError::protocol(format!(
                "session {} cannot take an offer",
                callee.id()
            )));
        }
        let sdp = caller
            .offer_sdp()
            .map(str::to_string)
            .ok_or_else(|| SignalingError::protocol("caller has no offer"))?;

        callee.set_role(Role::Callee);
        callee.link_peer(caller.id());
        callee.mark_remote_description_set();
        caller.link_peer(callee.id());

        let mut effects = vec![Effect::send(callee.id(), SignalingMessage::Offer { sdp })];
        for candidate in caller.take_pending_candidates() {
            caller.record_relayed(candidate.clone());
            effects.push(Effect::candidate(callee.id(), candidate));
        }
        Ok(effects)
    }

    /// Guard for an inbound answer, checked before the caller is looked up
    pub fn check_answer(callee: &Session) -> Result<SessionId> {
        if !callee.has_pending_offer() {
            return Err(SignalingError::protocol(format!(
                "answer not allowed in phase {:?} without a pending offer",
                callee.phase()
            )));
        }

        callee
            .peer()
            .ok_or_else(|| SignalingError::protocol("answer without a counterpart"))
    }

    /// Callee answered: callee Idle -> Offered -> Answering -> Connected and
    /// the offering side Offered -> Connected
    pub fn answer(callee: &mut Session, caller: &mut Session, sdp: String) -> Result<Vec<Effect>> {
        let expected = Self::check_answer(callee)?;
        if expected != caller.id() || caller.peer() != Some(callee.id()) {
            return Err(SignalingError::protocol("answer does not match the pending offer"));
        }
        if caller.phase() != Phase::Offered {
            return Err(SignalingError::protocol(format!(
                "offering side is in phase {:?}",
                caller.phase()
            )));
        }

        callee.transition_to(Phase::Offered)?;
        callee.transition_to(Phase::Answering)?;
        caller.transition_to(Phase::Connected)?;
        caller.mark_remote_description_set();
        caller.clear_relayed();
        callee.transition_to(Phase::Connected)?;

        let mut effects = vec![Effect::send(caller.id(), SignalingMessage::Answer { sdp })];
        effects.extend(
            callee
                .take_pending_candidates()
                .into_iter()
                .map(|c| Effect::candidate(caller.id(), c)),
        );
        Ok(effects)
    }

    /// Trickled candidate from `sender`
    ///
    /// Forwarded once the counterpart has applied our description, buffered
    /// until then. Order of receipt is kept either way.
    pub fn ice_candidate(
        sender: &mut Session,
        peer: Option<&mut Session>,
        candidate: IceCandidate,
    ) -> Result<Vec<Effect>> {
        match sender.phase() {
            Phase::Offering | Phase::Offered | Phase::Answering | Phase::Connected => {}
            Phase::Idle if sender.has_pending_offer() => {}
            phase => {
                return Err(SignalingError::protocol(format!(
                    "icecandidate not allowed in phase {:?}",
                    phase
                )))
            }
        }

        sender.buffer_candidate(candidate);

        let peer = match peer {
            Some(peer) if peer.remote_description_set() => peer,
            _ => return Ok(Vec::new()),
        };

        // Until the callee answers it may still withdraw; keep copies
        let unanswered = sender.role() == Some(Role::Caller) && sender.phase() == Phase::Offered;
        let mut effects = Vec::new();
        for candidate in sender.take_pending_candidates() {
            if unanswered {
                sender.record_relayed(candidate.clone());
            }
            effects.push(Effect::candidate(peer.id(), candidate));
        }
        Ok(effects)
    }

    /// Transport went away
    ///
    /// Idempotent: a closing or closed session yields no effects. A peer in
    /// an established or answering call is told to hang up and closed as
    /// well. Before the callee answers nobody is closed but the leaving
    /// session: a leaving callee hands the offer back to its caller, and the
    /// callee of a leaving caller gets `hangup` and stays Idle.
    pub fn disconnect(session: &mut Session, peer: Option<&mut Session>) -> Teardown {
        if matches!(session.phase(), Phase::Closing | Phase::Closed) {
            return Teardown {
                effects: Vec::new(),
                deferred: session.phase() == Phase::Closing,
            };
        }

        let mut effects = Vec::new();
        if session.has_pending_offer() {
            effects.extend(Self::withdraw(session, peer));
        } else if let Some(peer) = peer {
            if peer.peer() == Some(session.id()) {
                effects.push(Effect::send(peer.id(), SignalingMessage::Hangup));
                if peer.has_pending_offer() {
                    peer.withdraw_offer();
                    effects.push(Effect::Rendezvous {
                        session_id: peer.id(),
                    });
                } else {
                    peer.unlink_peer();
                    effects.extend(Self::close(peer));
                }
            }
        }
        session.unlink_peer();
        effects.extend(Self::close(session));

        Teardown {
            effects,
            deferred: session.phase() == Phase::Closing,
        }
    }

    /// Give an unanswered relayed offer back to the caller it came from
    fn withdraw(callee: &mut Session, caller: Option<&mut Session>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(caller) = caller {
            if caller.peer() == Some(callee.id()) {
                caller.unlink_peer();
                caller.restore_relayed();
                effects.push(Effect::Rendezvous {
                    session_id: caller.id(),
                });
            }
        }
        callee.withdraw_offer();
        effects
    }

    /// Drive a session to Closed, handing back owned PBX resources
    ///
    /// A session whose allocation is still in flight stops at Closing with
    /// the close recorded; the allocation outcome finishes it.
    fn close(session: &mut Session) -> Vec<Effect> {
        session.take_pending_candidates();

        if session.phase() == Phase::Offering {
            session.request_close();
            let _ = session.transition_to(Phase::Closing);
            return Vec::new();
        }

        let _ = session.transition_to(Phase::Closing);
        let released = session.take_telephony();
        let _ = session.transition_to(Phase::Closed);

        released
            .map(|leg| Effect::ReleaseTelephony {
                session_id: session.id(),
                leg,
            })
            .into_iter()
            .collect()
    }
}
