//! Master-slave determination
//!
//! ```text
//!           start()
//!   Idle ──────────────▶ DetermineSent ──Ack(decision)──▶ Master | Slave
//!     │                        │
//!     │ MSD received           │ MSD received
//!     ▼                        ▼
//!   determine_master(terminal types, 24-bit numbers)
//!     ├─ Master / Slave ──▶ send Ack (remote's role)
//!     └─ Indeterminate ───▶ send Reject(identicalNumbers)
//! ```
//!
//! A rejected determination is retried with a fresh number up to
//! `max_msd_retries` times; an expired MSD timer releases the procedure and
//! clears the call.

use std::fmt;

use rand::Rng;
use tracing::{debug, info, warn};

use rvoip_h323_proto::h245::{
    IndicationMessage, MasterSlaveDetermination, MasterSlaveDeterminationAck,
    MasterSlaveDeterminationReject, MsdDecision, MsdRejectCause, RequestMessage, ResponseMessage,
};
use rvoip_h323_proto::H245Message;

use crate::call::{CallRecord, MsdState};
use crate::errors::{CallEndReason, CallResult};
use crate::timer::TimerClass;

const STATUS_NUMBER_MASK: u32 = 0x00FF_FFFF;
const STATUS_NUMBER_HALF: u32 = 0x0080_0000;

/// Outcome of comparing terminal types and status determination numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsdOutcome {
    /// This endpoint is master
    Master,
    Slave,
    /// Numbers are equal or exactly half the modulus apart
    Indeterminate,
}

impl fmt::Display for MsdOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsdOutcome::Master => write!(f, "Master"),
            MsdOutcome::Slave => write!(f, "Slave"),
            MsdOutcome::Indeterminate => write!(f, "Indeterminate"),
        }
    }
}

/// Decide the local role from both terminal types and status numbers
///
/// The higher terminal type wins. On equal types the numbers are compared
/// modulo 2^24: the local side is master when `(remote - local) mod 2^24`
/// lies strictly between 0 and 2^23.
pub fn determine_master(
    local_type: u8,
    local_number: u32,
    remote_type: u8,
    remote_number: u32,
) -> MsdOutcome {
    if local_type != remote_type {
        return if remote_type < local_type { MsdOutcome::Master } else { MsdOutcome::Slave };
    }
    let diff = remote_number.wrapping_sub(local_number) & STATUS_NUMBER_MASK;
    if diff == 0 || diff == STATUS_NUMBER_HALF {
        MsdOutcome::Indeterminate
    } else if diff < STATUS_NUMBER_HALF {
        MsdOutcome::Master
    } else {
        MsdOutcome::Slave
    }
}

/// Fresh 24-bit status determination number
pub fn random_status_number() -> u32 {
    rand::thread_rng().gen_range(0..=STATUS_NUMBER_MASK)
}

impl CallRecord {
    /// Send our determination request; no-op unless idle
    pub(crate) fn begin_msd(&mut self) -> CallResult<()> {
        if self.msd.state != MsdState::Idle {
            debug!(call = %self.token, "Master-slave determination already {}", self.msd.state);
            return Ok(());
        }
        self.msd.local_number = random_status_number();
        let request = MasterSlaveDetermination {
            terminal_type: self.ctx.config.terminal_type,
            status_determination_number: self.msd.local_number,
        };
        info!(
            call = %self.token,
            number = self.msd.local_number,
            "Sending MasterSlaveDetermination"
        );
        self.send_h245(H245Message::Request(RequestMessage::MasterSlaveDetermination(request)))?;
        self.msd.state = MsdState::DetermineSent;
        self.timers.arm(TimerClass::Msd, None, self.ctx.config.timers.msd());
        Ok(())
    }

    pub(crate) fn on_msd_request(&mut self, request: MasterSlaveDetermination) -> CallResult<()> {
        if self.msd.state != MsdState::DetermineSent {
            self.msd.local_number = random_status_number();
        }
        let outcome = determine_master(
            self.ctx.config.terminal_type,
            self.msd.local_number,
            request.terminal_type,
            request.status_determination_number,
        );
        debug!(
            call = %self.token,
            local = self.msd.local_number,
            remote = request.status_determination_number,
            "Master-slave determination outcome {}", outcome
        );

        let (state, remote_role) = match outcome {
            MsdOutcome::Master => (MsdState::Master, MsdDecision::Slave),
            MsdOutcome::Slave => (MsdState::Slave, MsdDecision::Master),
            MsdOutcome::Indeterminate => {
                warn!(call = %self.token, "Identical status determination numbers");
                let reject =
                    MasterSlaveDeterminationReject { cause: MsdRejectCause::IdenticalNumbers };
                return self.send_h245(H245Message::Response(
                    ResponseMessage::MasterSlaveDeterminationReject(reject),
                ));
            }
        };
        self.msd.state = state;
        info!(call = %self.token, "Master-slave determination: local is {}", state);
        self.send_h245(H245Message::Response(ResponseMessage::MasterSlaveDeterminationAck(
            MasterSlaveDeterminationAck { decision: remote_role },
        )))
    }

    pub(crate) fn on_msd_ack(&mut self, ack: MasterSlaveDeterminationAck) -> CallResult<()> {
        self.timers.cancel_class(TimerClass::Msd, None);

        if self.msd.state == MsdState::DetermineSent {
            let (state, remote_role) = match ack.decision {
                MsdDecision::Master => (MsdState::Master, MsdDecision::Slave),
                MsdDecision::Slave => (MsdState::Slave, MsdDecision::Master),
            };
            self.msd.state = state;
            info!(
                call = %self.token,
                "Master-slave determination acknowledged: local is {}", state
            );
            self.send_h245(H245Message::Response(ResponseMessage::MasterSlaveDeterminationAck(
                MasterSlaveDeterminationAck { decision: remote_role },
            )))?;
        }
        self.msd.remote_acked = true;
        self.open_channels_if_ready()
    }

    pub(crate) fn on_msd_reject(
        &mut self,
        reject: MasterSlaveDeterminationReject,
    ) -> CallResult<()> {
        self.timers.cancel_class(TimerClass::Msd, None);
        if self.msd.retries < self.ctx.config.max_msd_retries {
            self.msd.retries += 1;
            warn!(
                call = %self.token,
                cause = ?reject.cause,
                retry = self.msd.retries,
                "Master-slave determination rejected, retrying"
            );
            self.msd.state = MsdState::Idle;
            self.begin_msd()
        } else {
            warn!(
                call = %self.token,
                "Master-slave determination failed after {} retries", self.msd.retries
            );
            self.clear_call(CallEndReason::LocalCleared);
            Ok(())
        }
    }

    pub(crate) fn on_msd_release(&mut self) {
        self.timers.cancel_class(TimerClass::Msd, None);
        if !self.msd.state.is_resolved() {
            debug!(call = %self.token, "Master-slave determination released by remote");
            self.msd.state = MsdState::Idle;
        }
    }

    pub(crate) fn on_msd_timeout(&mut self) -> CallResult<()> {
        let release = IndicationMessage::MasterSlaveDeterminationRelease;
        let result = self.send_h245(H245Message::Indication(release));
        self.clear_call(CallEndReason::LocalCleared);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_terminal_type_decides_first() {
        assert_eq!(determine_master(60, 5, 50, 0x7fffff), MsdOutcome::Master);
        assert_eq!(determine_master(50, 5, 60, 1), MsdOutcome::Slave);
    }

    #[test]
    fn test_number_comparison() {
        assert_eq!(determine_master(60, 100, 60, 200), MsdOutcome::Master);
        assert_eq!(determine_master(60, 200, 60, 100), MsdOutcome::Slave);
        // Wraps modulo 2^24
        assert_eq!(determine_master(60, 0xFFFFF0, 60, 0x10), MsdOutcome::Master);
    }

    #[test]
    fn test_indeterminate_cases() {
        assert_eq!(determine_master(60, 42, 60, 42), MsdOutcome::Indeterminate);
        assert_eq!(determine_master(60, 0, 60, 0x800000), MsdOutcome::Indeterminate);
        assert_eq!(determine_master(60, 0x900000, 60, 0x100000), MsdOutcome::Indeterminate);
    }

    #[test]
    fn test_random_number_is_24_bit() {
        for _ in 0..100 {
            assert!(random_status_number() <= STATUS_NUMBER_MASK);
        }
    }

    proptest! {
        #[test]
        fn prop_roles_are_complementary(
            local in 0u32..=0xFFFFFF,
            remote in 0u32..=0xFFFFFF,
            lt in 0u8..=255,
            rt in 0u8..=255,
        ) {
            let ours = determine_master(lt, local, rt, remote);
            let theirs = determine_master(rt, remote, lt, local);
            let expected = match ours {
                MsdOutcome::Master => MsdOutcome::Slave,
                MsdOutcome::Slave => MsdOutcome::Master,
                MsdOutcome::Indeterminate => MsdOutcome::Indeterminate,
            };
            prop_assert_eq!(theirs, expected);
        }
    }
}
