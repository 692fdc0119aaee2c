//! The Octagon state table.
//!
//! [`OctagonTransitions`] maps the current [`OctagonState`] and ready flags
//! to the next [`TransitionOp`]. Work happens in [`TrustCore`]; this module
//! only decides what runs next.

use crate::flags::{FlagSnapshot, OctagonFlag};
use crate::machine::{FlagHandler, TransitionEngine, TransitionOp};
use crate::trust_core::TrustCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Where a context stands in the account and trust lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OctagonState {
    Initializing,
    NoAccount,
    CheckCloudKitAccount,
    WaitingForCloudKitAccount,
    WaitForHSA2,
    DetermineCDPState,
    WaitForCDP,
    WaitForCDPUpdated,
    CheckTrustState,
    WaitForUnlock,
    BecomeUntrusted,
    Untrusted,
    BecomeReady,
    Ready,
    UpdateTrust,
    ResetAndEstablish,
    JoinWithVoucher,
    JoinWithBottle,
    JoinWithRecoveryKey,
    SetRecoveryKey,
    LeaveClique,
    RefetchPolicy,
}

impl OctagonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OctagonState::Initializing => "initializing",
            OctagonState::NoAccount => "no_account",
            OctagonState::CheckCloudKitAccount => "check_ck_account",
            OctagonState::WaitingForCloudKitAccount => "waiting_for_ck_account",
            OctagonState::WaitForHSA2 => "wait_for_hsa2",
            OctagonState::DetermineCDPState => "determine_cdp_state",
            OctagonState::WaitForCDP => "wait_for_cdp",
            OctagonState::WaitForCDPUpdated => "wait_for_cdp_updated",
            OctagonState::CheckTrustState => "check_trust_state",
            OctagonState::WaitForUnlock => "wait_for_unlock",
            OctagonState::BecomeUntrusted => "become_untrusted",
            OctagonState::Untrusted => "untrusted",
            OctagonState::BecomeReady => "become_ready",
            OctagonState::Ready => "ready",
            OctagonState::UpdateTrust => "update_trust",
            OctagonState::ResetAndEstablish => "reset_and_establish",
            OctagonState::JoinWithVoucher => "join_with_voucher",
            OctagonState::JoinWithBottle => "join_with_bottle",
            OctagonState::JoinWithRecoveryKey => "join_with_recovery_key",
            OctagonState::SetRecoveryKey => "set_recovery_key",
            OctagonState::LeaveClique => "leave_clique",
            OctagonState::RefetchPolicy => "refetch_policy",
        }
    }

    /// States the machine rests in until a flag or request arrives.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            OctagonState::NoAccount
                | OctagonState::WaitingForCloudKitAccount
                | OctagonState::WaitForHSA2
                | OctagonState::WaitForCDP
                | OctagonState::WaitForUnlock
                | OctagonState::Untrusted
                | OctagonState::Ready
        )
    }

    /// Stable states reached only with a signed-in account.
    fn has_account(&self) -> bool {
        self.is_stable() && *self != OctagonState::NoAccount
    }
}

impl fmt::Display for OctagonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags that make a trusted peer re-examine the peer list.
const TRUST_TRIGGERS: [OctagonFlag; 3] = [
    OctagonFlag::ReceivedPush,
    OctagonFlag::MachineIdListChanged,
    OctagonFlag::CheckTrustState,
];

/// Removes every flag in `triggers`; true if any was set.
fn take_any(flags: &mut FlagSnapshot, triggers: &[OctagonFlag]) -> bool {
    triggers
        .iter()
        .fold(false, |hit, flag| flags.check_and_remove(*flag) || hit)
}

pub(crate) struct OctagonTransitions {
    core: Arc<TrustCore>,
}

impl OctagonTransitions {
    pub(crate) fn new(core: Arc<TrustCore>) -> Self {
        Self { core }
    }

    fn op<F, Fut>(&self, name: &'static str, fallback: OctagonState, work: F) -> TransitionOp<OctagonState>
    where
        F: FnOnce(Arc<TrustCore>) -> Fut,
        Fut: std::future::Future<Output = crate::error::OctagonResult<OctagonState>> + Send + 'static,
    {
        TransitionOp::new(name, fallback, work(Arc::clone(&self.core)))
    }

    fn sign_out(&self) -> TransitionOp<OctagonState> {
        self.op("sign_out", OctagonState::NoAccount, |core| async move {
            core.sign_out().await
        })
    }

    fn cloudkit_lost(&self) -> TransitionOp<OctagonState> {
        self.op(
            "cloudkit_lost",
            OctagonState::WaitingForCloudKitAccount,
            |core| async move { core.cloudkit_lost().await },
        )
    }

    fn persist_cdp(&self, stay: OctagonState) -> TransitionOp<OctagonState> {
        self.op("persist_cdp_enabled", stay, move |core| async move {
            core.persist_cdp_enabled()?;
            Ok(stay)
        })
    }

    fn update_trust(&self) -> TransitionOp<OctagonState> {
        self.op("update_trust", OctagonState::Ready, |core| async move {
            core.update_trust_or_retry().await
        })
        .entering(OctagonState::UpdateTrust)
    }
}

impl TransitionEngine for OctagonTransitions {
    type State = OctagonState;

    fn next_transition(
        &self,
        current: &OctagonState,
        flags: &mut FlagSnapshot,
        _handler: &FlagHandler,
    ) -> Option<TransitionOp<OctagonState>> {
        use OctagonState as S;

        // Sign-out preempts everything once the account has been loaded.
        if !matches!(current, S::Initializing) && flags.check_and_remove(OctagonFlag::AccountUnavailable) {
            if *current == S::NoAccount {
                debug!("already signed out");
            } else {
                return Some(self.sign_out());
            }
        }

        if current.has_account() {
            // Already signed in.
            flags.check_and_remove(OctagonFlag::AccountAvailable);
            if *current != S::WaitForCDP && flags.check_and_remove(OctagonFlag::CdpEnabled) {
                return Some(self.persist_cdp(*current));
            }
        }

        match current {
            S::Initializing => Some(self.op("initialize", S::NoAccount, |core| async move {
                core.initialize()
            })),

            S::NoAccount => {
                // CloudKit state is rechecked after sign-in.
                flags.check_and_remove(OctagonFlag::CloudKitAccountAvailable);
                flags.check_and_remove(OctagonFlag::CloudKitAccountAbsent);
                if flags.check_and_remove(OctagonFlag::AccountAvailable) {
                    return Some(self.op("sign_in", S::NoAccount, |core| async move {
                        core.sign_in()
                    }));
                }
                None
            }

            S::CheckCloudKitAccount => Some(
                self.op("check_ck_account", S::WaitingForCloudKitAccount, |core| async move {
                    core.check_cloudkit().await
                }),
            ),

            S::WaitingForCloudKitAccount => {
                flags.check_and_remove(OctagonFlag::CloudKitAccountAbsent);
                flags
                    .check_and_remove(OctagonFlag::CloudKitAccountAvailable)
                    .then(|| TransitionOp::to_state("ck_account_available", S::CheckCloudKitAccount))
            }

            S::WaitForHSA2 => {
                if flags.check_and_remove(OctagonFlag::IdmsTrustLevelChanged) {
                    return Some(TransitionOp::to_state("idms_level_changed", S::CheckCloudKitAccount));
                }
                flags
                    .check_and_remove(OctagonFlag::CloudKitAccountAbsent)
                    .then(|| TransitionOp::to_state("ck_account_absent", S::WaitingForCloudKitAccount))
            }

            S::DetermineCDPState => Some(self.op("determine_cdp", S::WaitForCDP, |core| async move {
                core.determine_cdp().await
            })),

            S::WaitForCDP => {
                if flags.check_and_remove(OctagonFlag::CdpEnabled) {
                    return Some(
                        self.op("cdp_enabled", S::WaitForCDP, |core| async move {
                            core.persist_cdp_enabled()?;
                            Ok(OctagonState::DetermineCDPState)
                        })
                        .entering(S::WaitForCDPUpdated),
                    );
                }
                if flags.check_and_remove(OctagonFlag::ReceivedPush) {
                    return Some(TransitionOp::to_state("cdp_push", S::DetermineCDPState));
                }
                None
            }

            // Only visible while its op runs.
            S::WaitForCDPUpdated => Some(TransitionOp::to_state("cdp_updated", S::DetermineCDPState)),

            S::CheckTrustState => Some(self.op("check_trust", S::Untrusted, |core| async move {
                core.check_trust_or_retry().await
            })),

            S::WaitForUnlock => flags
                .check_and_remove(OctagonFlag::Unlocked)
                .then(|| TransitionOp::to_state("unlocked", S::CheckTrustState)),

            S::BecomeReady => Some(self.op("become_ready", S::Untrusted, |core| async move {
                core.become_ready().await
            })),

            S::BecomeUntrusted => Some(self.op("become_untrusted", S::Untrusted, |core| async move {
                core.become_untrusted().await
            })),

            S::Ready => {
                flags.check_and_remove(OctagonFlag::CloudKitAccountAvailable);
                if flags.check_and_remove(OctagonFlag::CloudKitAccountAbsent) {
                    return Some(self.cloudkit_lost());
                }
                take_any(flags, &TRUST_TRIGGERS).then(|| self.update_trust())
            }

            S::Untrusted => {
                flags.check_and_remove(OctagonFlag::CloudKitAccountAvailable);
                if flags.check_and_remove(OctagonFlag::CloudKitAccountAbsent) {
                    return Some(self.cloudkit_lost());
                }
                take_any(flags, &TRUST_TRIGGERS)
                    .then(|| TransitionOp::to_state("recheck_trust", S::CheckTrustState))
            }

            S::UpdateTrust => Some(self.update_trust()),

            // Request states are published by their ops and replaced when
            // the op finishes.
            S::ResetAndEstablish
            | S::JoinWithVoucher
            | S::JoinWithBottle
            | S::JoinWithRecoveryKey
            | S::SetRecoveryKey
            | S::LeaveClique
            | S::RefetchPolicy => None,
        }
    }
}

// ── Request source states ────────────────────────────────────────

pub(crate) const ESTABLISH_SOURCES: &[OctagonState] = &[
    OctagonState::WaitForCDP,
    OctagonState::Untrusted,
    OctagonState::Ready,
];

pub(crate) const JOIN_SOURCES: &[OctagonState] = &[OctagonState::Untrusted, OctagonState::WaitForCDP];

pub(crate) const TRUSTED_SOURCES: &[OctagonState] = &[OctagonState::Ready];

pub(crate) const REFETCH_SOURCES: &[OctagonState] = &[OctagonState::Ready, OctagonState::Untrusted];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_states() {
        let stable: Vec<OctagonState> = [
            OctagonState::Initializing,
            OctagonState::NoAccount,
            OctagonState::CheckTrustState,
            OctagonState::Untrusted,
            OctagonState::UpdateTrust,
            OctagonState::Ready,
        ]
        .into_iter()
        .filter(OctagonState::is_stable)
        .collect();
        assert_eq!(
            stable,
            vec![OctagonState::NoAccount, OctagonState::Untrusted, OctagonState::Ready]
        );
    }

    #[test]
    fn take_any_consumes_every_trigger() {
        let mut flags = FlagSnapshot::new([
            OctagonFlag::ReceivedPush,
            OctagonFlag::CheckTrustState,
            OctagonFlag::Unlocked,
        ]);
        assert!(take_any(&mut flags, &TRUST_TRIGGERS));
        assert_eq!(flags.iter().collect::<Vec<_>>(), vec![OctagonFlag::Unlocked]);
        assert!(!take_any(&mut flags, &TRUST_TRIGGERS));
    }

    #[test]
    fn display_names() {
        assert_eq!(OctagonState::WaitForCDP.to_string(), "wait_for_cdp");
        assert_eq!(OctagonState::Ready.to_string(), "ready");
    }
}
