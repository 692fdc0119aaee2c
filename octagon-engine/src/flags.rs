//! Flags: named triggers consumed by the state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A trigger for the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OctagonFlag {
    AccountAvailable,
    AccountUnavailable,
    CloudKitAccountAvailable,
    CloudKitAccountAbsent,
    /// The account was promoted to two-factor auth.
    IdmsTrustLevelChanged,
    CdpEnabled,
    /// The remote peer list changed.
    ReceivedPush,
    MachineIdListChanged,
    Unlocked,
    /// Retry of a trust check that could not complete.
    CheckTrustState,
}

impl OctagonFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OctagonFlag::AccountAvailable => "account_available",
            OctagonFlag::AccountUnavailable => "account_unavailable",
            OctagonFlag::CloudKitAccountAvailable => "ck_account_available",
            OctagonFlag::CloudKitAccountAbsent => "ck_account_absent",
            OctagonFlag::IdmsTrustLevelChanged => "idms_level",
            OctagonFlag::CdpEnabled => "cdp_enabled",
            OctagonFlag::ReceivedPush => "recd_push",
            OctagonFlag::MachineIdListChanged => "machine_id_list_changed",
            OctagonFlag::Unlocked => "unlocked",
            OctagonFlag::CheckTrustState => "check_trust_state",
        }
    }
}

impl fmt::Display for OctagonFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An external condition a pending flag can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    DeviceUnlocked,
}

/// A flag released once its delay has elapsed and its condition holds.
///
/// With both set, both must be satisfied. A pending flag with neither is
/// released on the next pass of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFlag {
    pub flag: OctagonFlag,
    pub delay: Option<Duration>,
    pub condition: Option<Condition>,
}

impl PendingFlag {
    pub fn new(flag: OctagonFlag) -> Self {
        Self {
            flag,
            delay: None,
            condition: None,
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// The ready flags handed to one transition decision.
///
/// Insertion-ordered and deduplicated. Flags the engine does not consume are
/// put back for the next decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSnapshot {
    flags: Vec<OctagonFlag>,
}

impl FlagSnapshot {
    pub fn new(flags: impl IntoIterator<Item = OctagonFlag>) -> Self {
        let mut snapshot = Self::default();
        for flag in flags {
            snapshot.insert(flag);
        }
        snapshot
    }

    /// Adds a flag. Returns false if it was already present.
    pub fn insert(&mut self, flag: OctagonFlag) -> bool {
        if self.flags.contains(&flag) {
            return false;
        }
        self.flags.push(flag);
        true
    }

    pub fn contains(&self, flag: OctagonFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Removes `flag` if present and reports whether it was.
    pub fn check_and_remove(&mut self, flag: OctagonFlag) -> bool {
        match self.flags.iter().position(|f| *f == flag) {
            Some(index) => {
                self.flags.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = OctagonFlag> + '_ {
        self.flags.iter().copied()
    }

    pub(crate) fn into_vec(self) -> Vec<OctagonFlag> {
        self.flags
    }
}
