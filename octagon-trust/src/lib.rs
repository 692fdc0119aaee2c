//! Policy evaluation and peer trust for Octagon.
//!
//! A clique is a set of peers that vouch for one another. Each peer publishes
//! three layers of signed information:
//!
//! - **permanent** info: keys, machine ID and model, fixed at creation
//! - **stable** info: policy versions and preferences, rarely changing
//! - **dynamic** info: which peers it includes or excludes, changing often
//!
//! [`PeerTrustGraph`] folds those votes into the set of peers a given peer
//! should trust, using [`PolicyEngine`] to decide which device categories may
//! introduce which.

pub mod bottle;
pub mod error;
pub mod graph;
pub mod identity;
pub mod peer;
pub mod policy;
pub mod recovery;
pub mod voucher;

pub use bottle::{Bottle, BottleSecret, EscrowRecord, Viability};
pub use error::{TrustError, TrustResult};
pub use graph::{PeerTrustGraph, TrustComputation};
pub use identity::{DeviceInfo, LocalIdentity, PreparedPeer};
pub use peer::{
    Peer, PeerDynamicInfo, PeerPermanentInfo, PeerStableInfo, Signed, SignedInfo,
    UserControllableViewStatus,
};
pub use policy::{
    builtin_policies, PolicyDocument, PolicyEngine, PolicyVersion, FROZEN_POLICY_VERSION,
    PRE_POLICY_VIEWS, PREVAILING_POLICY_VERSION, SUPPRESSED_VIEW,
};
pub use recovery::{RecoveryKey, RecoveryKeySet};
pub use voucher::{Voucher, VoucherReason, VoucherSponsor};
