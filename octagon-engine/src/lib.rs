//! The Octagon trust engine.
//!
//! Each (container, context) pair gets a [`TrustContext`]: a flag-driven
//! state machine that follows the account from sign-in to a trusted clique
//! membership, keeps its votes in step with the remote peer list, and hands
//! per-view keys to [`KeySyncCoordinator`] while the device is trusted.
//!
//! The remote peer list ([`PeerListService`]), key zones ([`KeyZone`]) and
//! platform account ([`CloudAccountMonitor`]) are traits. In-process
//! implementations ([`InMemoryPeerListService`], [`SimulatedCloud`],
//! [`SimulatedAccount`]) back the tests and the `octagon` CLI.
//!
//! ```text
//!   cloud notifications ──► flags ──► StateMachine ──► TrustCore
//!                                          ▲               │
//!   TrustContext requests ─────────────────┘               ├─► RetryingRpcClient ─► PeerListService
//!                                                          ├─► PeerTrustGraph / PolicyEngine
//!                                                          └─► KeySyncCoordinator ─► KeyZone
//! ```

pub mod cloud;
pub mod config;
pub mod context;
pub mod error;
pub mod escrow;
pub mod flags;
pub mod keychain;
pub mod keysync;
pub mod lock;
pub mod machine;
pub mod manager;
pub mod rpc;
pub mod service;
pub mod status;
pub mod transitions;
mod trust_core;

pub use cloud::{
    CloudAccountMonitor, CloudKitAccountStatus, CloudNotification, KeyZone, SimulatedAccount,
    SimulatedCloud, TlkShare, ZoneKeySet,
};
pub use config::OctagonConfig;
pub use context::TrustContext;
pub use error::{ErrorClass, OctagonError, OctagonResult};
pub use escrow::EscrowCache;
pub use flags::{Condition, FlagSnapshot, OctagonFlag, PendingFlag};
pub use keychain::{Keychain, StoreKeychain};
pub use keysync::{KeySyncCoordinator, TrustedOperation, ViewKeyState};
pub use lock::LockStateTracker;
pub use machine::{FlagHandler, Reply, StateMachine, TransitionEngine, TransitionOp};
pub use manager::OctagonManager;
pub use rpc::{Attempt, RetryPolicy, RetryingRpcClient};
pub use service::{
    EstablishRequest, Fault, InMemoryPeerListService, JoinRequest, PeerListChanges,
    PeerListService, ServiceOp, TrustUpdate, ViableBottle,
};
pub use status::{CliqueStatus, TrustDump, TrustStatus};
pub use transitions::OctagonState;
pub use trust_core::Collaborators;
