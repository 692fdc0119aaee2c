//! The peer trust graph.
//!
//! Trust is always evaluated from one peer's point of view (the "ego"). The
//! ego trusts itself, then follows the included sets of trusted peers,
//! vouchers signed by trusted sponsors, preapprovals, and vouchers signed by
//! recovery keys a trusted peer registered. Introductions made by anyone but
//! the ego must be allowed by the ego's policy. Exclusions voted by trusted
//! peers win over inclusion; the computation repeats until the excluded set
//! stops growing.

use crate::error::{TrustError, TrustResult};
use crate::identity::{LocalIdentity, PreparedPeer};
use crate::peer::{Peer, PeerDynamicInfo, UserControllableViewStatus};
use crate::policy::{PolicyDocument, PolicyEngine, PolicyVersion, PRE_POLICY_VIEWS};
use crate::voucher::{Voucher, VoucherReason, VoucherSponsor};
use octagon_crypto::PublicSigningKey;
use octagon_types::PeerId;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

/// Result of evaluating trust from one peer's point of view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustComputation {
    pub trusted: BTreeSet<PeerId>,
    pub excluded: BTreeSet<PeerId>,
    /// Peers declaring a policy this engine cannot resolve. They are neither
    /// trusted nor distrusted.
    pub ignored: BTreeSet<PeerId>,
}

impl TrustComputation {
    pub fn is_trusted(&self, peer: &PeerId) -> bool {
        self.trusted.contains(peer)
    }
}

/// All known peers of one container.
#[derive(Debug, Clone, Default)]
pub struct PeerTrustGraph {
    peers: BTreeMap<PeerId, Peer>,
}

impl PeerTrustGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    // ── Updates ──────────────────────────────────────────────────

    /// Merges a peer record. Returns true if anything changed.
    ///
    /// Signatures must verify. Older stable or dynamic info than what is
    /// already known is ignored, and a newer stable info may not lower the
    /// frozen policy version.
    pub fn upsert(&mut self, incoming: Peer) -> TrustResult<bool> {
        incoming.verify()?;
        let id = incoming.id().clone();

        let Some(existing) = self.peers.get_mut(&id) else {
            self.peers.insert(id, incoming);
            return Ok(true);
        };

        if existing.permanent != incoming.permanent {
            return Err(TrustError::PermanentInfoChanged(id));
        }

        let mut changed = false;
        if let Some(stable) = incoming.stable {
            match &existing.stable {
                Some(current) if current.info.clock >= stable.info.clock => {}
                Some(current) => {
                    let from = current.info.frozen_policy_version.number;
                    let to = stable.info.frozen_policy_version.number;
                    if to < from {
                        return Err(TrustError::FrozenPolicyRegression { peer: id, from, to });
                    }
                    existing.stable = Some(stable);
                    changed = true;
                }
                None => {
                    existing.stable = Some(stable);
                    changed = true;
                }
            }
        }
        if let Some(dynamic) = incoming.dynamic {
            let newer = existing
                .dynamic
                .as_ref()
                .is_none_or(|current| current.info.clock < dynamic.info.clock);
            if newer {
                existing.dynamic = Some(dynamic);
                changed = true;
            }
        }
        for voucher in incoming.vouchers {
            if !existing.vouchers.contains(&voucher) {
                existing.vouchers.push(voucher);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Applies an authoritative peer list. Peers missing from it are dropped;
    /// peers that fail verification are skipped and returned.
    pub fn apply_snapshot(&mut self, peers: Vec<Peer>) -> Vec<(PeerId, TrustError)> {
        let listed: BTreeSet<PeerId> = peers.iter().map(|p| p.id().clone()).collect();
        self.peers.retain(|id, _| listed.contains(id));

        let mut rejected = Vec::new();
        for peer in peers {
            let id = peer.id().clone();
            if let Err(e) = self.upsert(peer) {
                warn!(peer = %id, error = %e, "rejecting peer record");
                rejected.push((id, e));
            }
        }
        rejected
    }

    // ── Policy helpers ───────────────────────────────────────────

    /// The policy a peer evaluates trust under, if resolvable.
    pub fn policy_for<'p>(&self, peer: &Peer, policies: &'p PolicyEngine) -> Option<&'p PolicyDocument> {
        let stable = peer.stable_info()?;
        policies.resolve(stable.effective_policy_version()).ok()
    }

    /// Every policy version number any peer declares.
    pub fn referenced_policy_versions(&self) -> BTreeSet<u64> {
        self.peers
            .values()
            .filter_map(|p| p.stable_info())
            .flat_map(|s| {
                let mut numbers = vec![s.frozen_policy_version.number];
                if let Some(flexible) = &s.flexible_policy_version {
                    numbers.push(flexible.number);
                }
                numbers
            })
            .collect()
    }

    /// Highest effective policy version among `trusted`.
    pub fn prevailing_policy_version(&self, trusted: &BTreeSet<PeerId>) -> Option<PolicyVersion> {
        trusted
            .iter()
            .filter_map(|id| self.peers.get(id))
            .filter_map(|p| p.stable_info())
            .map(|s| s.effective_policy_version().clone())
            .max_by_key(|v| v.number)
    }

    /// Views `peer` syncs under its own policy, minus user-controllable
    /// views it opted out of.
    pub fn effective_views(&self, peer: &PeerId, policies: &PolicyEngine) -> TrustResult<BTreeSet<String>> {
        let record = self
            .peers
            .get(peer)
            .ok_or_else(|| TrustError::UnknownPeer(peer.clone()))?;
        let Some(stable) = record.stable_info() else {
            return Ok(PRE_POLICY_VIEWS.iter().map(|v| v.to_string()).collect());
        };
        let policy = policies.resolve(stable.effective_policy_version())?;
        let mut views = policy.views_for_model(&record.permanent.model_id)?;
        if stable.user_controllable_views == UserControllableViewStatus::Disabled {
            views.retain(|v| !policy.user_controllable_views.contains(v));
        }
        Ok(views)
    }

    // ── Trust computation ────────────────────────────────────────

    /// Evaluates trust from `ego`'s point of view.
    pub fn compute_trust(&self, ego: &PeerId, policies: &PolicyEngine) -> TrustComputation {
        let mut excluded = BTreeSet::new();
        loop {
            let pass = self.trust_pass(ego, policies, &excluded);
            if pass.excluded == excluded {
                return pass;
            }
            excluded = pass.excluded;
        }
    }

    fn trust_pass(
        &self,
        ego: &PeerId,
        policies: &PolicyEngine,
        seed: &BTreeSet<PeerId>,
    ) -> TrustComputation {
        let mut result = TrustComputation {
            excluded: seed.clone(),
            ..TrustComputation::default()
        };
        if seed.contains(ego) {
            return result;
        }
        let Some(ego_peer) = self.peers.get(ego) else {
            return result;
        };
        if ego_peer.dynamic.is_none() {
            return result;
        }
        let Some(policy) = self.policy_for(ego_peer, policies) else {
            result.ignored.insert(ego.clone());
            return result;
        };

        let mut queue: VecDeque<(PeerId, Option<PeerId>)> = VecDeque::from([(ego.clone(), None)]);
        while let Some((id, introducer)) = queue.pop_front() {
            if result.trusted.contains(&id) || result.excluded.contains(&id) {
                continue;
            }
            let Some(peer) = self.peers.get(&id) else {
                continue;
            };
            if self.policy_for(peer, policies).is_none() {
                debug!(peer = %id, "ignoring peer with unresolvable policy");
                result.ignored.insert(id);
                continue;
            }
            // The ego's own votes are not policy-gated; everyone else's are.
            if let Some(introducer) = introducer.as_ref().filter(|i| *i != ego) {
                if !self.introduction_allowed(policy, introducer, peer) {
                    debug!(peer = %id, %introducer, "introduction not allowed by policy");
                    continue;
                }
            }
            if peer.is_self_excluded() {
                result.excluded.insert(id);
                continue;
            }
            result.trusted.insert(id.clone());

            if let Some(dynamic) = peer.dynamic_info() {
                result.excluded.extend(dynamic.excluded.iter().cloned());
                for included in &dynamic.included {
                    queue.push_back((included.clone(), Some(id.clone())));
                }
            }
            for candidate in self.admitted_by(peer) {
                queue.push_back((candidate, Some(id.clone())));
            }
        }

        result.trusted.retain(|p| !result.excluded.contains(p));
        result.ignored.retain(|p| !result.trusted.contains(p));
        result
    }

    fn category_of<'a>(&self, policy: &'a PolicyDocument, peer: &Peer) -> Option<&'a str> {
        policy.category_for_model(&peer.permanent.model_id)
    }

    fn introduction_allowed(&self, policy: &PolicyDocument, introducer: &PeerId, peer: &Peer) -> bool {
        let Some(sponsor) = self.peers.get(introducer) else {
            return false;
        };
        match (self.category_of(policy, sponsor), self.category_of(policy, peer)) {
            (Some(sponsor_category), Some(candidate_category)) => {
                policy.can_introduce(sponsor_category, candidate_category)
            }
            _ => false,
        }
    }

    /// Peers `sponsor` admits beyond its included set: vouchers it signed,
    /// vouchers signed by its registered recovery key, and its preapprovals.
    fn admitted_by(&self, sponsor: &Peer) -> Vec<PeerId> {
        let sponsor_key = sponsor.permanent.signing_key().ok();
        let recovery_key = sponsor
            .stable_info()
            .and_then(|s| s.recovery_signing_key.clone());
        let preapprovals = sponsor
            .dynamic_info()
            .map(|d| d.preapprovals.clone())
            .unwrap_or_default();

        let mut admitted = Vec::new();
        for candidate in self.peers.values() {
            if candidate.id() == sponsor.id() {
                continue;
            }
            if preapprovals.contains(&candidate.permanent.preapproval_token()) {
                admitted.push(candidate.id().clone());
                continue;
            }
            let vouched = candidate.vouchers.iter().any(|voucher| {
                if !voucher.is_for(&candidate.permanent) {
                    return false;
                }
                match &voucher.sponsor {
                    VoucherSponsor::Peer(id) if id == sponsor.id() => {
                        sponsor_key.as_ref().is_some_and(|k| voucher.verify(k).is_ok())
                    }
                    VoucherSponsor::RecoveryKey(key) if recovery_key.as_ref() == Some(key) => {
                        PublicSigningKey::from_base64(key)
                            .is_ok_and(|k| voucher.verify(&k).is_ok())
                    }
                    _ => false,
                }
            });
            if vouched {
                admitted.push(candidate.id().clone());
            }
        }
        admitted
    }

    /// The dynamic info `ego` should publish now, and whether it differs
    /// from what it currently publishes.
    ///
    /// Trusted peers whose machine ID is missing from `allowed_machine_ids`
    /// move to the excluded set. The ego itself is never excluded here.
    pub fn next_dynamic_info(
        &self,
        ego: &PeerId,
        policies: &PolicyEngine,
        allowed_machine_ids: Option<&BTreeSet<String>>,
    ) -> Option<(PeerDynamicInfo, bool)> {
        let ego_peer = self.peers.get(ego)?;
        let current = ego_peer.dynamic_info().cloned().unwrap_or_default();
        let computation = self.compute_trust(ego, policies);

        let mut included = computation.trusted.clone();
        included.insert(ego.clone());
        let mut excluded = current.excluded.clone();
        excluded.extend(computation.excluded.iter().filter(|p| *p != ego).cloned());

        if let Some(allowed) = allowed_machine_ids {
            let disallowed: Vec<PeerId> = included
                .iter()
                .filter(|id| *id != ego)
                .filter(|id| {
                    self.peers
                        .get(*id)
                        .is_some_and(|p| !allowed.contains(&p.permanent.machine_id))
                })
                .cloned()
                .collect();
            for id in disallowed {
                debug!(peer = %id, "machine id no longer allowed, excluding");
                included.remove(&id);
                excluded.insert(id);
            }
        }
        included.retain(|p| !excluded.contains(p));

        let mut next = PeerDynamicInfo {
            clock: current.clock,
            included,
            excluded,
            preapprovals: current.preapprovals.clone(),
        };
        if next.same_membership(&current) {
            return Some((current, false));
        }
        next.clock = current.clock + 1;
        Some((next, true))
    }

    /// Trusted peers (from `ego`'s view) that could vouch for `ego` again.
    /// Departed and distrusted peers never count.
    pub fn repair_capable_peers(&self, ego: &PeerId, policies: &PolicyEngine) -> Vec<PeerId> {
        let computation = self.compute_trust(ego, policies);
        let Some(ego_peer) = self.peers.get(ego) else {
            return Vec::new();
        };
        let Some(policy) = self.policy_for(ego_peer, policies) else {
            return Vec::new();
        };
        computation
            .trusted
            .iter()
            .filter(|id| *id != ego)
            .filter(|id| self.introduction_allowed(policy, id, ego_peer))
            .cloned()
            .collect()
    }

    /// Whether any of `trusted` registered the recovery key `signing_key`.
    pub fn recovery_key_endorsed(&self, signing_key: &str, trusted: &BTreeSet<PeerId>) -> bool {
        trusted
            .iter()
            .filter_map(|id| self.peers.get(id))
            .filter_map(|p| p.stable_info())
            .any(|s| s.recovery_signing_key.as_deref() == Some(signing_key))
    }

    /// Peers (trusted in their own view) that registered `signing_key`.
    pub fn recovery_key_endorsers(&self, signing_key: &str, policies: &PolicyEngine) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| {
                p.stable_info()
                    .is_some_and(|s| s.recovery_signing_key.as_deref() == Some(signing_key))
            })
            .filter(|p| self.compute_trust(p.id(), policies).is_trusted(p.id()))
            .map(|p| p.id().clone())
            .collect()
    }

    // ── Vouching ─────────────────────────────────────────────────

    /// Issues a voucher from `sponsor` for a prepared candidate.
    ///
    /// Fails if the sponsor is not trusted, the candidate's policy version
    /// cannot be resolved, or the sponsor's policy forbids the introduction.
    pub fn vouch(
        &self,
        sponsor: &LocalIdentity,
        candidate: &PreparedPeer,
        policies: &PolicyEngine,
    ) -> TrustResult<Voucher> {
        let sponsor_id = sponsor.peer_id();
        let sponsor_peer = self
            .peers
            .get(sponsor_id)
            .ok_or_else(|| TrustError::UnknownPeer(sponsor_id.clone()))?;
        if !self.compute_trust(sponsor_id, policies).is_trusted(sponsor_id) {
            return Err(TrustError::NotTrusted(sponsor_id.clone()));
        }

        candidate.verify()?;
        policies.resolve(candidate.stable.info.effective_policy_version())?;

        let sponsor_version = sponsor_peer
            .stable_info()
            .map(|s| s.effective_policy_version().clone())
            .ok_or_else(|| TrustError::NotTrusted(sponsor_id.clone()))?;
        let policy = policies.resolve(&sponsor_version)?;

        let sponsor_category = policy
            .category_for_model(&sponsor_peer.permanent.model_id)
            .ok_or_else(|| TrustError::UnknownModel(sponsor_peer.permanent.model_id.clone()))?;
        let candidate_category = policy
            .category_for_model(&candidate.permanent.model_id)
            .ok_or_else(|| TrustError::UnknownModel(candidate.permanent.model_id.clone()))?;
        if !policy.can_introduce(sponsor_category, candidate_category) {
            return Err(TrustError::IntroductionNotAllowed {
                sponsor_category: sponsor_category.to_string(),
                candidate_category: candidate_category.to_string(),
            });
        }

        Voucher::issue(
            &candidate.permanent,
            VoucherSponsor::Peer(sponsor_id.clone()),
            VoucherReason::SecureChannel,
            sponsor.signing_key(),
        )
    }
}
