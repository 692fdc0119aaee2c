//! Versioned trust policies.
//!
//! A policy maps device models to categories, says which categories may
//! introduce which, and which categories sync which views. Documents are
//! immutable and content-addressed: the version carries a hash of the body.

use crate::error::{TrustError, TrustResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// View with no sync rule. Items routed here never leave the device.
pub const SUPPRESSED_VIEW: &str = "NotSynced";

/// Views every peer syncs regardless of policy version.
pub const PRE_POLICY_VIEWS: [&str; 2] = ["LimitedPeersAllowed", "Backstop"];

/// Oldest version a peer may freeze on.
pub const FROZEN_POLICY_VERSION: u64 = 5;

/// Version new peers adopt as their flexible policy.
pub const PREVAILING_POLICY_VERSION: u64 = 11;

/// Field of an item that names its view explicitly.
const VIEW_HINT_FIELD: &str = "vwht";

/// Field of an item that names its access group.
const ACCESS_GROUP_FIELD: &str = "agrp";

/// A policy version: its number and the hash of its document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyVersion {
    pub number: u64,
    pub hash: String,
}

/// Model-prefix → category rule. The first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRule {
    pub prefix: String,
    pub category: String,
}

/// Routes an item to `view` when `field` matches `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRule {
    pub view: String,
    pub field: String,
    pub pattern: String,
}

/// An immutable, versioned policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: PolicyVersion,
    pub model_to_category: Vec<ModelRule>,
    /// Category → categories allowed to introduce it.
    pub introducers_by_category: BTreeMap<String, BTreeSet<String>>,
    /// View → categories that sync it.
    pub categories_by_view: BTreeMap<String, BTreeSet<String>>,
    pub view_rules: Vec<ViewRule>,
    pub user_controllable_views: BTreeSet<String>,
}

impl PolicyDocument {
    /// Hash of everything but the hash itself.
    pub fn compute_hash(&self) -> String {
        fn field(hasher: &mut Sha256, value: &str) {
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }

        let mut hasher = Sha256::new();
        hasher.update(self.version.number.to_be_bytes());
        hasher.update((self.model_to_category.len() as u64).to_be_bytes());
        for rule in &self.model_to_category {
            field(&mut hasher, &rule.prefix);
            field(&mut hasher, &rule.category);
        }
        for map in [&self.introducers_by_category, &self.categories_by_view] {
            hasher.update((map.len() as u64).to_be_bytes());
            for (key, values) in map {
                field(&mut hasher, key);
                hasher.update((values.len() as u64).to_be_bytes());
                for value in values {
                    field(&mut hasher, value);
                }
            }
        }
        hasher.update((self.view_rules.len() as u64).to_be_bytes());
        for rule in &self.view_rules {
            field(&mut hasher, &rule.view);
            field(&mut hasher, &rule.field);
            field(&mut hasher, &rule.pattern);
        }
        hasher.update((self.user_controllable_views.len() as u64).to_be_bytes());
        for view in &self.user_controllable_views {
            field(&mut hasher, view);
        }
        format!("SHA256:{}", hex::encode(hasher.finalize()))
    }

    /// Returns the document with its version hash filled in.
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.version.hash = self.compute_hash();
        self
    }

    /// Category for a model ID, by first matching prefix.
    pub fn category_for_model(&self, model_id: &str) -> Option<&str> {
        self.model_to_category
            .iter()
            .find(|rule| model_id.starts_with(&rule.prefix))
            .map(|rule| rule.category.as_str())
    }

    /// Whether a `sponsor` category device may introduce a `candidate` one.
    pub fn can_introduce(&self, sponsor: &str, candidate: &str) -> bool {
        self.introducers_by_category
            .get(candidate)
            .is_some_and(|introducers| introducers.contains(sponsor))
    }

    /// Views with a routing rule. Never contains the suppressed view.
    pub fn synced_views(&self) -> BTreeSet<String> {
        self.view_rules
            .iter()
            .filter(|rule| rule.view != SUPPRESSED_VIEW)
            .map(|rule| rule.view.clone())
            .collect()
    }

    /// Views a device of `category` syncs, including pre-policy views.
    pub fn views_for_category(&self, category: &str) -> BTreeSet<String> {
        let synced = self.synced_views();
        let mut views: BTreeSet<String> = self
            .categories_by_view
            .iter()
            .filter(|(view, categories)| synced.contains(*view) && categories.contains(category))
            .map(|(view, _)| view.clone())
            .collect();
        views.extend(PRE_POLICY_VIEWS.iter().map(|v| v.to_string()));
        views
    }

    /// Views a device of `model_id` syncs.
    pub fn views_for_model(&self, model_id: &str) -> TrustResult<BTreeSet<String>> {
        let category = self
            .category_for_model(model_id)
            .ok_or_else(|| TrustError::UnknownModel(model_id.to_string()))?;
        Ok(self.views_for_category(category))
    }

    /// Routes an item, described by its attribute fields, to a view.
    pub fn route_item(&self, attributes: &BTreeMap<String, String>) -> TrustResult<Option<&str>> {
        for rule in &self.view_rules {
            let Some(value) = attributes.get(&rule.field) else {
                continue;
            };
            if self.compile(rule)?.is_match(value) {
                return Ok(Some(rule.view.as_str()));
            }
        }
        Ok(None)
    }

    /// First (category, escalation) pair breaking introducer closure, if any.
    ///
    /// Closed means: whoever may introduce an introducer of C may introduce C.
    pub fn closure_violation(&self) -> Option<(String, String)> {
        for (category, introducers) in &self.introducers_by_category {
            for introducer in introducers {
                let Some(second_hop) = self.introducers_by_category.get(introducer) else {
                    continue;
                };
                if let Some(escalation) = second_hop.iter().find(|c| !introducers.contains(*c)) {
                    return Some((category.clone(), escalation.clone()));
                }
            }
        }
        None
    }

    /// Checks hash, introducer closure and view rule patterns.
    pub fn validate(&self) -> TrustResult<()> {
        let computed = self.compute_hash();
        if computed != self.version.hash {
            return Err(TrustError::PolicyHashMismatch {
                version: self.version.number,
                declared: self.version.hash.clone(),
                computed,
            });
        }
        if let Some((category, via)) = self.closure_violation() {
            return Err(TrustError::PolicyNotClosed {
                version: self.version.number,
                category,
                via,
            });
        }
        for rule in &self.view_rules {
            self.compile(rule)?;
        }
        Ok(())
    }

    fn compile(&self, rule: &ViewRule) -> TrustResult<Regex> {
        Regex::new(&rule.pattern).map_err(|e| TrustError::InvalidViewRule {
            version: self.version.number,
            view: rule.view.clone(),
            reason: e.to_string(),
        })
    }
}

/// Known policy documents, keyed by version number.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    documents: BTreeMap<u64, PolicyDocument>,
}

impl PolicyEngine {
    /// An engine that knows no documents.
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine preloaded with the built-in documents.
    pub fn with_builtin() -> Self {
        let mut engine = Self::new();
        for doc in builtin_policies() {
            engine.documents.insert(doc.version.number, doc);
        }
        engine
    }

    /// Validates and stores a document. Re-accepting an identical document
    /// is a no-op; a different document under a known number is rejected.
    pub fn accept(&mut self, doc: PolicyDocument) -> TrustResult<()> {
        doc.validate()?;
        if let Some(existing) = self.documents.get(&doc.version.number) {
            if existing.version.hash != doc.version.hash {
                return Err(TrustError::PolicyHashMismatch {
                    version: doc.version.number,
                    declared: doc.version.hash.clone(),
                    computed: existing.version.hash.clone(),
                });
            }
            return Ok(());
        }
        self.documents.insert(doc.version.number, doc);
        Ok(())
    }

    /// The document for `version`, checking the hash when one is given.
    pub fn resolve(&self, version: &PolicyVersion) -> TrustResult<&PolicyDocument> {
        let doc = self.resolve_number(version.number)?;
        if !version.hash.is_empty() && doc.version.hash != version.hash {
            return Err(TrustError::PolicyHashMismatch {
                version: version.number,
                declared: version.hash.clone(),
                computed: doc.version.hash.clone(),
            });
        }
        Ok(doc)
    }

    pub fn resolve_number(&self, number: u64) -> TrustResult<&PolicyDocument> {
        self.documents
            .get(&number)
            .ok_or(TrustError::UnknownPolicyVersion(number))
    }

    pub fn contains(&self, number: u64) -> bool {
        self.documents.contains_key(&number)
    }

    /// Highest known version.
    pub fn prevailing(&self) -> Option<&PolicyDocument> {
        self.documents.values().next_back()
    }

    /// Which of `numbers` this engine cannot resolve.
    pub fn missing(&self, numbers: impl IntoIterator<Item = u64>) -> BTreeSet<u64> {
        numbers.into_iter().filter(|n| !self.contains(*n)).collect()
    }

    pub fn versions(&self) -> Vec<PolicyVersion> {
        self.documents.values().map(|d| d.version.clone()).collect()
    }
}

// ── Built-in documents ───────────────────────────────────────────

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn model_rules(extra: &[(&str, &str)]) -> Vec<ModelRule> {
    let base = [
        ("iPhone", "full"),
        ("iPad", "full"),
        ("iPod", "full"),
        ("Mac", "full"),
        ("Watch", "watch"),
        ("AppleTV", "tv"),
        ("AudioAccessory", "audio"),
        ("Windows", "windows"),
    ];
    base.iter()
        .chain(extra.iter())
        .map(|(prefix, category)| ModelRule {
            prefix: prefix.to_string(),
            category: category.to_string(),
        })
        .collect()
}

fn introducers() -> BTreeMap<String, BTreeSet<String>> {
    BTreeMap::from([
        ("full".to_string(), set(&["full"])),
        ("watch".to_string(), set(&["full", "watch"])),
        ("tv".to_string(), set(&["full", "tv"])),
        ("audio".to_string(), set(&["full", "tv", "audio"])),
        ("windows".to_string(), set(&["full", "windows"])),
    ])
}

fn view_rules(
    categories_by_view: &BTreeMap<String, BTreeSet<String>>,
    access_groups: &[(&str, &str)],
) -> Vec<ViewRule> {
    let mut rules: Vec<ViewRule> = categories_by_view
        .keys()
        .filter(|view| view.as_str() != SUPPRESSED_VIEW)
        .map(|view| ViewRule {
            view: view.clone(),
            field: VIEW_HINT_FIELD.to_string(),
            pattern: format!("^{view}$"),
        })
        .collect();
    rules.extend(access_groups.iter().map(|(view, pattern)| ViewRule {
        view: view.to_string(),
        field: ACCESS_GROUP_FIELD.to_string(),
        pattern: pattern.to_string(),
    }));
    rules
}

fn policy_v5() -> PolicyDocument {
    let categories_by_view = BTreeMap::from([
        ("AutoUnlock".to_string(), set(&["full", "watch"])),
        ("DevicePairing".to_string(), set(&["full", "watch"])),
        ("Health".to_string(), set(&["full", "watch"])),
        ("Home".to_string(), set(&["full", "watch", "tv", "audio"])),
        ("Manatee".to_string(), set(&["full", "watch"])),
        ("Passwords".to_string(), set(&["full", "watch"])),
        ("ProtectedCloudStorage".to_string(), set(&["full", "watch"])),
        ("SecureObjectSync".to_string(), set(&["full"])),
        ("WiFi".to_string(), set(&["full", "watch", "tv", "audio"])),
        (SUPPRESSED_VIEW.to_string(), set(&["full"])),
    ]);
    let view_rules = view_rules(&categories_by_view, &[("Passwords", r"^com\.apple\.cfnetwork$")]);
    PolicyDocument {
        version: PolicyVersion {
            number: FROZEN_POLICY_VERSION,
            hash: String::new(),
        },
        model_to_category: model_rules(&[]),
        introducers_by_category: introducers(),
        categories_by_view,
        view_rules,
        user_controllable_views: BTreeSet::new(),
    }
    .sealed()
}

fn policy_v11() -> PolicyDocument {
    let categories_by_view = BTreeMap::from([
        ("ApplePay".to_string(), set(&["full", "watch"])),
        ("Applications".to_string(), set(&["full", "watch"])),
        ("AutoUnlock".to_string(), set(&["full", "watch"])),
        ("CreditCards".to_string(), set(&["full"])),
        ("DevicePairing".to_string(), set(&["full", "watch"])),
        ("Health".to_string(), set(&["full", "watch"])),
        ("Home".to_string(), set(&["full", "watch", "tv", "audio"])),
        ("Manatee".to_string(), set(&["full", "watch"])),
        ("Passwords".to_string(), set(&["full", "watch", "windows"])),
        ("ProtectedCloudStorage".to_string(), set(&["full", "watch"])),
        ("SecureObjectSync".to_string(), set(&["full"])),
        ("WiFi".to_string(), set(&["full", "watch", "tv", "audio"])),
        (SUPPRESSED_VIEW.to_string(), set(&["full"])),
    ]);
    let view_rules = view_rules(
        &categories_by_view,
        &[
            ("CreditCards", r"^com\.apple\.safari\.credit-cards$"),
            ("Passwords", r"^com\.apple\.cfnetwork$"),
        ],
    );
    PolicyDocument {
        version: PolicyVersion {
            number: PREVAILING_POLICY_VERSION,
            hash: String::new(),
        },
        model_to_category: model_rules(&[("RealityDevice", "full")]),
        introducers_by_category: introducers(),
        categories_by_view,
        view_rules,
        user_controllable_views: set(&["Health"]),
    }
    .sealed()
}

/// The documents shipped with every build, oldest first.
pub fn builtin_policies() -> Vec<PolicyDocument> {
    vec![policy_v5(), policy_v11()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_validate() {
        for doc in builtin_policies() {
            doc.validate().unwrap();
        }
    }

    #[test]
    fn hash_changes_with_content() {
        let doc = policy_v11();
        let mut changed = doc.clone();
        changed.user_controllable_views.clear();
        assert_ne!(doc.compute_hash(), changed.compute_hash());
    }
}
