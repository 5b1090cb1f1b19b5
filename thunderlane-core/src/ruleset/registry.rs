use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::deploy::{DeploymentPayload, DeploymentReport, DeploymentTransport, NodeDirectory};
use super::model::{
    CouplingMatrix, NewRuleSet, RuleSet, RuleSetContent, RuleSetEvent, RuleSetStatus, transition,
};
use super::signing::{RuleSigner, SIGNING_ALGORITHM};
use crate::error::{CoordinationError, Result};
use crate::events::{EventBus, LaneEvent, names, publish_or_log};
use crate::oracle::{RuleOracle, TrainingExample};
use crate::types::RuleSetId;

/// Current version plus every committed version of one lineage.
struct Lineage {
    current: RuleSet,
    history: Vec<RuleSet>,
}

/// Versions, signs and deploys rulesets.
///
/// Each lineage sits behind its own async mutex: writers to one id are
/// serialized while different ids proceed independently, and readers take the
/// same lock so content is never observed without its signature.
pub struct RuleSetRegistry {
    lineages: DashMap<RuleSetId, Arc<Mutex<Lineage>>>,
    signer: RuleSigner,
    transport: Arc<dyn DeploymentTransport>,
    directory: Arc<dyn NodeDirectory>,
    advisor: Arc<dyn RuleOracle>,
    bus: Arc<dyn EventBus>,
}

impl RuleSetRegistry {
    /// Create a registry with its collaborators.
    pub fn new(
        signer: RuleSigner,
        transport: Arc<dyn DeploymentTransport>,
        directory: Arc<dyn NodeDirectory>,
        advisor: Arc<dyn RuleOracle>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            lineages: DashMap::new(),
            signer,
            transport,
            directory,
            advisor,
            bus,
        }
    }

    /// Signing key holder, for verifying payloads outside the registry.
    #[must_use]
    pub const fn signer(&self) -> &RuleSigner {
        &self.signer
    }

    /// Create version 1 as a signed draft.
    pub async fn create(&self, new: NewRuleSet) -> Result<RuleSet> {
        new.content.validate()?;
        let now = Utc::now();
        let ruleset = RuleSet {
            id: RuleSetId::new(),
            name: new.name,
            topology: new.topology,
            version: 1,
            content: new.content,
            status: RuleSetStatus::Draft,
            signature: None,
            signing_algorithm: SIGNING_ALGORITHM.to_string(),
            performance_score: None,
            created_at: now,
            updated_at: now,
            deployed_at: None,
        };
        let id = ruleset.id;
        let lineage = Arc::new(Mutex::new(Lineage {
            current: ruleset,
            history: Vec::new(),
        }));

        let mut guard = lineage.lock().await;
        self.lineages.insert(id, Arc::clone(&lineage));
        debug!(ruleset = %id, "ruleset content saved");
        if let Err(err) = self.seal(&mut guard) {
            self.lineages.remove(&id);
            return Err(err);
        }
        let committed = guard.current.clone();
        drop(guard);

        info!(ruleset = %id, name = %committed.name, "ruleset created");
        self.publish_version(&committed);
        Ok(committed)
    }

    /// Replace the content of a draft, bumping the version by exactly one.
    pub async fn update(&self, id: RuleSetId, content: RuleSetContent) -> Result<RuleSet> {
        content.validate()?;
        let lineage = self.lineage(id)?;
        let mut guard = lineage.lock().await;
        transition(guard.current.status, RuleSetEvent::Edit)
            .map_err(|_| invalid(&guard.current, "draft"))?;

        guard.current.version += 1;
        guard.current.content = content;
        guard.current.signature = None;
        guard.current.updated_at = Utc::now();
        self.seal(&mut guard)?;
        let committed = guard.current.clone();
        drop(guard);

        info!(ruleset = %id, version = committed.version, "ruleset updated");
        self.publish_version(&committed);
        Ok(committed)
    }

    /// Replace only the coupling matrix; lanes hot-patch from the
    /// `alpha_deltas` event without a full redeploy.
    pub async fn tune_alpha_gains(&self, id: RuleSetId, coupling: CouplingMatrix) -> Result<RuleSet> {
        coupling.validate()?;
        let lineage = self.lineage(id)?;
        let mut guard = lineage.lock().await;
        transition(guard.current.status, RuleSetEvent::TuneAlpha)
            .map_err(|_| invalid(&guard.current, "draft or active"))?;

        let deltas = guard.current.content.coupling.deltas(&coupling);
        guard.current.version += 1;
        guard.current.content.coupling = coupling;
        guard.current.signature = None;
        guard.current.updated_at = Utc::now();
        self.seal(&mut guard)?;
        let committed = guard.current.clone();
        drop(guard);

        info!(
            ruleset = %id,
            version = committed.version,
            changed = deltas.len(),
            "ruleset alpha gains tuned"
        );
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::RULESET_ALPHA_TUNED, id)
                .with("version", committed.version)
                .with("alpha_deltas", &deltas)
                .with("coupling", committed.content.coupling),
        );
        Ok(committed)
    }

    /// Verify, mark active, then push the wire payload to every node of the
    /// owning topology.
    ///
    /// A signature mismatch refuses the activation and leaves the status as it
    /// was. Delivery failures are reported but never undo the activation.
    pub async fn activate(&self, id: RuleSetId) -> Result<DeploymentReport> {
        let lineage = self.lineage(id)?;
        let (payload, topology, version) = {
            let mut guard = lineage.lock().await;
            self.verify_locked(&guard.current)?;
            let next = transition(guard.current.status, RuleSetEvent::Activate)?;
            let payload = DeploymentPayload::from_ruleset(&guard.current)
                .ok_or_else(|| signature_error(&guard.current, "ruleset is unsigned"))?
                .to_bytes()?;
            let now = Utc::now();
            guard.current.status = next;
            guard.current.deployed_at = Some(now);
            guard.current.updated_at = now;
            (payload, guard.current.topology, guard.current.version)
        };

        let mut report = DeploymentReport {
            ruleset: id,
            version,
            delivered: Vec::new(),
            failed: Vec::new(),
        };
        let nodes = topology.map(|t| self.directory.nodes_for(t)).unwrap_or_default();
        for node in &nodes {
            match self.transport.deliver(node, &payload).await {
                Ok(()) => report.delivered.push(node.id.clone()),
                Err(reason) => {
                    warn!(ruleset = %id, node = %node.id, "ruleset delivery failed: {reason}");
                    report.failed.push((node.id.clone(), reason));
                }
            }
        }

        info!(
            ruleset = %id,
            version,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "ruleset deployed"
        );
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::RULESET_DEPLOYED, id)
                .with("version", version)
                .with("status", RuleSetStatus::Active)
                .with("delivered", &report.delivered)
                .with("failed", report.failed.len()),
        );
        Ok(report)
    }

    /// Withdraw from service.
    pub async fn deprecate(&self, id: RuleSetId) -> Result<RuleSet> {
        self.retire(id, RuleSetEvent::Deprecate).await
    }

    /// Retire permanently.
    pub async fn archive(&self, id: RuleSetId) -> Result<RuleSet> {
        self.retire(id, RuleSetEvent::Archive).await
    }

    /// Record an achieved score and feed it to the advisor.
    ///
    /// The advisor call is best-effort; its failure is logged only.
    pub async fn optimize(&self, id: RuleSetId, performance_score: f64) -> Result<RuleSet> {
        if !performance_score.is_finite() {
            return Err(CoordinationError::validation(
                "performance_score",
                format!("{performance_score} is not finite"),
                "a finite score, usually in [0, 1]",
            ));
        }
        let lineage = self.lineage(id)?;
        let committed = {
            let mut guard = lineage.lock().await;
            guard.current.performance_score = Some(performance_score);
            guard.current.updated_at = Utc::now();
            guard.current.clone()
        };
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::RULESET_OPTIMIZED, id)
                .with("version", committed.version)
                .with("performance_score", performance_score),
        );

        let example = TrainingExample {
            features: None,
            coupling: committed.content.coupling,
            score: performance_score,
        };
        match self.advisor.train(std::slice::from_ref(&example)).await {
            Ok(model_version) => {
                debug!(ruleset = %id, model_version, "advisor trained on ruleset score");
            }
            Err(err) => warn!(ruleset = %id, "advisor tuning call failed: {err}"),
        }
        Ok(committed)
    }

    /// Check the stored signature against stored content.
    pub async fn verify(&self, id: RuleSetId) -> Result<()> {
        let lineage = self.lineage(id)?;
        let guard = lineage.lock().await;
        self.verify_locked(&guard.current)
    }

    /// Current version.
    pub async fn get(&self, id: RuleSetId) -> Result<RuleSet> {
        let lineage = self.lineage(id)?;
        let guard = lineage.lock().await;
        Ok(guard.current.clone())
    }

    /// Every committed version, oldest first.
    pub async fn history(&self, id: RuleSetId) -> Result<Vec<RuleSet>> {
        let lineage = self.lineage(id)?;
        let guard = lineage.lock().await;
        Ok(guard.history.clone())
    }

    /// Ids of every lineage.
    #[must_use]
    pub fn ids(&self) -> Vec<RuleSetId> {
        let mut ids: Vec<_> = self.lineages.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    async fn retire(&self, id: RuleSetId, event: RuleSetEvent) -> Result<RuleSet> {
        let lineage = self.lineage(id)?;
        let (from, committed) = {
            let mut guard = lineage.lock().await;
            let from = guard.current.status;
            guard.current.status = transition(from, event)?;
            guard.current.updated_at = Utc::now();
            (from, guard.current.clone())
        };
        info!(
            ruleset = %id,
            from = from.label(),
            to = committed.status.label(),
            "ruleset retired"
        );
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::RULESET_RETIRED, id)
                .with("version", committed.version)
                .with("status", committed.status),
        );
        Ok(committed)
    }

    /// Second step of every content commit: sign what was saved, then record
    /// the version in history.
    fn seal(&self, lineage: &mut Lineage) -> Result<()> {
        let signature = self.signer.sign(&lineage.current.content)?;
        lineage.current.signature = Some(signature);
        lineage.history.push(lineage.current.clone());
        Ok(())
    }

    fn verify_locked(&self, ruleset: &RuleSet) -> Result<()> {
        let signature = ruleset
            .signature
            .as_deref()
            .ok_or_else(|| signature_error(ruleset, "ruleset is unsigned"))?;
        self.signer
            .verify(&ruleset.content, signature)
            .map_err(|reason| signature_error(ruleset, reason))
    }

    fn lineage(&self, id: RuleSetId) -> Result<Arc<Mutex<Lineage>>> {
        self.lineages
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoordinationError::not_found("ruleset", id))
    }

    fn publish_version(&self, ruleset: &RuleSet) {
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::RULESET_VERSIONED, ruleset.id)
                .with("version", ruleset.version)
                .with("status", ruleset.status),
        );
    }

    #[cfg(test)]
    pub(crate) async fn tamper(&self, id: RuleSetId, mutate: impl FnOnce(&mut RuleSet)) {
        if let Ok(lineage) = self.lineage(id) {
            mutate(&mut lineage.lock().await.current);
        }
    }
}

fn invalid(ruleset: &RuleSet, expected: &'static str) -> CoordinationError {
    CoordinationError::InvalidRuleSet {
        id: ruleset.id,
        version: ruleset.version,
        status: ruleset.status.label().to_string(),
        expected,
    }
}

fn signature_error(ruleset: &RuleSet, reason: impl Into<String>) -> CoordinationError {
    CoordinationError::Signature {
        id: ruleset.id,
        version: ruleset.version,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::error::ErrorKind;
    use crate::events::RecordingEventBus;
    use crate::oracle::NullOracle;
    use crate::ruleset::deploy::{InMemoryTransport, NoNodes};
    use crate::ruleset::model::LaneRule;

    fn registry() -> (Arc<RuleSetRegistry>, RecordingEventBus) {
        let bus = RecordingEventBus::new();
        let registry = RuleSetRegistry::new(
            RuleSigner::from_seed([3; 32]),
            Arc::new(InMemoryTransport::new()),
            Arc::new(NoNodes),
            Arc::new(NullOracle),
            Arc::new(bus.clone()),
        );
        (Arc::new(registry), bus)
    }

    fn draft(name: &str) -> NewRuleSet {
        NewRuleSet {
            name: name.to_string(),
            topology: None,
            content: RuleSetContent::uniform(&LaneRule::new("life")),
        }
    }

    #[tokio::test]
    async fn create_signs_version_one() {
        let (registry, bus) = registry();
        let ruleset = registry.create(draft("a")).await.unwrap();
        assert_eq!(ruleset.version, 1);
        assert_eq!(ruleset.status, RuleSetStatus::Draft);
        assert!(ruleset.signature.is_some());
        registry.verify(ruleset.id).await.unwrap();
        assert_eq!(bus.named(names::RULESET_VERSIONED).len(), 1);
    }

    #[tokio::test]
    async fn updates_bump_by_one_and_resign() {
        let (registry, _bus) = registry();
        let id = registry.create(draft("a")).await.unwrap().id;
        let mut content = RuleSetContent::uniform(&LaneRule::new("brian"));
        let v2 = registry.update(id, content.clone()).await.unwrap();
        content.schedule = "asynchronous".into();
        let v3 = registry.update(id, content).await.unwrap();
        assert_eq!((v2.version, v3.version), (2, 3));
        assert_ne!(v2.signature, v3.signature);
        registry.verify(id).await.unwrap();
        let versions: Vec<u64> = registry.history(id).await.unwrap().iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn active_rulesets_reject_content_edits_but_accept_alpha() {
        let (registry, bus) = registry();
        let id = registry.create(draft("a")).await.unwrap().id;
        registry.activate(id).await.unwrap();
        let err = registry
            .update(id, RuleSetContent::uniform(&LaneRule::new("other")))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidRuleSet { .. }));

        let tuned = registry
            .tune_alpha_gains(id, CouplingMatrix::uniform(0.25))
            .await
            .unwrap();
        assert_eq!(tuned.version, 2);
        assert_eq!(tuned.status, RuleSetStatus::Active);
        let events = bus.named(names::RULESET_ALPHA_TUNED);
        assert_eq!(events[0].fields["alpha_deltas"].as_object().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn tampered_content_refuses_deploy() {
        let (registry, _bus) = registry();
        let id = registry.create(draft("a")).await.unwrap().id;
        registry
            .tamper(id, |r| r.content.coupling.alpha_xy = 0.99)
            .await;
        let err = registry.activate(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Signature);
        assert_eq!(registry.get(id).await.unwrap().status, RuleSetStatus::Draft);
    }

    #[tokio::test]
    async fn retire_path_is_enforced() {
        let (registry, _bus) = registry();
        let id = registry.create(draft("a")).await.unwrap().id;
        registry.activate(id).await.unwrap();
        assert!(registry.archive(id).await.is_err());
        registry.deprecate(id).await.unwrap();
        let archived = registry.archive(id).await.unwrap();
        assert_eq!(archived.status, RuleSetStatus::Archived);
        assert_eq!(registry.history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn optimize_records_score_even_without_advisor() {
        let (registry, bus) = registry();
        let id = registry.create(draft("a")).await.unwrap().id;
        let ruleset = registry.optimize(id, 0.82).await.unwrap();
        assert_eq!(ruleset.performance_score, Some(0.82));
        assert_eq!(bus.named(names::RULESET_OPTIMIZED).len(), 1);
        assert!(registry.optimize(id, f64::NAN).await.is_err());
    }
}
