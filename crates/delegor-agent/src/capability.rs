use async_trait::async_trait;
use delegor_core::{DelegorError, DelegorResult, Domain, Payload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Natural-language processing collaborator.
#[async_trait]
pub trait NlpCapability: Send + Sync {
    /// Process raw text into a structured result.
    async fn process(&self, text: &str) -> DelegorResult<serde_json::Value>;
}

/// Vision feature-extraction collaborator.
#[async_trait]
pub trait VisionCapability: Send + Sync {
    /// Extract a feature vector from encoded image bytes.
    async fn extract_features(&self, image: &[u8]) -> DelegorResult<Vec<f32>>;
}

/// Knowledge-base retrieval collaborator.
#[async_trait]
pub trait KnowledgeCapability: Send + Sync {
    /// Retrieve ranked matches for a query.
    async fn query(&self, query: &str) -> DelegorResult<Vec<RankedMatch>>;
}

/// Pricing evaluation collaborator.
#[async_trait]
pub trait PricingCapability: Send + Sync {
    /// Evaluate a pricing context into a decision.
    async fn evaluate(&self, context: &serde_json::Value) -> DelegorResult<PricingDecision>;
}

/// One ranked hit from the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedMatch {
    /// Identifier of the matched item.
    pub id: String,
    /// Relevance score, higher is better.
    pub score: f64,
}

/// The outcome of a pricing evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingDecision {
    /// Whether the evaluated context is approved.
    pub approved: bool,
    /// The computed amount.
    pub amount: f64,
    /// Optional human-readable rationale.
    #[serde(default)]
    pub rationale: Option<String>,
}

/// One capability implementation per domain tag.
///
/// Dispatch is a closed enum match over `(Domain, Payload)` — no open-ended
/// dynamic lookup. A payload that does not fit its domain is a validation
/// error, never a capability call.
#[derive(Clone)]
pub struct CapabilitySet {
    nlp: Arc<dyn NlpCapability>,
    vision: Arc<dyn VisionCapability>,
    knowledge: Arc<dyn KnowledgeCapability>,
    pricing: Arc<dyn PricingCapability>,
}

impl CapabilitySet {
    /// Assemble the set from its four collaborators.
    pub fn new(
        nlp: Arc<dyn NlpCapability>,
        vision: Arc<dyn VisionCapability>,
        knowledge: Arc<dyn KnowledgeCapability>,
        pricing: Arc<dyn PricingCapability>,
    ) -> Self {
        Self {
            nlp,
            vision,
            knowledge,
            pricing,
        }
    }

    /// Invoke the capability selected by `domain` on `payload`.
    pub async fn invoke(
        &self,
        domain: Domain,
        payload: &Payload,
    ) -> DelegorResult<serde_json::Value> {
        match (domain, payload) {
            (Domain::Nlp, Payload::Text { text }) => self.nlp.process(text).await,
            (Domain::Vision, Payload::Image { bytes }) => {
                let features = self.vision.extract_features(bytes).await?;
                Ok(serde_json::json!({ "features": features }))
            }
            (Domain::Knowledge, Payload::Query { query }) => {
                let matches = self.knowledge.query(query).await?;
                Ok(serde_json::json!({ "matches": matches }))
            }
            (Domain::Pricing, Payload::Context { context }) => {
                let decision = self.pricing.evaluate(context).await?;
                Ok(serde_json::to_value(decision)?)
            }
            (domain, Payload::Batch { .. }) => Err(DelegorError::Validation(format!(
                "batch payload reached the {domain} capability undecomposed"
            ))),
            (domain, other) => Err(DelegorError::Validation(format!(
                "payload shape does not match domain {domain}: {other:?}"
            ))),
        }
    }
}
