use async_trait::async_trait;
use delegor_core::{AggregationPolicy, DelegorError, DelegorResult, Domain, Payload};

/// An external request: payload items with optional hints and overrides.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// The work items; each becomes one domain task.
    pub items: Vec<RequestItem>,
    /// Aggregation policy override; defaults to all-succeed.
    pub policy: Option<AggregationPolicy>,
    /// Deadline override in milliseconds from submission.
    pub deadline_ms: Option<u64>,
}

/// One payload plus an optional explicit domain hint.
#[derive(Debug, Clone)]
pub struct RequestItem {
    /// Explicit domain; when absent the classifier infers from the payload.
    pub domain: Option<Domain>,
    /// The payload to process.
    pub payload: Payload,
}

impl Request {
    /// A request with a single hinted item.
    pub fn single(domain: Domain, payload: Payload) -> Self {
        Self {
            items: vec![RequestItem { domain: Some(domain), payload }],
            policy: None,
            deadline_ms: None,
        }
    }

    /// Append an item.
    pub fn push(mut self, domain: Option<Domain>, payload: Payload) -> Self {
        self.items.push(RequestItem { domain, payload });
        self
    }

    /// Set the aggregation policy.
    pub fn with_policy(mut self, policy: AggregationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override the deadline.
    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }
}

/// Splits a request into `(domain, payload)` pairs.
///
/// Classification itself is a collaborator concern; the engine only fixes the
/// contract. [`HintClassifier`] is the shipped default.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify the request into domain tasks.
    async fn classify(&self, request: &Request) -> DelegorResult<Vec<(Domain, Payload)>>;
}

/// Default classifier: explicit hints win, otherwise the payload shape
/// selects the domain by enum match.
pub struct HintClassifier;

fn infer_domain(payload: &Payload) -> DelegorResult<Domain> {
    match payload {
        Payload::Text { .. } => Ok(Domain::Nlp),
        Payload::Image { .. } => Ok(Domain::Vision),
        Payload::Query { .. } => Ok(Domain::Knowledge),
        Payload::Context { .. } => Ok(Domain::Pricing),
        Payload::Batch { items } => items.first().map_or_else(
            || {
                Err(DelegorError::Validation(
                    "cannot infer a domain for an empty batch".into(),
                ))
            },
            infer_domain,
        ),
    }
}

#[async_trait]
impl Classifier for HintClassifier {
    async fn classify(&self, request: &Request) -> DelegorResult<Vec<(Domain, Payload)>> {
        let mut tasks = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let domain = match item.domain {
                Some(domain) => domain,
                None => infer_domain(&item.payload)?,
            };
            tasks.push((domain, item.payload.clone()));
        }
        Ok(tasks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hint_wins_over_shape() {
        let request = Request::single(Domain::Knowledge, Payload::Text { text: "q".into() });
        let tasks = HintClassifier.classify(&request).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].0, Domain::Knowledge);
    }

    #[tokio::test]
    async fn test_shape_inference() {
        let request = Request::default()
            .push(None, Payload::Text { text: "t".into() })
            .push(None, Payload::Image { bytes: vec![1] })
            .push(None, Payload::Query { query: "q".into() })
            .push(None, Payload::Context { context: serde_json::json!({}) });
        let tasks = HintClassifier.classify(&request).await.unwrap();
        let domains: Vec<Domain> = tasks.iter().map(|(d, _)| *d).collect();
        assert_eq!(
            domains,
            vec![Domain::Nlp, Domain::Vision, Domain::Knowledge, Domain::Pricing]
        );
    }

    #[tokio::test]
    async fn test_batch_inferred_from_first_item() {
        let request = Request::default().push(
            None,
            Payload::Batch { items: vec![Payload::Image { bytes: vec![0] }] },
        );
        let tasks = HintClassifier.classify(&request).await.unwrap();
        assert_eq!(tasks[0].0, Domain::Vision);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let request = Request::default().push(None, Payload::Batch { items: vec![] });
        let err = HintClassifier.classify(&request).await.unwrap_err();
        assert!(matches!(err, DelegorError::Validation(_)));
    }
}
