use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::EngineError;
use crate::exam::SimilarityScorer;

/// Stateless remote scoring call for resolution answers. The service takes
/// the learner's text and the model answer and returns a similarity
/// percentage in 0..=100.
#[derive(Clone)]
pub struct HttpSimilarityScorer {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct SimilarityResp {
    similarity: f64,
}

impl HttpSimilarityScorer {
    pub fn new(endpoint: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl SimilarityScorer for HttpSimilarityScorer {
    async fn similarity(
        &self,
        user_answer: &str,
        model_answer: &str,
    ) -> Result<f64, EngineError> {
        // Transport-level failure (refused, timed out) is a network fault;
        // anything the service itself got wrong is a scoring fault.
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "answer": user_answer,
                "model_answer": model_answer,
            }))
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(EngineError::ScoringService(format!(
                "similarity service returned {}",
                resp.status()
            )));
        }

        let body: SimilarityResp = resp
            .json()
            .await
            .map_err(|e| EngineError::ScoringService(e.to_string()))?;
        Ok(body.similarity.clamp(0.0, 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_service_is_a_network_fault() {
        // Nothing listens on the discard port.
        let scorer = HttpSimilarityScorer::new("http://127.0.0.1:9/similarity".into()).unwrap();
        let err = scorer.similarity("a", "b").await.unwrap_err();
        assert!(matches!(err, EngineError::Network(_)));
    }
}
