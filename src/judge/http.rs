//! Grader backed by an OpenAI-compatible chat completions endpoint

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::grader::{GradeRequest, GradeResponse, Grader, GraderError};
use super::Decision;
use crate::common::config::JudgeConfig;

const SYSTEM_PROMPT: &str = "You grade automated UX test runs of a code editor. \
Given the expected outcome and the transcript of what happened, decide whether the \
run demonstrates the expected outcome. Answer with a single JSON object: \
{\"decision\": \"pass\" | \"fail\" | \"inconclusive\", \"confidence\": <0..1>, \
\"rationale\": \"<one or two sentences>\"}.";

pub struct HttpGrader {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key_env: String,
}

impl HttpGrader {
    pub fn new(config: &JudgeConfig) -> Result<Self, GraderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GraderError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key_env: config.api_key_env.clone(),
        })
    }
}

#[async_trait]
impl Grader for HttpGrader {
    async fn grade(&self, request: &GradeRequest) -> Result<GradeResponse, GraderError> {
        let body = json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": request.render() },
            ],
        });

        let mut call = self.client.post(&self.endpoint).json(&body);
        // Credentials are provisioned outside the engine
        if let Ok(key) = std::env::var(&self.api_key_env) {
            call = call.bearer_auth(key);
        }

        let response = call
            .send()
            .await
            .map_err(|e| GraderError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text, &self.api_key_env));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| GraderError::Malformed(e.to_string()))?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| GraderError::Malformed("no message content".to_string()))?;

        parse_decision(content)
    }
}

/// Classify a non-success answer
///
/// Overload and server faults may clear up on their own; any other client
/// error means the request itself was refused.
fn status_error(status: reqwest::StatusCode, body: &str, api_key_env: &str) -> GraderError {
    let excerpt: String = body.chars().take(200).collect();
    let transient = status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
    if transient {
        return GraderError::Unreachable(format!("HTTP {}: {}", status, excerpt));
    }

    let hint = match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            format!(" (check the key in ${})", api_key_env)
        }
        _ => String::new(),
    };
    GraderError::Rejected(format!("HTTP {}{}: {}", status, hint, excerpt))
}

#[derive(Deserialize)]
struct RawDecision {
    decision: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    rationale: Option<String>,
}

/// Extract the decision object from model output, tolerating surrounding prose
pub fn parse_decision(content: &str) -> Result<GradeResponse, GraderError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => return Err(GraderError::Malformed("no JSON object in answer".to_string())),
    };

    let raw: RawDecision =
        serde_json::from_str(json).map_err(|e| GraderError::Malformed(e.to_string()))?;
    let decision = match raw.decision.trim().to_ascii_lowercase().as_str() {
        "pass" | "passed" => Decision::Pass,
        "fail" | "failed" => Decision::Fail,
        "inconclusive" | "unknown" => Decision::Inconclusive,
        other => {
            return Err(GraderError::Malformed(format!(
                "unknown decision '{}'",
                other
            )))
        }
    };

    Ok(GradeResponse {
        decision,
        confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        rationale: raw.rationale.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision_with_prose() {
        let answer = "Sure.\n```json\n{\"decision\": \"PASS\", \"confidence\": 1.4, \"rationale\": \"tab saved\"}\n```";
        let response = parse_decision(answer).unwrap();
        assert_eq!(response.decision, Decision::Pass);
        assert_eq!(response.confidence, 1.0);
        assert_eq!(response.rationale, "tab saved");
    }

    #[test]
    fn test_parse_decision_rejects_garbage() {
        assert!(matches!(
            parse_decision("I think it passed"),
            Err(GraderError::Malformed(_))
        ));
        assert!(matches!(
            parse_decision("{\"decision\": \"maybe\"}"),
            Err(GraderError::Malformed(_))
        ));
    }

    #[test]
    fn test_status_errors_separate_refusals_from_outages() {
        let missing_key = status_error(reqwest::StatusCode::UNAUTHORIZED, "no key", "JUDGE_KEY");
        assert_eq!(
            missing_key,
            GraderError::Rejected(
                "HTTP 401 Unauthorized (check the key in $JUDGE_KEY): no key".to_string()
            )
        );
        assert!(matches!(
            status_error(reqwest::StatusCode::BAD_REQUEST, "bad model", "K"),
            GraderError::Rejected(m) if !m.contains("check the key")
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "", "K"),
            GraderError::Unreachable(_)
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "", "K"),
            GraderError::Unreachable(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let config = JudgeConfig {
            endpoint: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            request_timeout_secs: 2,
            ..Default::default()
        };
        let grader = HttpGrader::new(&config).unwrap();
        let request = GradeRequest {
            scenario_id: "s".into(),
            expected_outcome: "x".into(),
            transcript: Vec::new(),
            final_checks: Vec::new(),
            artifacts: Vec::new(),
        };
        assert!(matches!(
            grader.grade(&request).await,
            Err(GraderError::Unreachable(_))
        ));
    }
}
