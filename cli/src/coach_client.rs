use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, error, instrument};

use repcoach_core::coach::{
    CoachError, CoachModel, Language, MEAL_SYSTEM_PROMPT, MealImage, WEEKLY_SYSTEM_PROMPT,
    meal_analysis_prompt, parse_meal_analysis, weekly_summary_prompt,
};
use repcoach_core::models::MealAnalysis;
use repcoach_core::weekly::WeeklyStats;

use crate::config::AiSettings;

const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Talks to any OpenAI-compatible `chat/completions` endpoint.
///
/// Requests block until the provider answers; there is no retry.
pub struct OpenAiCoach {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCoach {
    pub fn new(settings: &AiSettings, api_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("repcoach/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: settings.model.clone(),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, CoachError> {
        let response = self
            .client
            .post(self.api_url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to reach AI provider: {e}");
                CoachError::Transport(e.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CoachError::Transport(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            error!(status = status.as_u16(), "AI provider returned an error");
            return Err(CoachError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| CoachError::MalformedResponse(format!("invalid envelope: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CoachError::MalformedResponse("empty completion".to_string()))?;

        debug!(chars = content.len(), "received completion");
        Ok(content)
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn image_data_uri(image: &MealImage) -> String {
    format!(
        "data:{};base64,{}",
        image.mime_type,
        STANDARD.encode(&image.bytes)
    )
}

#[async_trait]
impl CoachModel for OpenAiCoach {
    #[instrument(skip(self, image, notes), fields(model = %self.model, bytes = image.bytes.len()))]
    async fn analyze_meal(
        &self,
        image: &MealImage,
        notes: Option<&str>,
        language: Language,
    ) -> Result<MealAnalysis, CoachError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Value::String(MEAL_SYSTEM_PROMPT.to_string()),
                },
                ChatMessage {
                    role: "user",
                    content: json!([
                        { "type": "text", "text": meal_analysis_prompt(notes, language) },
                        { "type": "image_url", "image_url": { "url": image_data_uri(image) } },
                    ]),
                },
            ],
            temperature: Some(0.2),
            response_format: Some(json!({ "type": "json_object" })),
        };
        let content = self.complete(&request).await?;
        parse_meal_analysis(&content)
    }

    #[instrument(skip(self, stats), fields(model = %self.model))]
    async fn summarize_week(
        &self,
        stats: &WeeklyStats,
        language: Language,
    ) -> Result<String, CoachError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Value::String(WEEKLY_SYSTEM_PROMPT.to_string()),
                },
                ChatMessage {
                    role: "user",
                    content: Value::String(weekly_summary_prompt(stats, language)?),
                },
            ],
            temperature: Some(0.7),
            response_format: None,
        };
        let content = self.complete(&request).await?;
        Ok(content.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mockito::{Matcher, Server};
    use repcoach_core::weekly::{WeeklyWindows, aggregate};

    fn coach_for(server: &Server) -> OpenAiCoach {
        let settings = AiSettings {
            api_key: None,
            base_url: format!("{}/v1/", server.url()),
            model: "test-model".to_string(),
        };
        OpenAiCoach::new(&settings, "sk-test").unwrap()
    }

    fn completion(content: &str) -> String {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
            .to_string()
    }

    fn image() -> MealImage {
        MealImage {
            bytes: b"fake-jpeg".to_vec(),
            mime_type: "image/jpeg".to_string(),
        }
    }

    fn stats() -> WeeklyStats {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 18, 0, 0).unwrap();
        aggregate(&WeeklyWindows::ending(now), &[], &[], 25.0)
    }

    #[tokio::test]
    async fn analyze_meal_sends_image_and_parses_json() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("data:image/jpeg;base64,ZmFrZS1qcGVn".to_string()),
                Matcher::Regex("French".to_string()),
                Matcher::Regex("\"model\":\"test-model\"".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion(
                r#"{"totalCalories": 640, "macros": {"proteinGrams": 41, "carbsGrams": 70, "fatGrams": 18}, "ingredients": [], "confidence": 0.8, "notes": "poulet"}"#,
            ))
            .create_async()
            .await;

        let analysis = coach_for(&server)
            .analyze_meal(&image(), Some("lunch"), Language::Fr)
            .await
            .unwrap();

        assert!((analysis.total_calories - 640.0).abs() < f64::EPSILON);
        assert!((analysis.macros.protein_grams - 41.0).abs() < f64::EPSILON);
        assert_eq!(analysis.notes, "poulet");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn summarize_week_returns_trimmed_text() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::Regex("currentVolume".to_string()))
            .with_status(200)
            .with_body(completion("  Solid week. Keep squatting.\n"))
            .create_async()
            .await;

        let summary = coach_for(&server)
            .summarize_week(&stats(), Language::En)
            .await
            .unwrap();

        assert_eq!(summary, "Solid week. Keep squatting.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn provider_error_status_is_reported_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .with_body(r#"{"error": {"message": "bad key"}}"#)
            .expect(1)
            .create_async()
            .await;

        let err = coach_for(&server)
            .summarize_week(&stats(), Language::En)
            .await
            .unwrap_err();

        match err {
            CoachError::Status { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unusable_content_is_malformed() {
        let mut server = Server::new_async().await;
        let _empty = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let err = coach_for(&server)
            .analyze_meal(&image(), None, Language::En)
            .await
            .unwrap_err();
        assert!(matches!(err, CoachError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn non_json_meal_answer_is_malformed() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(completion("I can't tell what this is."))
            .create_async()
            .await;

        let err = coach_for(&server)
            .analyze_meal(&image(), None, Language::En)
            .await
            .unwrap_err();
        assert!(matches!(err, CoachError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_provider_is_transport_error() {
        let settings = AiSettings {
            api_key: None,
            base_url: "http://127.0.0.1:9".to_string(),
            model: "test-model".to_string(),
        };
        let coach = OpenAiCoach::new(&settings, "sk-test").unwrap();
        let err = coach
            .summarize_week(&stats(), Language::En)
            .await
            .unwrap_err();
        assert!(matches!(err, CoachError::Transport(_)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("short", 10), "short");
    }
}
