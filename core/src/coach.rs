//! The external AI collaborator, as an injected capability.
//!
//! Two operations are consumed as opaque contracts:
//!
//! - meal photo + notes + language → structured [`MealAnalysis`]
//! - weekly stats + language → summary text
//!
//! Implementations live outside the core (an HTTP client in the binary, stubs
//! in tests). This module owns prompt construction and parsing of the model's
//! JSON so both can be tested without a network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::MealAnalysis;
use crate::weekly::WeeklyStats;

/// Supported response languages. Anything else falls back to English.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Fr,
    Es,
}

impl Language {
    #[must_use]
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("fr") => Self::Fr,
            Some("es") => Self::Es,
            _ => Self::En,
        }
    }

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Fr => "fr",
            Self::Es => "es",
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::En => "English",
            Self::Fr => "French",
            Self::Es => "Spanish",
        }
    }
}

/// Failure of the AI collaborator. Callers report it as one opaque error;
/// nothing is retried.
#[derive(Debug, Error)]
pub enum CoachError {
    #[error("AI coach is not configured")]
    NotConfigured,

    #[error("AI request failed: {0}")]
    Transport(String),

    #[error("AI service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("AI response was not usable: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone)]
pub struct MealImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[async_trait]
pub trait CoachModel: Send + Sync {
    async fn analyze_meal(
        &self,
        image: &MealImage,
        notes: Option<&str>,
        language: Language,
    ) -> Result<MealAnalysis, CoachError>;

    async fn summarize_week(&self, stats: &WeeklyStats, language: Language)
    -> Result<String, CoachError>;
}

/// Stand-in used when no API key is configured.
pub struct UnconfiguredCoach;

#[async_trait]
impl CoachModel for UnconfiguredCoach {
    async fn analyze_meal(
        &self,
        _image: &MealImage,
        _notes: Option<&str>,
        _language: Language,
    ) -> Result<MealAnalysis, CoachError> {
        Err(CoachError::NotConfigured)
    }

    async fn summarize_week(
        &self,
        _stats: &WeeklyStats,
        _language: Language,
    ) -> Result<String, CoachError> {
        Err(CoachError::NotConfigured)
    }
}

pub const MEAL_SYSTEM_PROMPT: &str = "You are a sports nutritionist. You estimate the nutritional \
content of a meal from a single photo. Answer with one JSON object and nothing else.";

pub const WEEKLY_SYSTEM_PROMPT: &str = "You are an encouraging strength and nutrition coach. \
You write short weekly progress summaries from training and meal statistics.";

#[must_use]
pub fn meal_analysis_prompt(notes: Option<&str>, language: Language) -> String {
    let mut prompt = String::from(
        "Estimate the nutrition of the meal in this photo. Respond with JSON of the form \
         {\"totalCalories\": number, \"macros\": {\"proteinGrams\": number, \"carbsGrams\": number, \
         \"fatGrams\": number}, \"ingredients\": [{\"name\": string, \"estimatedGrams\": number, \
         \"calories\": number}], \"confidence\": number between 0 and 1, \"notes\": string}.",
    );
    if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
        prompt.push_str("\nThe user added these notes: ");
        prompt.push_str(notes);
    }
    prompt.push_str("\nWrite the ingredient names and notes in ");
    prompt.push_str(language.name());
    prompt.push('.');
    prompt
}

pub fn weekly_summary_prompt(stats: &WeeklyStats, language: Language) -> Result<String, CoachError> {
    let json = serde_json::to_string_pretty(stats)
        .map_err(|e| CoachError::MalformedResponse(format!("could not encode stats: {e}")))?;
    Ok(format!(
        "Here are my training and nutrition statistics for the last 7 days compared with the \
         week before (volumes in kg, protein target per meal in grams):\n{json}\n\
         Write a summary of at most 120 words in {}. Mention the volume trend, the best lift \
         improvement if there is one, and one concrete nutrition tip.",
        language.name()
    ))
}

/// Extract a [`MealAnalysis`] from model output that may wrap the JSON in
/// prose or a code fence.
pub fn parse_meal_analysis(text: &str) -> Result<MealAnalysis, CoachError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(CoachError::MalformedResponse(
            "no JSON object in response".to_string(),
        ));
    };
    if end < start {
        return Err(CoachError::MalformedResponse(
            "no JSON object in response".to_string(),
        ));
    }
    let mut analysis: MealAnalysis = serde_json::from_str(&text[start..=end])
        .map_err(|e| CoachError::MalformedResponse(e.to_string()))?;
    if !analysis.total_calories.is_finite() || analysis.total_calories < 0.0 {
        return Err(CoachError::MalformedResponse(format!(
            "invalid totalCalories {}",
            analysis.total_calories
        )));
    }
    analysis.confidence = if analysis.confidence.is_finite() {
        analysis.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weekly::{WeeklyWindows, aggregate};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_language_fallback() {
        assert_eq!(Language::parse_lenient(Some("FR")), Language::Fr);
        assert_eq!(Language::parse_lenient(Some("es")), Language::Es);
        assert_eq!(Language::parse_lenient(Some("de")), Language::En);
        assert_eq!(Language::parse_lenient(None), Language::En);
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = "Sure! ```json\n{\"totalCalories\": 520, \"macros\": {\"proteinGrams\": 32, \
                    \"carbsGrams\": 60, \"fatGrams\": 14}, \"ingredients\": [{\"name\": \"rice\", \
                    \"estimatedGrams\": 150}], \"confidence\": 1.7, \"notes\": \"\"}\n```";
        let analysis = parse_meal_analysis(text).unwrap();
        assert!((analysis.total_calories - 520.0).abs() < f64::EPSILON);
        assert!((analysis.macros.protein_grams - 32.0).abs() < f64::EPSILON);
        assert_eq!(analysis.ingredients[0].name, "rice");
        assert_eq!(analysis.ingredients[0].calories, None);
        assert!((analysis.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_meal_analysis("I cannot see a meal"),
            Err(CoachError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_meal_analysis("} nope {"),
            Err(CoachError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_meal_analysis(r#"{"notes": "missing calories"}"#),
            Err(CoachError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_meal_analysis(r#"{"totalCalories": -20}"#),
            Err(CoachError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_meal_prompt_mentions_notes_and_language() {
        let prompt = meal_analysis_prompt(Some("  extra olive oil "), Language::Fr);
        assert!(prompt.contains("extra olive oil"));
        assert!(prompt.contains("French"));
        let bare = meal_analysis_prompt(Some("   "), Language::En);
        assert!(!bare.contains("notes:"));
    }

    #[test]
    fn test_weekly_prompt_embeds_stats() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 18, 0, 0).unwrap();
        let stats = aggregate(&WeeklyWindows::ending(now), &[], &[], 30.0);
        let prompt = weekly_summary_prompt(&stats, Language::Es).unwrap();
        assert!(prompt.contains("\"currentVolume\""));
        assert!(prompt.contains("\"proteinTargetG\": 30.0"));
        assert!(prompt.contains("Spanish"));
    }

    #[tokio::test]
    async fn test_unconfigured_coach_fails() {
        let coach = UnconfiguredCoach;
        let image = MealImage {
            bytes: vec![1, 2, 3],
            mime_type: "image/jpeg".to_string(),
        };
        let err = coach
            .analyze_meal(&image, None, Language::En)
            .await
            .unwrap_err();
        assert!(matches!(err, CoachError::NotConfigured));
    }
}
