//! Transcript analysis via a local or hosted LLM, with a heuristic fallback.
//!
//! The analyzer never fails a job: if the configured backend is unreachable
//! or returns garbage, a rule-based summary is substituted instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Analyzer;
use crate::config::{LlmProviderKind, LlmSettings};
use crate::error::AppError;
use crate::store::{ActionItem, Analysis, Priority, RecordingType, Speaker, SpeakerSegment};

/// How many leading segments feed the heuristic summary.
const HEURISTIC_SUMMARY_SEGMENTS: usize = 5;
/// Cap on transcript text sent to the LLM.
const MAX_PROMPT_TRANSCRIPT_CHARS: usize = 12_000;

const SYSTEM_PROMPT: &str = "You are a meeting analysis assistant. Analyze transcripts \
and extract structured information. Always respond with valid JSON.";

/// Completion capability the analyzer is built on. Selected once at
/// construction from configuration, never per call.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AppError>;
}

/// Ollama /api/generate backend.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(settings: &LlmSettings) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(settings.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: settings.base_url.clone(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AppError> {
        let url = format!("{}/api/generate", self.base_url);

        let request = OllamaGenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: Some(system.to_string()),
            stream: false,
            options: Some(OllamaOptions {
                temperature: 0.3,
                num_predict: 2048,
            }),
        };

        log::info!(
            "Sending analysis request to Ollama: model={}, prompt_len={}",
            self.model,
            prompt.len()
        );

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!("Ollama returned {}: {}", status, body)));
        }

        let result: OllamaGenerateResponse = response.json().await?;
        Ok(result.response)
    }
}

/// OpenAI-compatible chat completions backend.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(settings: &LlmSettings) -> Result<Self, AppError> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            AppError::Configuration("openai provider selected but no API key configured".to_string())
        })?;
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(settings.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: settings.base_url.clone(),
            model: settings.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, AppError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: 0.3,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!("LLM API returned {}: {}", status, body)));
        }

        let result: ChatResponse = response.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::Backend("LLM API returned no choices".to_string()))
    }
}

/// Analyzer over a completion backend, with the heuristic fallback built in.
pub struct LlmAnalyzer {
    backend: Box<dyn LlmBackend>,
}

impl LlmAnalyzer {
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, AppError> {
        let backend: Box<dyn LlmBackend> = match settings.provider {
            LlmProviderKind::Ollama => Box::new(OllamaBackend::new(settings)),
            LlmProviderKind::OpenAi => Box::new(OpenAiBackend::new(settings)?),
        };
        Ok(Self { backend })
    }

    pub fn with_backend(backend: Box<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    async fn analyze_with_llm(
        &self,
        segments: &[SpeakerSegment],
        speakers: &[Speaker],
        recording_type: RecordingType,
        duration_seconds: f64,
    ) -> Result<Analysis, AppError> {
        let prompt = build_prompt(segments, speakers, recording_type);
        let response = self.backend.complete(SYSTEM_PROMPT, &prompt).await?;

        let json = extract_json_from_response(&response)
            .ok_or_else(|| AppError::Backend("no JSON object in LLM response".to_string()))?;

        parse_analysis_json(&json, duration_seconds)
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(
        &self,
        segments: &[SpeakerSegment],
        speakers: &[Speaker],
        recording_type: RecordingType,
        duration_seconds: f64,
    ) -> Analysis {
        match self
            .analyze_with_llm(segments, speakers, recording_type, duration_seconds)
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                log::warn!("LLM analysis failed, using heuristic fallback: {}", e);
                heuristic_analysis(segments, recording_type, duration_seconds)
            }
        }
    }
}

fn build_prompt(
    segments: &[SpeakerSegment],
    speakers: &[Speaker],
    recording_type: RecordingType,
) -> String {
    let mut transcript = String::new();
    for seg in segments {
        let name = speakers
            .iter()
            .find(|s| s.id == seg.speaker)
            .and_then(|s| s.label.as_deref())
            .unwrap_or(&seg.speaker);
        transcript.push_str(&format!("{}: {}\n", name, seg.text));
        if transcript.len() > MAX_PROMPT_TRANSCRIPT_CHARS {
            transcript.push_str("[transcript truncated]\n");
            break;
        }
    }

    format!(
        "Analyze this {} transcript and respond with a JSON object containing:\n\
         - \"summary\": 2-4 sentence summary\n\
         - \"action_items\": array of {{\"text\", \"owner\", \"due_hint\", \"priority\" (low|medium|high)}}\n\
         - \"key_decisions\": array of strings\n\
         - \"open_questions\": array of strings\n\
         - \"topics\": array of short topic strings\n\
         - \"sentiment\": one of positive|neutral|negative\n\n\
         ---\nTRANSCRIPT:\n{}\n---\n\n\
         Respond in JSON format only.",
        recording_type, transcript
    )
}

/// Pull a JSON object out of a model response. Models answer with bare JSON,
/// a fenced ```json block, or JSON buried in prose; all three are accepted.
pub fn extract_json_from_response(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    if let Some(start) = trimmed.find("```json") {
        let fenced = &trimmed[start + 7..];
        if let Some(end) = fenced.find("```") {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(fenced[..end].trim()) {
                return Some(json);
            }
        }
    }

    // Last resort: the first balanced {...} span. Byte offsets come from
    // char_indices so multibyte text inside the object cannot split a char.
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    for (i, c) in trimmed[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..start + i + c.len_utf8()];
                    return serde_json::from_str::<serde_json::Value>(candidate).ok();
                }
            }
            _ => {}
        }
    }

    None
}

fn parse_analysis_json(json: &serde_json::Value, duration_seconds: f64) -> Result<Analysis, AppError> {
    let summary = json
        .get("summary")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::Backend("analysis JSON missing summary".to_string()))?;

    let action_items = json
        .get("action_items")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(parse_action_item).collect())
        .unwrap_or_default();

    Ok(Analysis {
        summary,
        action_items,
        key_decisions: string_list(json.get("key_decisions")),
        open_questions: string_list(json.get("open_questions")),
        topics: string_list(json.get("topics")),
        sentiment: json
            .get("sentiment")
            .and_then(|v| v.as_str())
            .filter(|s| matches!(*s, "positive" | "neutral" | "negative"))
            .unwrap_or("neutral")
            .to_string(),
        duration_formatted: format_duration(duration_seconds),
    })
}

/// Tolerates both object and bare-string action items; models emit both.
fn parse_action_item(value: &serde_json::Value) -> Option<ActionItem> {
    if let Some(text) = value.as_str() {
        return Some(ActionItem {
            text: text.to_string(),
            owner: None,
            due_hint: None,
            priority: Priority::Medium,
        });
    }

    let text = value.get("text").and_then(|v| v.as_str())?.to_string();
    let priority = match value.get("priority").and_then(|v| v.as_str()) {
        Some("high") => Priority::High,
        Some("low") => Priority::Low,
        _ => Priority::Medium,
    };
    Some(ActionItem {
        text,
        owner: value
            .get("owner")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        due_hint: value
            .get("due_hint")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        priority,
    })
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Rule-based substitute used when the LLM is unreachable. Always yields a
/// non-empty summary and a neutral sentiment.
pub fn heuristic_analysis(
    segments: &[SpeakerSegment],
    recording_type: RecordingType,
    duration_seconds: f64,
) -> Analysis {
    let whitespace = regex::Regex::new(r"\s+").expect("static regex");

    let mut summary: String = segments
        .iter()
        .take(HEURISTIC_SUMMARY_SEGMENTS)
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    summary = whitespace.replace_all(&summary, " ").to_string();

    if summary.is_empty() {
        summary = format!("Recording of type '{}' with no transcribed speech.", recording_type);
    } else {
        summary = format!("Opening of the recording: {}", summary);
    }

    Analysis {
        summary,
        action_items: Vec::new(),
        key_decisions: Vec::new(),
        open_questions: Vec::new(),
        topics: vec![format!("{} recording", recording_type)],
        sentiment: "neutral".to_string(),
        duration_formatted: format_duration(duration_seconds),
    }
}

/// "1h 02m 03s" style duration for display.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as i64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(speaker: &str, text: &str) -> SpeakerSegment {
        SpeakerSegment {
            speaker: speaker.to_string(),
            start_ms: 0,
            end_ms: 1000,
            text: text.to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_extract_json_from_response() {
        // Direct JSON
        let json = extract_json_from_response(r#"{"name": "test"}"#);
        assert!(json.is_some());

        // Markdown code block
        let json = extract_json_from_response(
            r#"Here's the result:
```json
{"items": [1, 2, 3]}
```
"#,
        );
        assert!(json.is_some());

        // JSON embedded in text
        let json =
            extract_json_from_response(r#"The extracted data is: {"value": 42} and that's it."#);
        assert!(json.is_some());

        // No JSON at all
        assert!(extract_json_from_response("I couldn't analyze this.").is_none());
    }

    #[test]
    fn test_extract_json_with_multibyte_text() {
        // Non-ASCII directly before the closing brace must not break the
        // balanced-span slice
        let json = extract_json_from_response(
            r#"Voici le résultat : {"summary": "Budget réunion, coût 20€"} merci."#,
        )
        .unwrap();
        assert_eq!(json["summary"], "Budget réunion, coût 20€");

        // Unparseable multibyte brace span returns None instead of panicking
        assert!(extract_json_from_response("{a€}").is_none());
    }

    #[test]
    fn test_parse_analysis_json_full() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
                "summary": "A short sync about release planning.",
                "action_items": [
                    {"text": "Cut the release branch", "owner": "Dana", "priority": "high"},
                    "Update the changelog"
                ],
                "key_decisions": ["Ship on Friday"],
                "open_questions": ["Who owns QA signoff?"],
                "topics": ["release", "planning"],
                "sentiment": "positive"
            }"#,
        )
        .unwrap();

        let analysis = parse_analysis_json(&json, 125.0).unwrap();
        assert_eq!(analysis.action_items.len(), 2);
        assert_eq!(analysis.action_items[0].owner.as_deref(), Some("Dana"));
        assert_eq!(analysis.action_items[0].priority, Priority::High);
        assert_eq!(analysis.action_items[1].priority, Priority::Medium);
        assert_eq!(analysis.key_decisions, vec!["Ship on Friday"]);
        assert_eq!(analysis.sentiment, "positive");
        assert_eq!(analysis.duration_formatted, "2m 05s");
    }

    #[test]
    fn test_parse_analysis_json_missing_summary_is_error() {
        let json: serde_json::Value = serde_json::from_str(r#"{"topics": []}"#).unwrap();
        assert!(parse_analysis_json(&json, 10.0).is_err());
    }

    #[test]
    fn test_parse_analysis_json_invalid_sentiment_defaults_neutral() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"summary": "ok", "sentiment": "ecstatic"}"#).unwrap();
        let analysis = parse_analysis_json(&json, 10.0).unwrap();
        assert_eq!(analysis.sentiment, "neutral");
    }

    #[test]
    fn test_heuristic_analysis_properties() {
        let segments = vec![
            segment("SPEAKER_00", "Quick note to self about the quarterly numbers."),
            segment("SPEAKER_00", "Need to follow up with accounting."),
        ];
        let analysis = heuristic_analysis(&segments, RecordingType::Memo, 10.0);

        assert!(!analysis.summary.is_empty());
        assert_eq!(analysis.sentiment, "neutral");
        assert!(analysis.action_items.is_empty());
        assert!(analysis.key_decisions.is_empty());
        assert!(analysis.open_questions.is_empty());
        assert_eq!(analysis.topics, vec!["memo recording"]);
    }

    #[test]
    fn test_heuristic_analysis_empty_transcript() {
        let analysis = heuristic_analysis(&[], RecordingType::Other, 0.0);
        assert!(!analysis.summary.is_empty());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "0s");
        assert_eq!(format_duration(59.4), "59s");
        assert_eq!(format_duration(125.0), "2m 05s");
        assert_eq!(format_duration(3723.0), "1h 02m 03s");
    }

    struct FailingBackend;

    #[async_trait]
    impl LlmBackend for FailingBackend {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, AppError> {
            Err(AppError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_analyzer_falls_back_when_backend_fails() {
        let analyzer = LlmAnalyzer::with_backend(Box::new(FailingBackend));
        let segments = vec![segment("SPEAKER_00", "Hello world.")];

        let analysis = analyzer
            .analyze(&segments, &[], RecordingType::Memo, 10.0)
            .await;

        assert!(!analysis.summary.is_empty());
        assert_eq!(analysis.sentiment, "neutral");
        assert!(analysis.action_items.is_empty());
    }

    struct CannedBackend(String);

    #[async_trait]
    impl LlmBackend for CannedBackend {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, AppError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_analyzer_parses_backend_json() {
        let analyzer = LlmAnalyzer::with_backend(Box::new(CannedBackend(
            r#"```json
{"summary": "Two people planned a launch.", "sentiment": "positive", "topics": ["launch"]}
```"#
                .to_string(),
        )));
        let segments = vec![segment("SPEAKER_00", "Let's plan the launch.")];

        let analysis = analyzer
            .analyze(&segments, &[], RecordingType::Meeting, 60.0)
            .await;

        assert_eq!(analysis.summary, "Two people planned a launch.");
        assert_eq!(analysis.sentiment, "positive");
        assert_eq!(analysis.topics, vec!["launch"]);
    }

    #[tokio::test]
    async fn test_analyzer_falls_back_on_unparseable_response() {
        let analyzer =
            LlmAnalyzer::with_backend(Box::new(CannedBackend("not json at all".to_string())));
        let segments = vec![segment("SPEAKER_00", "Hello.")];

        let analysis = analyzer
            .analyze(&segments, &[], RecordingType::Call, 5.0)
            .await;

        // Fallback path: neutral sentiment, no structured extractions
        assert_eq!(analysis.sentiment, "neutral");
        assert!(analysis.action_items.is_empty());
    }
}
