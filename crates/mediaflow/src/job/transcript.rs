//! Normalized transcript representation.
//!
//! Providers return loosely typed JSON with their own field names. Everything
//! downstream works against [`StructuredTranscript`], built by [`normalize`].
//! Numeric fields accept numbers or numeric strings; unparseable values
//! become `None` instead of failing the whole transcript.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const MAX_TOPIC_RESULTS: usize = 200;
const MAX_LABELS_PER_RESULT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: String,
    pub text: String,
    pub start_ms: Option<f64>,
    pub end_ms: Option<f64>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicLabel {
    pub label: String,
    pub relevance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicResult {
    pub text: String,
    pub labels: Vec<TopicLabel>,
    pub start_ms: Option<f64>,
    pub end_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentResult {
    pub sentiment: String,
    pub speaker: Option<String>,
    pub text: String,
    pub start_ms: Option<f64>,
    pub end_ms: Option<f64>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub start_ms: f64,
    pub end_ms: Option<f64>,
    pub title: Option<String>,
    pub summary: Option<String>,
}

/// Provider-independent transcript, a superset of the plain text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredTranscript {
    pub text: String,
    #[serde(default)]
    pub utterances: Vec<Utterance>,
    #[serde(default)]
    pub topics: Vec<TopicResult>,
    #[serde(default)]
    pub sentiment: Vec<SentimentResult>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    pub language: Option<String>,
    pub language_code: Option<String>,
    pub confidence: Option<f64>,
    pub audio_duration_secs: Option<f64>,
    pub word_count: usize,
    pub speaker_count: usize,
}

/// Builds a [`StructuredTranscript`] from a provider payload.
///
/// Returns `None` when the payload carries no transcript text at all.
pub fn normalize(raw: &Value) -> Option<StructuredTranscript> {
    let obj = raw.as_object()?;
    let text = str_field(obj, &["text", "full_transcript", "transcript"])?.to_string();

    let utterances = array_field(obj, &["utterances", "speaker_transcripts"])
        .map(|items| items.iter().filter_map(utterance).collect::<Vec<_>>())
        .unwrap_or_default();

    let topics = obj
        .get("iab_categories_result")
        .or_else(|| obj.get("topic_detection"))
        .and_then(|v| v.get("results"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .take(MAX_TOPIC_RESULTS)
                .filter_map(topic)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let sentiment = array_field(obj, &["sentiment_analysis_results", "sentiment_analysis"])
        .map(|items| items.iter().filter_map(sentiment).collect::<Vec<_>>())
        .unwrap_or_default();

    let chapters = array_field(obj, &["chapters", "auto_chapters", "segments"])
        .map(|items| items.iter().filter_map(chapter).collect::<Vec<_>>())
        .unwrap_or_default();

    let language_code = str_field(obj, &["language_code"]).map(str::to_string);
    let language = str_field(obj, &["language"])
        .map(str::to_string)
        .or_else(|| language_code.clone());

    let word_count = number_field(obj, &["word_count"])
        .map(|n| n as usize)
        .or_else(|| obj.get("words").and_then(Value::as_array).map(Vec::len))
        .unwrap_or_else(|| text.split_whitespace().count());

    let speaker_count = number_field(obj, &["speaker_count"])
        .map(|n| n as usize)
        .unwrap_or_else(|| distinct_speakers(&utterances));

    Some(StructuredTranscript {
        text,
        utterances,
        topics,
        sentiment,
        chapters,
        language,
        language_code,
        confidence: number_field(obj, &["confidence"]),
        audio_duration_secs: number_field(obj, &["audio_duration"]),
        word_count,
        speaker_count,
    })
}

/// Accepts finite numbers or strings that parse as one.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

fn number_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(coerce_number))
}

fn array_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_array))
}

fn utterance(item: &Value) -> Option<Utterance> {
    let row = item.as_object()?;
    let speaker = str_field(row, &["speaker", "speaker_label", "channel"])
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    Some(Utterance {
        speaker,
        text: str_field(row, &["text"]).unwrap_or_default().to_string(),
        start_ms: number_field(row, &["start", "start_time", "begin"]),
        end_ms: number_field(row, &["end", "end_time", "finish", "stop"]),
        confidence: number_field(row, &["confidence", "confidence_score"]),
    })
}

fn topic(item: &Value) -> Option<TopicResult> {
    let row = item.as_object()?;
    let labels = row
        .get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|label| {
                    let label = label.as_object()?;
                    let name = str_field(label, &["label"]).filter(|n| !n.is_empty())?;
                    Some(TopicLabel {
                        label: name.to_string(),
                        relevance: number_field(label, &["relevance"]).unwrap_or(0.0),
                    })
                })
                .take(MAX_LABELS_PER_RESULT)
                .collect()
        })
        .unwrap_or_default();
    Some(TopicResult {
        text: str_field(row, &["text"]).unwrap_or_default().to_string(),
        labels,
        start_ms: number_field(row, &["start", "start_time"]),
        end_ms: number_field(row, &["end", "end_time"]),
    })
}

fn sentiment(item: &Value) -> Option<SentimentResult> {
    let row = item.as_object()?;
    Some(SentimentResult {
        sentiment: str_field(row, &["sentiment"])
            .unwrap_or("neutral")
            .to_string(),
        speaker: str_field(row, &["speaker"]).map(str::to_string),
        text: str_field(row, &["text"]).unwrap_or_default().to_string(),
        start_ms: number_field(row, &["start"]),
        end_ms: number_field(row, &["end"]),
        confidence: number_field(row, &["confidence"]),
    })
}

fn chapter(item: &Value) -> Option<Chapter> {
    let row = item.as_object()?;
    Some(Chapter {
        start_ms: number_field(row, &["start_ms", "start"])?,
        end_ms: number_field(row, &["end_ms", "end"]),
        title: str_field(row, &["title", "headline"]).map(str::to_string),
        summary: str_field(row, &["summary", "gist"]).map(str::to_string),
    })
}

fn distinct_speakers(utterances: &[Utterance]) -> usize {
    let mut speakers: Vec<&str> = utterances
        .iter()
        .map(|u| u.speaker.as_str())
        .filter(|s| !s.is_empty())
        .collect();
    speakers.sort_unstable();
    speakers.dedup();
    speakers.len()
}
