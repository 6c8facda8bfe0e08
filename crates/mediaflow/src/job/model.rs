use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::{AnalysisStep, Stage};
use super::transcript::StructuredTranscript;

/// Lifecycle status of a processing job.
///
/// Monotonic under normal operation (`draft → processing → transcribed →
/// ready`). `error` is reachable from any non-terminal state and recovery
/// moves a job from `error` back into `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Draft,
    Processing,
    Transcribed,
    Ready,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Draft => "draft",
            JobStatus::Processing => "processing",
            JobStatus::Transcribed => "transcribed",
            JobStatus::Ready => "ready",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(JobStatus::Draft),
            "processing" => Ok(JobStatus::Processing),
            "transcribed" => Ok(JobStatus::Transcribed),
            "ready" => Ok(JobStatus::Ready),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// What kind of artifact a job was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    AudioUpload,
    VideoUpload,
    VoiceMemo,
    MeetingRecording,
    UrlImport,
    Text,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::AudioUpload => "audio_upload",
            ArtifactKind::VideoUpload => "video_upload",
            ArtifactKind::VoiceMemo => "voice_memo",
            ArtifactKind::MeetingRecording => "meeting_recording",
            ArtifactKind::UrlImport => "url_import",
            ArtifactKind::Text => "text",
        }
    }

    /// Whether media of this kind goes straight to the transcription gateway
    /// when no transcript exists yet.
    pub fn requires_transcription(&self) -> bool {
        matches!(
            self,
            ArtifactKind::AudioUpload | ArtifactKind::VideoUpload | ArtifactKind::VoiceMemo
        )
    }

    /// Transcription alone completes a job of this kind.
    pub fn is_transcript_only(&self) -> bool {
        matches!(self, ArtifactKind::VoiceMemo)
    }

    /// Stages a job of this kind must complete before it is `ready`.
    pub fn required_stages(&self) -> &'static [Stage] {
        match self {
            ArtifactKind::VoiceMemo => &[Stage::Transcription],
            ArtifactKind::Text => &[Stage::Analysis],
            _ => &[Stage::Transcription, Stage::Analysis],
        }
    }

    /// Guesses the kind from a media storage key by its extension. Media is
    /// always transcribed, so this never yields [`ArtifactKind::Text`].
    pub fn infer_from_media_ref(media_ref: &str) -> ArtifactKind {
        let Some(mime) = mime_guess::from_path(media_ref).first() else {
            return ArtifactKind::MeetingRecording;
        };
        if mime.type_() == mime_guess::mime::AUDIO {
            ArtifactKind::AudioUpload
        } else if mime.type_() == mime_guess::mime::VIDEO {
            ArtifactKind::VideoUpload
        } else {
            ArtifactKind::MeetingRecording
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio_upload" => Ok(ArtifactKind::AudioUpload),
            "video_upload" => Ok(ArtifactKind::VideoUpload),
            "voice_memo" => Ok(ArtifactKind::VoiceMemo),
            "meeting_recording" => Ok(ArtifactKind::MeetingRecording),
            "url_import" => Ok(ArtifactKind::UrlImport),
            "text" => Ok(ArtifactKind::Text),
            other => Err(format!("unknown artifact kind '{}'", other)),
        }
    }
}

/// An outstanding submission at the transcription provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderJob {
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Typed progress of a job, persisted as discrete columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current_stage: Option<Stage>,
    /// Append-only and de-duplicated.
    pub completed_stages: Vec<Stage>,
    pub status_detail: Option<String>,
    /// Run token of the stage runner dispatch currently in flight.
    pub in_flight_marker: Option<String>,
    pub provider_job: Option<ProviderJob>,
    pub last_error: Option<String>,
    /// Analysis steps finished by the current or last analysis run.
    pub analysis_checkpoint: Vec<AnalysisStep>,
}

impl Progress {
    pub fn has_completed(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }

    /// Appends a stage unless it is already recorded. Returns whether the
    /// list changed.
    pub fn append_stage(&mut self, stage: Stage) -> bool {
        if self.has_completed(stage) {
            return false;
        }
        self.completed_stages.push(stage);
        true
    }
}

/// One processing job per uploaded or imported artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: String,
    pub kind: ArtifactKind,
    pub status: JobStatus,
    pub media_ref: Option<String>,
    pub transcript_text: Option<String>,
    pub transcript_structured: Option<StructuredTranscript>,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    /// Creates a new job in `draft` with a fresh id.
    pub fn new(kind: ArtifactKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: JobStatus::Draft,
            media_ref: None,
            transcript_text: None,
            transcript_structured: None,
            progress: Progress::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_media(mut self, media_ref: impl Into<String>) -> Self {
        self.media_ref = Some(media_ref.into());
        self
    }

    pub fn with_transcript(mut self, text: impl Into<String>) -> Self {
        self.transcript_text = Some(text.into());
        self
    }

    pub fn has_media(&self) -> bool {
        self.media_ref.as_deref().is_some_and(|m| !m.is_empty())
    }

    pub fn has_transcript(&self) -> bool {
        self.transcript_text.is_some()
    }

    /// True when every stage the kind requires has been recorded.
    pub fn required_stages_done(&self) -> bool {
        self.kind
            .required_stages()
            .iter()
            .all(|s| self.progress.has_completed(*s))
    }

    /// Whether the record satisfies the `ready` invariant.
    pub fn is_complete(&self) -> bool {
        self.status == JobStatus::Ready
            && (self.has_transcript() || self.kind == ArtifactKind::Text)
            && self.required_stages_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_draft() {
        let job = ProcessingJob::new(ArtifactKind::AudioUpload);
        assert_eq!(job.status, JobStatus::Draft);
        assert!(job.progress.completed_stages.is_empty());
        assert!(!job.has_media());
        assert_eq!(job.id.len(), 36);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Draft,
            JobStatus::Processing,
            JobStatus::Transcribed,
            JobStatus::Ready,
            JobStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("completed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_kind_transcription_requirements() {
        assert!(ArtifactKind::AudioUpload.requires_transcription());
        assert!(ArtifactKind::VideoUpload.requires_transcription());
        assert!(ArtifactKind::VoiceMemo.requires_transcription());
        assert!(!ArtifactKind::MeetingRecording.requires_transcription());
        assert!(!ArtifactKind::Text.requires_transcription());
        assert!(ArtifactKind::VoiceMemo.is_transcript_only());
    }

    #[test]
    fn test_required_stages() {
        assert_eq!(
            ArtifactKind::AudioUpload.required_stages(),
            &[Stage::Transcription, Stage::Analysis]
        );
        assert_eq!(ArtifactKind::VoiceMemo.required_stages(), &[Stage::Transcription]);
        assert_eq!(ArtifactKind::Text.required_stages(), &[Stage::Analysis]);
    }

    #[test]
    fn test_infer_kind_from_media_ref() {
        assert_eq!(
            ArtifactKind::infer_from_media_ref("uploads/interview.mp3"),
            ArtifactKind::AudioUpload
        );
        assert_eq!(
            ArtifactKind::infer_from_media_ref("uploads/call.mp4"),
            ArtifactKind::VideoUpload
        );
        assert_eq!(
            ArtifactKind::infer_from_media_ref("notes.txt"),
            ArtifactKind::MeetingRecording
        );
        assert_eq!(
            ArtifactKind::infer_from_media_ref("blob/no-extension"),
            ArtifactKind::MeetingRecording
        );
    }

    #[test]
    fn test_append_stage_deduplicates() {
        let mut progress = Progress::default();
        assert!(progress.append_stage(Stage::Transcription));
        assert!(!progress.append_stage(Stage::Transcription));
        assert!(progress.append_stage(Stage::Analysis));
        assert_eq!(
            progress.completed_stages,
            vec![Stage::Transcription, Stage::Analysis]
        );
    }

    #[test]
    fn test_is_complete_requires_transcript_and_stages() {
        let mut job = ProcessingJob::new(ArtifactKind::AudioUpload).with_media("a.mp3");
        job.status = JobStatus::Ready;
        assert!(!job.is_complete());

        job.transcript_text = Some("hello".to_string());
        job.progress.append_stage(Stage::Transcription);
        assert!(!job.is_complete());

        job.progress.append_stage(Stage::Analysis);
        assert!(job.is_complete());
    }

    #[test]
    fn test_text_job_complete_without_transcript() {
        let mut job = ProcessingJob::new(ArtifactKind::Text);
        job.status = JobStatus::Ready;
        job.progress.append_stage(Stage::Analysis);
        assert!(job.is_complete());
    }
}
