//! Pipeline stages and the ordered steps of the analysis stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A unit of pipeline work recorded in `completed_stages`.
///
/// Variant order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcription,
    Analysis,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Transcription, Stage::Analysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Transcription => "transcription",
            Stage::Analysis => "analysis",
        }
    }

    /// Status detail written when a run starts at this stage.
    pub fn start_detail(&self) -> &'static str {
        match self {
            Stage::Transcription => "Starting processing...",
            Stage::Analysis => "Analyzing transcript...",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcription" => Ok(Stage::Transcription),
            "analysis" => Ok(Stage::Analysis),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Ordered sub-steps of the analysis stage. Each one is checkpointed
/// separately so a redelivered run resumes after the last finished step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStep {
    Evidence,
    EnrichPerson,
    Personas,
    Answers,
    Finalize,
}

impl AnalysisStep {
    pub const ALL: [AnalysisStep; 5] = [
        AnalysisStep::Evidence,
        AnalysisStep::EnrichPerson,
        AnalysisStep::Personas,
        AnalysisStep::Answers,
        AnalysisStep::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStep::Evidence => "evidence",
            AnalysisStep::EnrichPerson => "enrich_person",
            AnalysisStep::Personas => "personas",
            AnalysisStep::Answers => "answers",
            AnalysisStep::Finalize => "finalize",
        }
    }

    pub fn detail(&self) -> &'static str {
        match self {
            AnalysisStep::Evidence => "Extracting evidence...",
            AnalysisStep::EnrichPerson => "Enriching participant profile...",
            AnalysisStep::Personas => "Synthesizing personas...",
            AnalysisStep::Answers => "Answering research questions...",
            AnalysisStep::Finalize => "Finalizing analysis...",
        }
    }
}

impl fmt::Display for AnalysisStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalysisStep::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown analysis step '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_matches_execution_order() {
        assert!(Stage::Transcription < Stage::Analysis);
        assert_eq!(Stage::ALL[0], Stage::Transcription);
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!("analysis".parse::<Stage>().unwrap(), Stage::Analysis);
        assert!("upload".parse::<Stage>().is_err());
    }

    #[test]
    fn test_analysis_step_parse_matches_serde() {
        for step in AnalysisStep::ALL {
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{}\"", step.as_str()));
            assert_eq!(step.as_str().parse::<AnalysisStep>().unwrap(), step);
        }
    }
}
