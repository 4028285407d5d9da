use crate::core::state::PipelinePhase;
use std::fmt;
use thiserror::Error;

/// Longest raw fragment kept inside a `NormalizationError`.
const FRAGMENT_LIMIT: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    WorldBible,
    CharacterBible,
    PlotOutline,
    ChapterPlanner,
    SceneGenerator,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::WorldBible => "world bible",
            StageKind::CharacterBible => "character bible",
            StageKind::PlotOutline => "plot outline",
            StageKind::ChapterPlanner => "chapter planner",
            StageKind::SceneGenerator => "scene generator",
        };
        f.write_str(name)
    }
}

/// Transport or remote failure of a single model call.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} API error: {message}")]
    Api {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} returned an unexpected response: {detail}")]
    Response {
        provider: &'static str,
        detail: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("model output is not structured data: {fragment}")]
    Unparseable { fragment: String },
    #[error("required field `{field}` is missing: {fragment}")]
    MissingField { field: String, fragment: String },
    #[error("field `{field}` is malformed, expected {expected}: {fragment}")]
    InvalidField {
        field: String,
        expected: &'static str,
        fragment: String,
    },
}

impl NormalizationError {
    pub(crate) fn unparseable(raw: &str) -> Self {
        NormalizationError::Unparseable {
            fragment: clip(raw),
        }
    }

    pub(crate) fn missing(field: &str, raw: &str) -> Self {
        NormalizationError::MissingField {
            field: field.to_string(),
            fragment: clip(raw),
        }
    }

    pub(crate) fn invalid(field: &str, expected: &'static str, raw: &str) -> Self {
        NormalizationError::InvalidField {
            field: field.to_string(),
            expected,
            fragment: clip(raw),
        }
    }

    /// Canonical name of the offending field, if the failure is tied to one.
    pub fn field(&self) -> Option<&str> {
        match self {
            NormalizationError::Unparseable { .. } => None,
            NormalizationError::MissingField { field, .. }
            | NormalizationError::InvalidField { field, .. } => Some(field),
        }
    }

    pub fn fragment(&self) -> &str {
        match self {
            NormalizationError::Unparseable { fragment }
            | NormalizationError::MissingField { fragment, .. }
            | NormalizationError::InvalidField { fragment, .. } => fragment,
        }
    }
}

fn clip(raw: &str) -> String {
    let raw = raw.trim();
    if raw.chars().count() <= FRAGMENT_LIMIT {
        raw.to_string()
    } else {
        let head: String = raw.chars().take(FRAGMENT_LIMIT).collect();
        format!("{}...", head)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage} stage: model call failed: {source}")]
    Generation {
        stage: StageKind,
        #[source]
        source: GenerationError,
    },
    #[error("{stage} stage: output was suppressed by the content filter")]
    Filtered { stage: StageKind },
    #[error("{stage} stage: {source}")]
    Normalization {
        stage: StageKind,
        #[source]
        source: NormalizationError,
    },
    #[error("{stage} stage: input `{field}` is not available")]
    MissingInput {
        stage: StageKind,
        field: &'static str,
    },
}

impl StageError {
    pub fn stage(&self) -> StageKind {
        match self {
            StageError::Generation { stage, .. }
            | StageError::Filtered { stage }
            | StageError::Normalization { stage, .. }
            | StageError::MissingInput { stage, .. } => *stage,
        }
    }
}

/// Violations of the shared-state write rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("{0} is already set and cannot be replaced")]
    AlreadySet(&'static str),
    #[error("{0} has not been generated yet")]
    Missing(&'static str),
    #[error("no chapter is in progress")]
    NoActiveChapter,
    #[error("scene plan is for chapter {got}, but chapter {expected} is in progress")]
    WrongChapter { expected: u32, got: u32 },
    #[error("scene {got} arrived out of order (expected scene {expected})")]
    SceneOutOfOrder { expected: u32, got: u32 },
    #[error("scene {0} produced empty prose")]
    EmptyProse(u32),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot {action} while the pipeline is at {phase}")]
    InvalidTransition {
        phase: PipelinePhase,
        action: &'static str,
    },
    #[error("chapter {chapter}, scene {scene}: output was suppressed by the content filter")]
    FilteredOutput { chapter: u32, scene: u32 },
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to persist checkpoint: {0:#}")]
    Persistence(anyhow::Error),
}

impl PipelineError {
    /// Filtered output can be retried or skipped without losing chapter progress.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::FilteredOutput { .. }
                | PipelineError::Stage(StageError::Filtered { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_is_clipped() {
        let raw = "x".repeat(1000);
        let err = NormalizationError::missing("goal", &raw);
        assert_eq!(err.field(), Some("goal"));
        assert!(err.fragment().len() < 300);
        assert!(err.fragment().ends_with("..."));
    }

    #[test]
    fn test_filtered_errors_are_recoverable() {
        let scene = PipelineError::FilteredOutput { chapter: 1, scene: 2 };
        assert!(scene.is_recoverable());

        let stage = PipelineError::from(StageError::Filtered {
            stage: StageKind::WorldBible,
        });
        assert!(stage.is_recoverable());

        let schema = PipelineError::from(StageError::Normalization {
            stage: StageKind::PlotOutline,
            source: NormalizationError::unparseable("nope"),
        });
        assert!(!schema.is_recoverable());
    }
}
