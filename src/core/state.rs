use crate::core::error::StateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConceptInput {
    pub world: String,
    pub character: String,
    pub premise: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WorldBible {
    #[serde(default)]
    pub tone: String,
    pub rules: Vec<String>,
    pub locations: Vec<Location>,
    #[serde(default)]
    pub history: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CharacterProfile {
    pub name: String,
    pub traits: Vec<String>,
    #[serde(default)]
    pub backstory: String,
    /// Arc state; rewritten at every chapter boundary.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub motivation: String,
    #[serde(default)]
    pub fears: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChapterSummary {
    pub number: u32,
    #[serde(default)]
    pub title: String,
    pub summary: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PlotOutline {
    pub chapters: Vec<ChapterSummary>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SceneEntry {
    /// 1-based position within the chapter.
    pub index: u32,
    pub goal: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub setting: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ScenePlan {
    pub chapter: u32,
    pub scenes: Vec<SceneEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SceneProse {
    pub index: u32,
    pub text: String,
}

/// Scene plan and prose of the chapter the controller is working on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChapterWork {
    pub number: u32,
    pub plan: Option<ScenePlan>,
    #[serde(default)]
    pub prose: Vec<SceneProse>,
    #[serde(default)]
    pub skipped: Vec<u32>,
    /// Scene whose last generation attempt was filtered.
    #[serde(skip)]
    pub(crate) blocked_scene: Option<u32>,
    /// Extra phrasing guidance for the next attempt at the blocked scene.
    #[serde(skip)]
    pub(crate) guidance: Option<String>,
}

impl ChapterWork {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            plan: None,
            prose: Vec::new(),
            skipped: Vec::new(),
            blocked_scene: None,
            guidance: None,
        }
    }

    /// First planned scene that has neither prose nor a skip recorded.
    pub fn next_scene(&self) -> Option<&SceneEntry> {
        let plan = self.plan.as_ref()?;
        plan.scenes.iter().find(|scene| {
            !self.prose.iter().any(|p| p.index == scene.index) && !self.skipped.contains(&scene.index)
        })
    }

    pub fn is_complete(&self) -> bool {
        self.plan.is_some() && self.next_scene().is_none()
    }

    pub fn blocked_scene(&self) -> Option<u32> {
        self.blocked_scene
    }

    pub fn scene(&self, index: u32) -> Option<&SceneEntry> {
        self.plan.as_ref()?.scenes.iter().find(|s| s.index == index)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "phase", content = "chapter", rename_all = "snake_case")]
pub enum PipelinePhase {
    NotStarted,
    FoundationDone,
    ChapterInProgress(u32),
    ChapterDone(u32),
    Complete,
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelinePhase::NotStarted => write!(f, "not started"),
            PipelinePhase::FoundationDone => write!(f, "foundation done"),
            PipelinePhase::ChapterInProgress(n) => write!(f, "chapter {} in progress", n),
            PipelinePhase::ChapterDone(n) => write!(f, "chapter {} done", n),
            PipelinePhase::Complete => write!(f, "complete"),
        }
    }
}

/// Entity produced by a stage, merged into the state by the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum StateDelta {
    WorldBible(WorldBible),
    CharacterProfile(CharacterProfile),
    PlotOutline(PlotOutline),
    ScenePlan(ScenePlan),
    SceneProse(SceneProse),
    /// End-of-chapter replacement of the whole profile.
    FinalCharacterState(CharacterProfile),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PipelineState {
    /// Identifies the novel a checkpoint belongs to.
    #[serde(default)]
    pub run_id: String,
    pub concepts: ConceptInput,
    pub phase: PipelinePhase,
    pub world_bible: Option<WorldBible>,
    pub character: Option<CharacterProfile>,
    pub outline: Option<PlotOutline>,
    pub chapter: Option<ChapterWork>,
}

impl PipelineState {
    pub fn new(concepts: ConceptInput) -> Self {
        Self {
            run_id: new_run_id(),
            concepts,
            phase: PipelinePhase::NotStarted,
            world_bible: None,
            character: None,
            outline: None,
            chapter: None,
        }
    }

    pub fn total_chapters(&self) -> u32 {
        self.outline
            .as_ref()
            .map(|o| o.chapters.len() as u32)
            .unwrap_or(0)
    }

    pub fn chapter_summary(&self, number: u32) -> Option<&ChapterSummary> {
        self.outline
            .as_ref()?
            .chapters
            .iter()
            .find(|c| c.number == number)
    }

    pub fn apply(&mut self, delta: StateDelta) -> Result<(), StateError> {
        match delta {
            StateDelta::WorldBible(bible) => {
                if self.world_bible.is_some() {
                    return Err(StateError::AlreadySet("world bible"));
                }
                self.world_bible = Some(bible);
            }
            StateDelta::CharacterProfile(profile) => {
                if self.character.is_some() {
                    return Err(StateError::AlreadySet("character profile"));
                }
                self.character = Some(profile);
            }
            StateDelta::PlotOutline(outline) => {
                if self.outline.is_some() {
                    return Err(StateError::AlreadySet("plot outline"));
                }
                self.outline = Some(outline);
            }
            StateDelta::ScenePlan(plan) => {
                let work = self.chapter.as_mut().ok_or(StateError::NoActiveChapter)?;
                if plan.chapter != work.number {
                    return Err(StateError::WrongChapter {
                        expected: work.number,
                        got: plan.chapter,
                    });
                }
                if work.plan.is_some() {
                    return Err(StateError::AlreadySet("scene plan"));
                }
                work.plan = Some(plan);
            }
            StateDelta::SceneProse(prose) => {
                let work = self.chapter.as_mut().ok_or(StateError::NoActiveChapter)?;
                if work.plan.is_none() {
                    return Err(StateError::Missing("scene plan"));
                }
                let expected = work
                    .next_scene()
                    .map(|s| s.index)
                    .ok_or(StateError::SceneOutOfOrder {
                        expected: 0,
                        got: prose.index,
                    })?;
                if prose.index != expected {
                    return Err(StateError::SceneOutOfOrder {
                        expected,
                        got: prose.index,
                    });
                }
                if prose.text.trim().is_empty() {
                    return Err(StateError::EmptyProse(prose.index));
                }
                work.prose.push(prose);
                work.blocked_scene = None;
                work.guidance = None;
            }
            StateDelta::FinalCharacterState(profile) => {
                if self.character.is_none() {
                    return Err(StateError::Missing("character profile"));
                }
                self.character = Some(profile);
            }
        }
        Ok(())
    }
}

static RUNS_STARTED: AtomicU32 = AtomicU32::new(0);

fn new_run_id() -> String {
    let seq = RUNS_STARTED.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{:x}-{:x}-{}", nanos, std::process::id(), seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concepts() -> ConceptInput {
        ConceptInput {
            world: "a floating city".to_string(),
            character: "a disgraced pilot".to_string(),
            premise: "a heist to steal back her ship".to_string(),
        }
    }

    fn scene(index: u32) -> SceneEntry {
        SceneEntry {
            index,
            goal: format!("goal {}", index),
            title: String::new(),
            characters: vec![],
            setting: String::new(),
        }
    }

    fn state_with_plan(scenes: u32) -> PipelineState {
        let mut state = PipelineState::new(concepts());
        state.chapter = Some(ChapterWork::new(1));
        state
            .apply(StateDelta::ScenePlan(ScenePlan {
                chapter: 1,
                scenes: (1..=scenes).map(scene).collect(),
            }))
            .unwrap();
        state
    }

    fn prose(index: u32) -> StateDelta {
        StateDelta::SceneProse(SceneProse {
            index,
            text: format!("Scene {} happened.", index),
        })
    }

    #[test]
    fn test_foundation_entities_are_write_once() {
        let mut state = PipelineState::new(concepts());
        let bible = WorldBible {
            tone: "wistful".to_string(),
            rules: vec!["Nothing falls".to_string()],
            locations: vec![],
            history: String::new(),
        };
        state.apply(StateDelta::WorldBible(bible.clone())).unwrap();
        assert_eq!(
            state.apply(StateDelta::WorldBible(bible)),
            Err(StateError::AlreadySet("world bible"))
        );
    }

    #[test]
    fn test_prose_must_follow_plan_order() {
        let mut state = state_with_plan(3);
        state.apply(prose(1)).unwrap();
        assert_eq!(
            state.apply(prose(3)),
            Err(StateError::SceneOutOfOrder { expected: 2, got: 3 })
        );
        state.apply(prose(2)).unwrap();
        state.apply(prose(3)).unwrap();

        let work = state.chapter.as_ref().unwrap();
        assert!(work.is_complete());
        let order: Vec<u32> = work.prose.iter().map(|p| p.index).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_prose_is_rejected() {
        let mut state = state_with_plan(1);
        let result = state.apply(StateDelta::SceneProse(SceneProse {
            index: 1,
            text: "   ".to_string(),
        }));
        assert_eq!(result, Err(StateError::EmptyProse(1)));
        assert!(state.chapter.as_ref().unwrap().prose.is_empty());
    }

    #[test]
    fn test_skipped_scene_is_not_expected() {
        let mut state = state_with_plan(3);
        state.apply(prose(1)).unwrap();
        state.chapter.as_mut().unwrap().skipped.push(2);
        assert_eq!(state.chapter.as_ref().unwrap().next_scene().map(|s| s.index), Some(3));
        state.apply(prose(3)).unwrap();
        assert!(state.chapter.as_ref().unwrap().is_complete());
    }

    #[test]
    fn test_scene_plan_requires_matching_chapter() {
        let mut state = PipelineState::new(concepts());
        let plan = ScenePlan {
            chapter: 2,
            scenes: vec![scene(1)],
        };
        assert_eq!(
            state.apply(StateDelta::ScenePlan(plan.clone())),
            Err(StateError::NoActiveChapter)
        );
        state.chapter = Some(ChapterWork::new(1));
        assert_eq!(
            state.apply(StateDelta::ScenePlan(plan)),
            Err(StateError::WrongChapter { expected: 1, got: 2 })
        );
    }

    #[test]
    fn test_each_new_state_gets_its_own_run_id() {
        let first = PipelineState::new(concepts());
        let second = PipelineState::new(concepts());
        assert!(!first.run_id.is_empty());
        assert_ne!(first.run_id, second.run_id);
    }

    #[test]
    fn test_phase_snapshot_format() {
        let json = serde_json::to_string(&PipelinePhase::ChapterDone(2)).unwrap();
        assert_eq!(json, r#"{"phase":"chapter_done","chapter":2}"#);
        let back: PipelinePhase = serde_json::from_str(r#"{"phase":"not_started"}"#).unwrap();
        assert_eq!(back, PipelinePhase::NotStarted);
    }
}
