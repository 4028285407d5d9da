use crate::core::config::Config;
use crate::core::error::{PipelineError, StageError, StageKind, StateError};
use crate::core::io::{read_json, write_json, Storage};
use crate::core::state::{ConceptInput, ChapterWork, PipelinePhase, PipelineState, StateDelta};
use crate::services::llm::LlmClient;
use crate::services::stages::{self, SceneContext};
use crate::utils::text::tail_sentences;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const FOUNDATION_STATE: &str = "foundation_state.json";

/// Closing sentences of the last scene used for the end-of-chapter status.
const STATUS_SENTENCES: usize = 3;

/// One entry of `chapter_{n}_scenes.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SceneRecord {
    pub index: u32,
    pub goal: String,
    pub characters: Vec<String>,
    pub prose: String,
}

/// How the caller wants a filtered scene handled on the next trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneResolution {
    Retry,
    /// Retry with extra direction appended to the scene prompt.
    Rephrase(String),
    /// Leave the scene out of the chapter.
    Skip,
}

pub struct Pipeline {
    config: Config,
    llm: Box<dyn LlmClient>,
    storage: Arc<dyn Storage>,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(
        config: Config,
        llm: Box<dyn LlmClient>,
        storage: Arc<dyn Storage>,
        concepts: ConceptInput,
    ) -> Self {
        Self {
            config,
            llm,
            storage,
            state: PipelineState::new(concepts),
        }
    }

    /// Picks up the newest checkpoint of the novel in `foundation_state.json`:
    /// its highest `chapter_{n}_state.json`, else the foundation itself.
    /// Chapter checkpoints left in the folder by an earlier novel are ignored.
    pub async fn resume(
        config: Config,
        llm: Box<dyn LlmClient>,
        storage: Arc<dyn Storage>,
    ) -> Result<Option<Self>> {
        let foundation_path = artifact_path(&config, FOUNDATION_STATE);
        if !storage.exists(&foundation_path).await? {
            return Ok(None);
        }
        let foundation: PipelineState = read_json(storage.as_ref(), &foundation_path).await?;

        let mut chapters: Vec<u32> = storage
            .list(&config.output_folder)
            .await?
            .iter()
            .filter_map(|entry| checkpoint_chapter(entry))
            .collect();
        chapters.sort_unstable_by(|a, b| b.cmp(a));

        let mut latest = None;
        for n in chapters {
            let path = artifact_path(&config, &format!("chapter_{}_state.json", n));
            let candidate: PipelineState = read_json(storage.as_ref(), &path).await?;
            if candidate.run_id == foundation.run_id {
                latest = Some((path, candidate));
                break;
            }
            debug!("Ignoring {}: written for another novel", path);
        }
        let (path, mut state) = latest.unwrap_or((foundation_path, foundation));
        if let PipelinePhase::ChapterDone(n) = state.phase {
            if n >= state.total_chapters() {
                state.phase = PipelinePhase::Complete;
            }
        }
        info!("Resuming from {} ({})", path, state.phase);

        Ok(Some(Self {
            config,
            llm,
            storage,
            state,
        }))
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn phase(&self) -> PipelinePhase {
        self.state.phase
    }

    /// Chapter a trigger would work on next, if any.
    pub fn next_chapter(&self) -> Option<u32> {
        match self.state.phase {
            PipelinePhase::FoundationDone => Some(1),
            PipelinePhase::ChapterInProgress(n) => Some(n),
            PipelinePhase::ChapterDone(n) if n < self.state.total_chapters() => Some(n + 1),
            _ => None,
        }
    }

    /// Builds the world bible, character profile and plot outline.
    ///
    /// Entities that already exist are kept, so calling this again after a
    /// failure continues with the stage that failed.
    pub async fn run_foundation(&mut self) -> Result<(), PipelineError> {
        if self.state.phase != PipelinePhase::NotStarted {
            return Err(self.invalid("run the foundation stages"));
        }
        let structured = self.config.llm.structured_options();

        if self.state.world_bible.is_none() {
            println!("Building world bible...");
            let delta = stages::world_bible(&self.state.concepts, self.llm.as_ref(), &structured).await?;
            self.state.apply(delta)?;
        } else {
            debug!("World bible already present, skipping");
        }

        if self.state.character.is_none() {
            println!("Building character bible...");
            let delta = stages::character_bible(
                &self.state.concepts,
                self.state.world_bible.as_ref(),
                self.llm.as_ref(),
                &structured,
            )
            .await?;
            self.state.apply(delta)?;
        } else {
            debug!("Character profile already present, skipping");
        }

        if self.state.outline.is_none() {
            println!("Outlining plot...");
            let world = self.state.world_bible.as_ref().ok_or(StageError::MissingInput {
                stage: StageKind::PlotOutline,
                field: "world_bible",
            })?;
            let character = self.state.character.as_ref().ok_or(StageError::MissingInput {
                stage: StageKind::PlotOutline,
                field: "character_profile",
            })?;
            let delta = stages::plot_outline(
                &self.state.concepts,
                world,
                character,
                self.llm.as_ref(),
                &structured,
            )
            .await?;
            self.state.apply(delta)?;
        } else {
            debug!("Plot outline already present, skipping");
        }

        let mut done = self.state.clone();
        done.phase = PipelinePhase::FoundationDone;
        self.save_snapshot(FOUNDATION_STATE, &done).await?;
        self.state = done;
        info!("Foundation done: {} chapters planned", self.state.total_chapters());
        Ok(())
    }

    /// Handles one external trigger: starts the next chapter, or continues the
    /// chapter in progress, and runs it to completion. Returns its number.
    pub async fn advance_chapter(&mut self) -> Result<u32, PipelineError> {
        let number = self
            .next_chapter()
            .ok_or_else(|| self.invalid("advance to the next chapter"))?;

        let resuming = matches!(self.state.chapter.as_ref(), Some(work) if work.number == number)
            && self.state.phase == PipelinePhase::ChapterInProgress(number);
        if resuming {
            info!("Continuing chapter {}", number);
        } else {
            self.state.chapter = Some(ChapterWork::new(number));
            self.state.phase = PipelinePhase::ChapterInProgress(number);
        }

        self.run_chapter(number).await?;
        self.finish_chapter(number).await?;
        Ok(number)
    }

    /// Decides what the next trigger does with the scene whose output was
    /// filtered.
    pub fn resolve_filtered(&mut self, resolution: SceneResolution) -> Result<(), PipelineError> {
        let phase = self.state.phase;
        let work = match self.state.chapter.as_mut() {
            Some(work) if work.blocked_scene().is_some() => work,
            _ => {
                return Err(PipelineError::InvalidTransition {
                    phase,
                    action: "resolve a filtered scene",
                })
            }
        };
        let scene = work.blocked_scene().unwrap_or_default();

        match resolution {
            SceneResolution::Retry => work.guidance = None,
            SceneResolution::Rephrase(guidance) => work.guidance = Some(guidance),
            SceneResolution::Skip => {
                warn!("Skipping scene {} of chapter {}", scene, work.number);
                work.skipped.push(scene);
                work.blocked_scene = None;
                work.guidance = None;
            }
        }
        Ok(())
    }

    async fn run_chapter(&mut self, number: u32) -> Result<(), PipelineError> {
        let summary = self
            .state
            .chapter_summary(number)
            .cloned()
            .ok_or(StateError::Missing("chapter summary"))?;

        if self.active_chapter()?.plan.is_none() {
            println!("Planning chapter {}...", number);
            let character = self.state.character.as_ref().ok_or(StageError::MissingInput {
                stage: StageKind::ChapterPlanner,
                field: "character_profile",
            })?;
            let world = self.state.world_bible.as_ref().ok_or(StageError::MissingInput {
                stage: StageKind::ChapterPlanner,
                field: "world_bible",
            })?;
            let delta = stages::chapter_planner(
                &summary,
                character,
                world,
                self.llm.as_ref(),
                &self.config.llm.structured_options(),
            )
            .await?;
            self.state.apply(delta)?;
        }

        let creative = self.config.llm.creative_options();
        let (total, done) = {
            let work = self.active_chapter()?;
            let total = work.plan.as_ref().map(|p| p.scenes.len()).unwrap_or(0);
            (total, work.prose.len() + work.skipped.len())
        };
        println!("Writing chapter {} ({} scenes)...", number, total);
        let pb = scene_progress(total as u64, done as u64);

        loop {
            let work = self.active_chapter()?;
            let Some(scene) = work.next_scene().cloned() else {
                break;
            };
            let guidance = if work.blocked_scene() == Some(scene.index) {
                work.guidance.clone()
            } else {
                None
            };
            debug!("Generating chapter {} scene {}", number, scene.index);

            let result = {
                let plan = work.plan.as_ref().ok_or(StateError::Missing("scene plan"))?;
                let character = self.state.character.as_ref().ok_or(StageError::MissingInput {
                    stage: StageKind::SceneGenerator,
                    field: "character_profile",
                })?;
                let world = self.state.world_bible.as_ref().ok_or(StageError::MissingInput {
                    stage: StageKind::SceneGenerator,
                    field: "world_bible",
                })?;
                let ctx = SceneContext {
                    scene: &scene,
                    plan,
                    prior: &work.prose,
                    character,
                    chapter: &summary,
                    world,
                    guidance: guidance.as_deref(),
                };
                stages::scene_generator(&ctx, self.llm.as_ref(), &creative).await
            };

            match result {
                Ok(delta) => self.state.apply(delta)?,
                Err(StageError::Filtered { .. }) => {
                    pb.abandon();
                    if let Some(work) = self.state.chapter.as_mut() {
                        work.blocked_scene = Some(scene.index);
                    }
                    return Err(PipelineError::FilteredOutput {
                        chapter: number,
                        scene: scene.index,
                    });
                }
                Err(e) => {
                    pb.abandon();
                    return Err(e.into());
                }
            }
            pb.inc(1);
        }

        pb.finish_and_clear();
        Ok(())
    }

    /// Writes the end-of-chapter status, persists the chapter artifacts and
    /// moves to `ChapterDone`, or `Complete` after the last chapter.
    ///
    /// The new status and phase are only committed once both artifacts are
    /// written; a failed write leaves the chapter in progress.
    async fn finish_chapter(&mut self, number: u32) -> Result<(), PipelineError> {
        let work = self.active_chapter()?;
        if !work.is_complete() {
            return Err(StateError::Missing("scene prose").into());
        }
        let closing = work
            .prose
            .last()
            .map(|p| tail_sentences(&p.text, STATUS_SENTENCES))
            .unwrap_or_default();
        let title = self
            .state
            .chapter_summary(number)
            .map(|c| c.title.clone())
            .unwrap_or_default();

        let mut profile = self
            .state
            .character
            .clone()
            .ok_or(StateError::Missing("character profile"))?;
        profile.status = chapter_status(number, &title, &closing);
        let mut done = self.state.clone();
        done.apply(StateDelta::FinalCharacterState(profile))?;
        done.phase = PipelinePhase::ChapterDone(number);

        let records = self.scene_records()?;
        let scenes_path = artifact_path(&self.config, &format!("chapter_{}_scenes.json", number));
        write_json(self.storage.as_ref(), &scenes_path, &records)
            .await
            .map_err(PipelineError::Persistence)?;
        self.save_snapshot(&format!("chapter_{}_state.json", number), &done)
            .await?;
        self.state = done;
        println!("Chapter {} complete: {}", number, scenes_path);

        if number >= self.state.total_chapters() {
            info!("All {} chapters written", number);
            self.state.phase = PipelinePhase::Complete;
        }
        Ok(())
    }

    fn scene_records(&self) -> Result<Vec<SceneRecord>, PipelineError> {
        let work = self.active_chapter()?;
        if work.plan.is_none() {
            return Err(StateError::Missing("scene plan").into());
        }
        Ok(work
            .prose
            .iter()
            .filter_map(|prose| {
                let scene = work.scene(prose.index)?;
                Some(SceneRecord {
                    index: scene.index,
                    goal: scene.goal.clone(),
                    characters: scene.characters.clone(),
                    prose: prose.text.clone(),
                })
            })
            .collect())
    }

    fn active_chapter(&self) -> Result<&ChapterWork, StateError> {
        self.state.chapter.as_ref().ok_or(StateError::NoActiveChapter)
    }

    async fn save_snapshot(&self, name: &str, state: &PipelineState) -> Result<(), PipelineError> {
        let path = artifact_path(&self.config, name);
        write_json(self.storage.as_ref(), &path, state)
            .await
            .map_err(PipelineError::Persistence)?;
        debug!("Saved checkpoint {}", path);
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> PipelineError {
        PipelineError::InvalidTransition {
            phase: self.state.phase,
            action,
        }
    }
}

fn artifact_path(config: &Config, name: &str) -> String {
    Path::new(&config.output_folder)
        .join(name)
        .to_string_lossy()
        .to_string()
}

/// Chapter number of a `chapter_{n}_state.json` path.
fn checkpoint_chapter(entry: &str) -> Option<u32> {
    let name = Path::new(entry).file_name()?.to_str()?;
    name.strip_prefix("chapter_")?
        .strip_suffix("_state.json")?
        .parse()
        .ok()
}

fn chapter_status(number: u32, title: &str, closing: &str) -> String {
    let heading = if title.is_empty() {
        format!("After chapter {}", number)
    } else {
        format!("After chapter {} ({})", number, title)
    };
    if closing.is_empty() {
        heading
    } else {
        format!("{}: {}", heading, closing)
    }
}

fn scene_progress(len: u64, position: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} scenes")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_position(position);
    pb
}
