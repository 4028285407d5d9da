//! One async function per generation stage.
//!
//! Stages read borrowed slices of the pipeline state, make exactly one model
//! call and return a `StateDelta`. They never touch the state themselves.

use crate::core::error::{StageError, StageKind};
use crate::core::state::{
    ChapterSummary, CharacterProfile, ConceptInput, PlotOutline, SceneEntry, ScenePlan,
    SceneProse, StateDelta, WorldBible,
};
use crate::services::llm::{GenerationConfig, LlmClient};
use crate::services::normalize::{normalize_into, Shape};
use crate::utils::text::{bullet_list, tail_sentences};
use log::{debug, warn};
use serde::de::DeserializeOwned;

const JSON_SYSTEM: &str = "You are a meticulous story architect. Respond only with valid JSON.";
const PROSE_SYSTEM: &str =
    "You are a novelist. Write vivid, coherent prose and nothing else: no headings, no notes.";

/// Sentences of the previous scene carried into the next scene's prompt.
const CONTINUITY_SENTENCES: usize = 3;

async fn call(
    stage: StageKind,
    llm: &dyn LlmClient,
    system: &str,
    prompt: &str,
    options: &GenerationConfig,
) -> Result<String, StageError> {
    let raw = llm
        .chat(system, prompt, options)
        .await
        .map_err(|source| StageError::Generation { stage, source })?;
    if raw.trim().is_empty() {
        warn!("{} stage: model returned no content", stage);
        return Err(StageError::Filtered { stage });
    }
    debug!("{} stage: received {} bytes", stage, raw.len());
    Ok(raw)
}

fn parse<T: DeserializeOwned>(stage: StageKind, raw: &str, shape: Shape) -> Result<T, StageError> {
    normalize_into(raw, shape).map_err(|source| StageError::Normalization { stage, source })
}

fn describe_world(world: &WorldBible) -> String {
    let locations = world
        .locations
        .iter()
        .map(|l| {
            if l.description.is_empty() {
                l.name.clone()
            } else {
                format!("{}: {}", l.name, l.description)
            }
        })
        .collect::<Vec<_>>();
    let mut out = format!(
        "Tone: {}\nRules:\n{}\nLocations:\n{}",
        if world.tone.is_empty() { "unspecified" } else { world.tone.as_str() },
        bullet_list(&world.rules),
        bullet_list(&locations),
    );
    if !world.history.is_empty() {
        out.push_str(&format!("\nHistory: {}", world.history));
    }
    out
}

fn describe_character(character: &CharacterProfile) -> String {
    let mut out = format!(
        "Name: {}\nTraits: {}",
        character.name,
        character.traits.join(", ")
    );
    for (label, value) in [
        ("Description", &character.description),
        ("Backstory", &character.backstory),
        ("Motivation", &character.motivation),
        ("Current status", &character.status),
    ] {
        if !value.is_empty() {
            out.push_str(&format!("\n{}: {}", label, value));
        }
    }
    if !character.fears.is_empty() {
        out.push_str(&format!("\nFears: {}", character.fears.join("; ")));
    }
    out
}

pub async fn world_bible(
    concepts: &ConceptInput,
    llm: &dyn LlmClient,
    options: &GenerationConfig,
) -> Result<StateDelta, StageError> {
    let prompt = format!(
        "Design the world for a novel based on this concept:\n\"{}\"\n\n\
        Return a JSON object with:\n\
        - \"tone\": the overall tone of the world, one sentence\n\
        - \"rules\": a list of the world's core rules (magic, technology, society)\n\
        - \"locations\": a list of key locations, each {{\"name\": \"...\", \"description\": \"...\"}}\n\
        - \"history\": a short snippet of the world's history\n\n\
        Provide at least two rules and two locations.",
        concepts.world
    );
    let raw = call(StageKind::WorldBible, llm, JSON_SYSTEM, &prompt, options).await?;
    let bible: WorldBible = parse(StageKind::WorldBible, &raw, Shape::WorldBible)?;
    Ok(StateDelta::WorldBible(bible))
}

pub async fn character_bible(
    concepts: &ConceptInput,
    world: Option<&WorldBible>,
    llm: &dyn LlmClient,
    options: &GenerationConfig,
) -> Result<StateDelta, StageError> {
    let world_context = match world {
        Some(world) => format!("\n\nThe character lives in this world:\n{}", describe_world(world)),
        None => String::new(),
    };
    let prompt = format!(
        "Create the protagonist of a novel from this concept:\n\"{}\"{}\n\n\
        Return a JSON object with:\n\
        - \"name\": the character's full name\n\
        - \"traits\": a list of defining personality traits\n\
        - \"description\": physical appearance in one or two sentences\n\
        - \"backstory\": a short backstory\n\
        - \"motivation\": what drives them\n\
        - \"fears\": a list of fears or weaknesses\n\
        - \"status\": where they stand emotionally at the start of the story",
        concepts.character, world_context
    );
    let raw = call(StageKind::CharacterBible, llm, JSON_SYSTEM, &prompt, options).await?;
    let profile: CharacterProfile = parse(StageKind::CharacterBible, &raw, Shape::CharacterProfile)?;
    Ok(StateDelta::CharacterProfile(profile))
}

pub async fn plot_outline(
    concepts: &ConceptInput,
    world: &WorldBible,
    character: &CharacterProfile,
    llm: &dyn LlmClient,
    options: &GenerationConfig,
) -> Result<StateDelta, StageError> {
    let prompt = format!(
        "Outline a novel with this premise:\n\"{}\"\n\n\
        World:\n{}\n\nProtagonist:\n{}\n\n\
        Return a JSON array of chapters in reading order, each \
        {{\"title\": \"...\", \"summary\": \"...\"}}. \
        Each summary should cover the chapter's key events in two to four sentences. \
        Plan between five and twelve chapters with a clear beginning, midpoint and resolution.",
        concepts.premise,
        describe_world(world),
        describe_character(character)
    );
    let raw = call(StageKind::PlotOutline, llm, JSON_SYSTEM, &prompt, options).await?;
    let chapters: Vec<ChapterSummary> = parse(StageKind::PlotOutline, &raw, Shape::PlotOutline)?;
    Ok(StateDelta::PlotOutline(PlotOutline { chapters }))
}

/// Plans the scenes of one chapter. Scenes with no listed characters get the
/// protagonist.
pub async fn chapter_planner(
    chapter: &ChapterSummary,
    character: &CharacterProfile,
    world: &WorldBible,
    llm: &dyn LlmClient,
    options: &GenerationConfig,
) -> Result<StateDelta, StageError> {
    let title = if chapter.title.is_empty() {
        String::new()
    } else {
        format!(" \"{}\"", chapter.title)
    };
    let prompt = format!(
        "Break chapter {}{} of a novel into scenes.\n\n\
        Chapter summary:\n{}\n\n\
        Protagonist:\n{}\n\n\
        World:\n{}\n\n\
        Return a JSON array of three to five scenes in order, each \
        {{\"title\": \"...\", \"goal\": \"what must happen in the scene\", \
        \"characters\": [\"...\"], \"setting\": \"...\"}}.",
        chapter.number,
        title,
        chapter.summary,
        describe_character(character),
        describe_world(world)
    );
    let raw = call(StageKind::ChapterPlanner, llm, JSON_SYSTEM, &prompt, options).await?;
    let mut scenes: Vec<SceneEntry> = parse(StageKind::ChapterPlanner, &raw, Shape::ScenePlan)?;
    for scene in scenes.iter_mut().filter(|s| s.characters.is_empty()) {
        scene.characters.push(character.name.clone());
    }
    Ok(StateDelta::ScenePlan(ScenePlan {
        chapter: chapter.number,
        scenes,
    }))
}

/// Everything the scene generator reads from the state.
pub struct SceneContext<'a> {
    pub scene: &'a SceneEntry,
    pub plan: &'a ScenePlan,
    /// Prose already written for this chapter, in plan order.
    pub prior: &'a [SceneProse],
    pub character: &'a CharacterProfile,
    pub chapter: &'a ChapterSummary,
    pub world: &'a WorldBible,
    /// Extra direction for a scene whose previous attempt was filtered.
    pub guidance: Option<&'a str>,
}

fn scene_prompt(ctx: &SceneContext<'_>) -> String {
    let earlier: Vec<String> = ctx
        .plan
        .scenes
        .iter()
        .filter(|s| s.index < ctx.scene.index)
        .map(|s| format!("Scene {}: {}", s.index, s.goal))
        .collect();

    let mut prompt = format!(
        "Write scene {} of chapter {} of a novel.\n\n\
        Chapter summary:\n{}\n\n\
        World:\n{}\n\n\
        Protagonist:\n{}\n\n\
        Earlier scenes in this chapter:\n{}\n",
        ctx.scene.index,
        ctx.chapter.number,
        ctx.chapter.summary,
        describe_world(ctx.world),
        describe_character(ctx.character),
        bullet_list(&earlier)
    );

    if let Some(previous) = ctx.prior.last() {
        prompt.push_str(&format!(
            "\nThe previous scene ended:\n\"{}\"\n",
            tail_sentences(&previous.text, CONTINUITY_SENTENCES)
        ));
    }

    prompt.push_str(&format!("\nThis scene's goal: {}\n", ctx.scene.goal));
    if !ctx.scene.title.is_empty() {
        prompt.push_str(&format!("Title: {}\n", ctx.scene.title));
    }
    if !ctx.scene.setting.is_empty() {
        prompt.push_str(&format!("Setting: {}\n", ctx.scene.setting));
    }
    if !ctx.scene.characters.is_empty() {
        prompt.push_str(&format!("Characters present: {}\n", ctx.scene.characters.join(", ")));
    }
    if let Some(guidance) = ctx.guidance {
        prompt.push_str(&format!("\nAdditional direction: {}\n", guidance));
    }
    prompt.push_str(
        "\nContinue seamlessly from what came before. Write only the scene's prose, \
        roughly 600 to 1200 words.",
    );
    prompt
}

pub async fn scene_generator(
    ctx: &SceneContext<'_>,
    llm: &dyn LlmClient,
    options: &GenerationConfig,
) -> Result<StateDelta, StageError> {
    let prompt = scene_prompt(ctx);
    let raw = call(StageKind::SceneGenerator, llm, PROSE_SYSTEM, &prompt, options).await?;
    Ok(StateDelta::SceneProse(SceneProse {
        index: ctx.scene.index,
        text: raw.trim().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{GenerationError, NormalizationError};
    use crate::core::state::Location;
    use crate::services::llm::SafetyPolicy;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct ScriptedClient {
        reply: Result<String, String>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedClient {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn chat(
            &self,
            _system: &str,
            user: &str,
            _options: &GenerationConfig,
        ) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(user.to_string());
            self.reply.clone().map_err(|message| GenerationError::Api {
                provider: "Mock",
                message,
            })
        }
    }

    fn options() -> GenerationConfig {
        GenerationConfig {
            temperature: 0.1,
            max_output_tokens: 1024,
            safety_policy: SafetyPolicy::Permissive,
            json_output: true,
        }
    }

    fn concepts() -> ConceptInput {
        ConceptInput {
            world: "a floating city".to_string(),
            character: "a disgraced pilot".to_string(),
            premise: "a heist to steal back her ship".to_string(),
        }
    }

    fn world() -> WorldBible {
        WorldBible {
            tone: "wistful".to_string(),
            rules: vec!["Nothing falls".to_string()],
            locations: vec![Location {
                name: "The Spire".to_string(),
                description: String::new(),
            }],
            history: String::new(),
        }
    }

    fn pilot() -> CharacterProfile {
        CharacterProfile {
            name: "Kira Vane".to_string(),
            traits: vec!["proud".to_string()],
            backstory: String::new(),
            status: String::new(),
            description: String::new(),
            motivation: String::new(),
            fears: vec![],
        }
    }

    fn chapter_one() -> ChapterSummary {
        ChapterSummary {
            number: 1,
            title: "Docking".to_string(),
            summary: "Kira returns to the city.".to_string(),
        }
    }

    #[tokio::test]
    async fn test_world_bible_stage_returns_delta() {
        let llm = ScriptedClient::replying(
            r#"```json
{"overall_tone": "wistful", "core_rules": ["Nothing falls"], "key_locations": [{"name": "The Spire", "description": "Tallest dock"}]}
```"#,
        );
        let delta = world_bible(&concepts(), &llm, &options()).await.unwrap();
        let StateDelta::WorldBible(bible) = delta else {
            panic!("expected a world bible delta");
        };
        assert!(!bible.rules.is_empty());
        assert_eq!(bible.locations[0].name, "The Spire");
        assert!(llm.prompts.lock().unwrap()[0].contains("a floating city"));
    }

    #[tokio::test]
    async fn test_character_stage_works_without_world() {
        let llm = ScriptedClient::replying(r#"{"name": "Kira Vane", "personality_traits": "proud, reckless"}"#);
        let delta = character_bible(&concepts(), None, &llm, &options()).await.unwrap();
        let StateDelta::CharacterProfile(profile) = delta else {
            panic!("expected a character profile delta");
        };
        assert_eq!(profile.traits, vec!["proud", "reckless"]);
        assert!(!llm.prompts.lock().unwrap()[0].contains("lives in this world"));

        let llm = ScriptedClient::replying(r#"{"name": "Kira", "traits": ["proud"]}"#);
        character_bible(&concepts(), Some(&world()), &llm, &options()).await.unwrap();
        assert!(llm.prompts.lock().unwrap()[0].contains("Nothing falls"));
    }

    #[tokio::test]
    async fn test_empty_reply_is_filtered() {
        let llm = ScriptedClient::replying("  \n");
        let err = plot_outline(&concepts(), &world(), &pilot(), &llm, &options())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::Filtered {
                stage: StageKind::PlotOutline
            }
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_is_generation_error() {
        let llm = ScriptedClient {
            reply: Err("quota exceeded".to_string()),
            prompts: Arc::new(Mutex::new(Vec::new())),
        };
        let err = world_bible(&concepts(), &llm, &options()).await.unwrap_err();
        assert!(matches!(err, StageError::Generation { .. }));
        assert_eq!(err.stage(), StageKind::WorldBible);
    }

    #[tokio::test]
    async fn test_schema_failure_names_field() {
        let llm = ScriptedClient::replying(r#"[{"title": "Docking"}]"#);
        let err = plot_outline(&concepts(), &world(), &pilot(), &llm, &options())
            .await
            .unwrap_err();
        match err {
            StageError::Normalization { stage, source } => {
                assert_eq!(stage, StageKind::PlotOutline);
                assert!(matches!(source, NormalizationError::MissingField { .. }));
                assert_eq!(source.field(), Some("summary"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_planner_defaults_characters_and_is_repeatable() {
        let raw = r#"{"scenes": [
            {"scene_goal": "Kira sneaks aboard", "characters_present": ["Kira Vane", "Oren"]},
            {"scene_goal": "The alarm sounds"}
        ]}"#;
        let first = chapter_planner(&chapter_one(), &pilot(), &world(), &ScriptedClient::replying(raw), &options())
            .await
            .unwrap();
        let second = chapter_planner(&chapter_one(), &pilot(), &world(), &ScriptedClient::replying(raw), &options())
            .await
            .unwrap();
        assert_eq!(first, second);

        let StateDelta::ScenePlan(plan) = first else {
            panic!("expected a scene plan delta");
        };
        assert_eq!(plan.chapter, 1);
        assert_eq!(plan.scenes[0].goal, "Kira sneaks aboard");
        assert_eq!(plan.scenes[1].characters, vec!["Kira Vane"]);
        assert_eq!(plan.scenes[1].index, 2);
    }

    #[tokio::test]
    async fn test_scene_prompt_carries_continuity() {
        let plan = ScenePlan {
            chapter: 1,
            scenes: vec![
                SceneEntry {
                    index: 1,
                    goal: "Kira lands".to_string(),
                    title: String::new(),
                    characters: vec!["Kira Vane".to_string()],
                    setting: String::new(),
                },
                SceneEntry {
                    index: 2,
                    goal: "Kira finds the hangar".to_string(),
                    title: "Hangar".to_string(),
                    characters: vec!["Kira Vane".to_string()],
                    setting: "The Spire".to_string(),
                },
            ],
        };
        let prior = vec![SceneProse {
            index: 1,
            text: "First. Second. Third. Fourth.".to_string(),
        }];
        let character = pilot();
        let chapter = chapter_one();
        let world = world();
        let ctx = SceneContext {
            scene: &plan.scenes[1],
            plan: &plan,
            prior: &prior,
            character: &character,
            chapter: &chapter,
            world: &world,
            guidance: Some("keep the violence off-page"),
        };

        let llm = ScriptedClient::replying("  The hangar doors groaned.  ");
        let delta = scene_generator(&ctx, &llm, &options()).await.unwrap();
        assert_eq!(
            delta,
            StateDelta::SceneProse(SceneProse {
                index: 2,
                text: "The hangar doors groaned.".to_string()
            })
        );

        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("Scene 1: Kira lands"));
        assert!(prompt.contains("Second. Third. Fourth."));
        assert!(!prompt.contains("First."));
        assert!(prompt.contains("keep the violence off-page"));
        assert!(prompt.contains("Setting: The Spire"));
    }
}
