use crate::core::config::Config;
use crate::core::state::ConceptInput;
use anyhow::{Context, Result};
use inquire::{required, Text};

/// The three concepts, taken from `story` in config.yml where set and asked
/// for interactively otherwise.
pub fn run_setup(config: &Config) -> Result<ConceptInput> {
    if let Some(concepts) = configured_story(config) {
        println!("Using story concepts from config.yml");
        return Ok(concepts);
    }
    if config.unattended {
        anyhow::bail!("unattended runs need `story.world`, `story.character` and `story.premise` in config.yml");
    }

    let defaults = config.story.clone();
    let ask = |prompt: &str, help: &str, current: Option<&str>| -> Result<String> {
        let mut text = Text::new(prompt)
            .with_help_message(help)
            .with_validator(required!("This field is required"));
        if let Some(current) = current.filter(|c| !c.trim().is_empty()) {
            text = text.with_default(current);
        }
        let answer = text.prompt().with_context(|| format!("Failed to read {}", prompt))?;
        Ok(answer.trim().to_string())
    };

    Ok(ConceptInput {
        world: ask(
            "World concept:",
            "e.g. a floating city held aloft by trade winds",
            defaults.as_ref().map(|s| s.world.as_str()),
        )?,
        character: ask(
            "Protagonist concept:",
            "e.g. a disgraced pilot",
            defaults.as_ref().map(|s| s.character.as_str()),
        )?,
        premise: ask(
            "Story premise:",
            "e.g. a heist to steal back her ship",
            defaults.as_ref().map(|s| s.premise.as_str()),
        )?,
    })
}

fn configured_story(config: &Config) -> Option<ConceptInput> {
    let story = config.story.as_ref()?;
    let complete = [&story.world, &story.character, &story.premise]
        .iter()
        .all(|value| !value.trim().is_empty());
    complete.then(|| ConceptInput {
        world: story.world.trim().to_string(),
        character: story.character.trim().to_string(),
        premise: story.premise.trim().to_string(),
    })
}
