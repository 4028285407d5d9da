//! Terminal front end: summaries of what has been generated and the prompts
//! that drive the pipeline between chapters.

use crate::core::state::{PipelinePhase, PipelineState};
use crate::services::pipeline::SceneResolution;
use crate::utils::text::{sentences, truncate_chars};
use anyhow::Result;
use inquire::{Confirm, Select, Text};
use std::fmt;

const PREVIEW_CHARS: usize = 160;

pub fn render_foundation(state: &PipelineState) -> String {
    let mut out = String::new();

    if let Some(world) = &state.world_bible {
        out.push_str("== World ==\n");
        if !world.tone.is_empty() {
            out.push_str(&format!("Tone: {}\n", world.tone));
        }
        for rule in &world.rules {
            out.push_str(&format!("  * {}\n", rule));
        }
        let places: Vec<&str> = world.locations.iter().map(|l| l.name.as_str()).collect();
        out.push_str(&format!("Locations: {}\n", places.join(", ")));
    }

    if let Some(character) = &state.character {
        out.push_str(&format!(
            "\n== Protagonist ==\n{} ({})\n",
            character.name,
            character.traits.join(", ")
        ));
        if !character.motivation.is_empty() {
            out.push_str(&format!("Wants: {}\n", character.motivation));
        }
    }

    if let Some(outline) = &state.outline {
        out.push_str("\n== Outline ==\n");
        for chapter in &outline.chapters {
            let heading = if chapter.title.is_empty() {
                format!("Chapter {}", chapter.number)
            } else {
                format!("Chapter {}: {}", chapter.number, chapter.title)
            };
            out.push_str(&format!(
                "{}\n    {}\n",
                heading,
                truncate_chars(&chapter.summary, PREVIEW_CHARS)
            ));
        }
    }
    out
}

/// Scene goals with the opening line of each written scene.
pub fn render_chapter(state: &PipelineState) -> String {
    let Some(work) = &state.chapter else {
        return String::new();
    };
    let mut out = format!("== Chapter {} ==\n", work.number);
    let Some(plan) = &work.plan else {
        return out;
    };

    for scene in &plan.scenes {
        out.push_str(&format!("[{}] {}\n", scene.index, scene.goal));
        match work.prose.iter().find(|p| p.index == scene.index) {
            Some(prose) => {
                let opening = sentences(&prose.text).into_iter().next().unwrap_or_default();
                out.push_str(&format!("    {}\n", truncate_chars(&opening, PREVIEW_CHARS)));
            }
            None if work.skipped.contains(&scene.index) => out.push_str("    (skipped)\n"),
            None => out.push_str("    (not written)\n"),
        }
    }
    if let Some(character) = &state.character {
        if !character.status.is_empty() {
            out.push_str(&format!("\n{}\n", truncate_chars(&character.status, PREVIEW_CHARS * 2)));
        }
    }
    out
}

pub fn confirm_resume(phase: PipelinePhase) -> Result<bool> {
    Ok(Confirm::new(&format!("Found a saved novel ({}). Resume it?", phase))
        .with_default(true)
        .prompt()?)
}

pub fn confirm_next_chapter(next: u32, total: u32) -> Result<bool> {
    Ok(Confirm::new("Continue to next chapter?")
        .with_help_message(&format!("chapter {} of {}", next, total))
        .with_default(true)
        .prompt()?)
}

enum FilteredChoice {
    Retry,
    Rephrase,
    Skip,
    Stop,
}

impl fmt::Display for FilteredChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FilteredChoice::Retry => "Retry the scene",
            FilteredChoice::Rephrase => "Retry with extra direction",
            FilteredChoice::Skip => "Skip the scene",
            FilteredChoice::Stop => "Stop for now",
        };
        f.write_str(label)
    }
}

/// Asks how to handle a filtered scene. `None` means stop.
pub fn choose_resolution(chapter: u32, scene: u32) -> Result<Option<SceneResolution>> {
    let options = vec![
        FilteredChoice::Retry,
        FilteredChoice::Rephrase,
        FilteredChoice::Skip,
        FilteredChoice::Stop,
    ];
    let prompt = format!(
        "Chapter {}, scene {} was blocked by the content filter. What now?",
        chapter, scene
    );
    let choice = Select::new(&prompt, options).prompt()?;

    Ok(match choice {
        FilteredChoice::Retry => Some(SceneResolution::Retry),
        FilteredChoice::Rephrase => {
            let guidance = Text::new("Direction for the next attempt:")
                .with_help_message("e.g. keep the violence off-page")
                .prompt()?;
            Some(SceneResolution::Rephrase(guidance))
        }
        FilteredChoice::Skip => Some(SceneResolution::Skip),
        FilteredChoice::Stop => None,
    })
}
