use anyhow::Result;
use log::error;
use novel_forge::core::config::Config;
use novel_forge::core::error::PipelineError;
use novel_forge::core::io::{NativeStorage, Storage};
use novel_forge::core::state::PipelinePhase;
use novel_forge::services::llm::create_llm;
use novel_forge::services::pipeline::Pipeline;
use novel_forge::services::setup;
use novel_forge::ui;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load config
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());

    // 2. Resume a saved novel or start a new one
    let resumed = Pipeline::resume(config.clone(), create_llm(&config)?, storage.clone()).await?;
    let mut pipeline = match resumed {
        Some(p) if config.unattended || ui::confirm_resume(p.phase())? => p,
        _ => {
            let concepts = setup::run_setup(&config)?;
            Pipeline::new(config.clone(), create_llm(&config)?, storage, concepts)
        }
    };

    // 3. Foundation
    if pipeline.phase() == PipelinePhase::NotStarted {
        pipeline.run_foundation().await?;
    }
    println!("{}", ui::render_foundation(pipeline.state()));

    // 4. Chapters, one trigger each
    let total = pipeline.state().total_chapters();
    let mut resolving = false;
    while let Some(next) = pipeline.next_chapter() {
        if !resolving && !config.unattended && !ui::confirm_next_chapter(next, total)? {
            println!("Stopping as requested.");
            return Ok(());
        }
        resolving = false;

        match pipeline.advance_chapter().await {
            Ok(_) => println!("{}", ui::render_chapter(pipeline.state())),
            Err(PipelineError::FilteredOutput { chapter, scene }) => {
                if config.unattended {
                    error!("Chapter {} scene {} was filtered; rerun to resolve it", chapter, scene);
                    return Err(PipelineError::FilteredOutput { chapter, scene }.into());
                }
                match ui::choose_resolution(chapter, scene)? {
                    Some(resolution) => {
                        pipeline.resolve_filtered(resolution)?;
                        resolving = true;
                    }
                    None => {
                        println!("Stopping as requested.");
                        return Ok(());
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!("All chapters written!");
    Ok(())
}
