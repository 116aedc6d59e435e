use std::sync::Arc;

use anyhow::Result;

use super::render;
use crate::backend::HttpBackend;
use crate::compare::Comparison;
use crate::core::AppConfig;

/// Open a session per model (or the default one), send `prompt` to
/// all of them and print every pane once they are done.
pub async fn run(
    config: &AppConfig,
    models: &[String],
    image: Option<&str>,
    prompt: &str,
) -> Result<()> {
    let backend = Arc::new(HttpBackend::new(&config.api_url)?);
    let comparison = Comparison::new(backend, config.dispatch_config(), config.max_sessions);
    comparison
        .sessions()
        .set_system_prompt(config.system_prompt.clone());

    if models.is_empty() {
        comparison.bootstrap().await?;
    } else {
        comparison.sessions().refresh_catalog().await?;
        let report = comparison.sessions().reselect(models).await?;
        for (session_id, e) in &report.errors {
            eprintln!("Session {} may not be ready: {}", session_id, e);
        }
    }

    let image = image.map(render::load_image).transpose()?;
    let report = render::submit(&comparison, prompt, image.as_deref()).await?;

    println!("{}", render::panes(&comparison.snapshot()));
    eprint!("{}", render::report(&report));
    Ok(())
}
