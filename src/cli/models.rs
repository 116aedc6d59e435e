use anyhow::Result;

use super::render;
use crate::backend::{ChatBackend, HttpBackend};
use crate::compare::Catalog;
use crate::core::AppConfig;

pub async fn run(config: &AppConfig) -> Result<()> {
    let backend = HttpBackend::new(&config.api_url)?;
    let catalog = Catalog::new(backend.models().await?);
    if catalog.is_empty() {
        println!("No models available at {}", backend.base_url());
        return Ok(());
    }
    print!("{}", render::catalog(&catalog));
    Ok(())
}
