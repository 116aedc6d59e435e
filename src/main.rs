use anyhow::Result;
use modelduel::cli;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}
