use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    flame_archivist::run().await
}
