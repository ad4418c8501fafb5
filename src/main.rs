#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sentinelle::init_logging();
    tracing::debug!(target: "sentinelle", "server booted");
    sentinelle::run().await
}
