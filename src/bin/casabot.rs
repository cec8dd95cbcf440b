#[tokio::main]
async fn main() -> anyhow::Result<()> {
    casabot_server::run().await
}
