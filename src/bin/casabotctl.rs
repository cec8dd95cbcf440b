#[tokio::main]
async fn main() -> anyhow::Result<()> {
    casabotctl::run().await
}
