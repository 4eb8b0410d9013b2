#[tokio::main]
async fn main() -> anyhow::Result<()> {
  rookery::run().await
}
