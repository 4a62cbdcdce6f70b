#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tlspulse::cli::start().await
}
