#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chat_context_server::app::run().await
}
