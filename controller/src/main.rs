mod host;
mod relays;
mod service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
