//! lantern - run a Lantern peer node.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    lantern_cli::run().await
}
