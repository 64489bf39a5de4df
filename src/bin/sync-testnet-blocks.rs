use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use testnet_genesis::{
    chain_reader::{BlockNumber, ChainReaderHttp},
    db,
    env::ENV_CONFIG,
    indexer::{Indexer, IndexerConfig},
    log,
    store::PostgresStore,
};

/// Indexes the testnet into the canonical store until interrupted with Ctrl-C.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Block to start at. Only accepted when it is the block indexing would resume at anyway, or
    /// when nothing has been indexed yet.
    #[clap(long)]
    from: Option<BlockNumber>,
}

#[tokio::main]
async fn main() -> Result<()> {
    log::init();

    let cli = Cli::parse();

    let db_pool = db::get_db_pool("sync-testnet-blocks", 4)
        .await
        .context("connecting to the canonical store")?;
    sqlx::migrate!().run(&db_pool).await?;

    let rpc_url = ENV_CONFIG
        .rpc_url
        .as_deref()
        .context("RPC_URL is required to sync blocks")?;
    let config = IndexerConfig::from_env(&ENV_CONFIG)?;

    let indexer = Arc::new(Indexer::new(
        Arc::new(ChainReaderHttp::new(rpc_url)),
        Arc::new(PostgresStore::new(db_pool)),
        config,
    ));

    let stop_handle = indexer.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, stopping after the current block");
            stop_handle.stop();
        }
    });

    indexer.start(cli.from).await?;

    let stats = indexer.stats().await?;
    info!(
        blocks_indexed = stats.blocks_indexed,
        last_indexed_block = ?stats.last_indexed_block,
        "done syncing testnet blocks"
    );

    Ok(())
}
