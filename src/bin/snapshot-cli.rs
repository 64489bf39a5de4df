use std::{fs, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use testnet_genesis::{
    activity::{ActivityCalculator, ActivityError, ScoringWeights},
    chain_reader::BlockNumber,
    db,
    env::ENV_CONFIG,
    indexer::{IndexStore, RankingMetric},
    log,
    snapshot::{SnapshotBuilder, SnapshotError, SnapshotProof},
    store::{PostgresStore, StoreError},
    units::{Address, TokenAmount},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recompute the activity score of every indexed address.
    ScoreAll,
    /// List addresses whose stored score meets the threshold.
    Eligible {
        /// Defaults to ELIGIBILITY_THRESHOLD.
        #[clap(long)]
        threshold: Option<u64>,
    },
    /// Show indexer and airdrop statistics.
    Stats,
    /// Rank indexed addresses by one metric.
    TopAddresses {
        #[clap(long, default_value_t = 10)]
        limit: usize,
        #[clap(long, value_enum, default_value_t = RankingMetric::TransactionCount)]
        metric: RankingMetric,
    },
    /// Generate a draft snapshot from the stored scores.
    Generate {
        /// Block the scores must have been computed at.
        #[clap(long)]
        block: Option<BlockNumber>,
    },
    /// Finalize a draft snapshot.
    Finalize { id: String },
    /// List snapshots, newest first.
    List,
    /// Show one snapshot, including its leaves.
    Show { id: String },
    /// Write a snapshot as JSON, the input genesis-cli expects.
    Export {
        #[clap(long)]
        id: String,
        /// Output file path (e.g., ./snapshot.json).
        #[clap(long)]
        output: PathBuf,
    },
    /// Print the Merkle proof for an address in a snapshot.
    Proof {
        #[clap(long)]
        id: String,
        #[clap(long)]
        address: Address,
    },
    /// Check a proof file written by `proof` against its snapshot.
    VerifyProof {
        #[clap(long)]
        proof: PathBuf,
    },
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 1 invalid proof, 3 store or file failure, 4 snapshot state failure.
fn exit_code(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<StoreError>().is_some() {
        return 3;
    }

    if let Some(snapshot_error) = error.downcast_ref::<SnapshotError>() {
        return match snapshot_error {
            SnapshotError::Store(_) => 3,
            _ => 4,
        };
    }

    if let Some(activity_error) = error.downcast_ref::<ActivityError>() {
        return match activity_error {
            ActivityError::Store(_) => 3,
            _ => 4,
        };
    }

    3
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let db_pool = db::get_db_pool("snapshot-cli", 2)
        .await
        .context("connecting to the canonical store")?;
    sqlx::migrate!().run(&db_pool).await?;

    let store = Arc::new(PostgresStore::new(db_pool));
    let snapshot_pool = TokenAmount(ENV_CONFIG.snapshot_pool);
    let calculator = ActivityCalculator::new(
        store.clone(),
        ScoringWeights::V1,
        ENV_CONFIG.eligibility_threshold,
        snapshot_pool,
    );
    let builder = SnapshotBuilder::new(
        store.clone(),
        ENV_CONFIG.eligibility_threshold,
        snapshot_pool,
    );

    match cli.command {
        Commands::ScoreAll => {
            let result = calculator.score_all().await?;
            info!(
                processed = result.processed,
                eligible = result.eligible,
                as_of_block = result.as_of_block,
                "scored all addresses"
            );
            print_json(&result)?;
        }
        Commands::Eligible { threshold } => {
            let threshold = threshold.unwrap_or(calculator.eligibility_threshold());
            let eligible = calculator.eligible_addresses(threshold).await?;
            print_json(&eligible)?;
        }
        Commands::Stats => {
            let indexer = store.stats().await?;
            let airdrop = calculator.airdrop_stats().await?;
            print_json(&serde_json::json!({
                "indexer": indexer,
                "airdrop": airdrop,
            }))?;
        }
        Commands::TopAddresses { limit, metric } => {
            let as_of = store
                .last_indexed_block()
                .await?
                .unwrap_or(0);
            let top = store.top_addresses(limit, metric).await?;
            for (rank, record) in top.iter().enumerate() {
                println!(
                    "{:>4} {} {}",
                    rank + 1,
                    record.address,
                    metric.value(record, as_of)
                );
            }
        }
        Commands::Generate { block } => {
            let snapshot = builder.generate_snapshot(block).await?;
            println!(
                "generated draft snapshot {} at block {}, {} eligible, root {}",
                snapshot.id, snapshot.block_height, snapshot.eligible_count, snapshot.merkle_root
            );
        }
        Commands::Finalize { id } => {
            let snapshot = builder.finalize_snapshot(&id).await?;
            println!(
                "finalized snapshot {}, root {}",
                snapshot.id, snapshot.merkle_root
            );
        }
        Commands::List => {
            for snapshot in builder.get_all_snapshots().await? {
                println!(
                    "{} {} block={} eligible={} root={}",
                    snapshot.id,
                    snapshot.status,
                    snapshot.block_height,
                    snapshot.eligible_count,
                    snapshot.merkle_root
                );
            }
        }
        Commands::Show { id } => {
            let snapshot = builder
                .get_snapshot(&id)
                .await?
                .ok_or(SnapshotError::NotFound(id))?;
            print_json(&snapshot)?;
        }
        Commands::Export { id, output } => {
            let snapshot = builder
                .get_snapshot(&id)
                .await?
                .ok_or(SnapshotError::NotFound(id))?;
            let json = serde_json::to_string_pretty(&snapshot)?;
            fs::write(&output, json + "\n")
                .with_context(|| format!("writing {}", output.display()))?;
            info!(id = %snapshot.id, path = %output.display(), "exported snapshot");
        }
        Commands::Proof { id, address } => match builder.proof(&id, &address).await? {
            Some(proof) => print_json(&proof)?,
            None => {
                println!("{address} is not in snapshot {id}");
                return Ok(ExitCode::from(1));
            }
        },
        Commands::VerifyProof { proof } => {
            let json = fs::read_to_string(&proof)
                .with_context(|| format!("reading {}", proof.display()))?;
            let proof: SnapshotProof = serde_json::from_str(&json)?;
            let valid = builder
                .verify_proof(
                    &proof.snapshot_id,
                    &proof.leaf.address,
                    proof.leaf.amount,
                    &proof.proof,
                )
                .await;
            if !valid {
                println!("proof is invalid");
                return Ok(ExitCode::from(1));
            }
            println!("proof is valid");
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    log::init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            error!(%error, "snapshot-cli failed");
            eprintln!("error: {error:#}");
            ExitCode::from(exit_code(&error))
        }
    }
}
