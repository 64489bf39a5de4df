use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info};

use testnet_genesis::{
    genesis::{
        export_genesis_allocations_csv, export_genesis_json, format_allocation, generate_genesis,
        genesis_metadata, genesis_proofs, load_genesis_json, validate_genesis,
        verify_genesis_proof, AllocationError, GenesisConfig, GenesisError, GenesisProofs,
    },
    log,
    snapshot::{Snapshot, SnapshotError},
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
    /// Generate a genesis file from a finalized snapshot.
    Generate {
        /// Snapshot JSON as written by `snapshot-cli export`.
        #[clap(long)]
        snapshot: PathBuf,
        /// Genesis config JSON.
        #[clap(long)]
        config: PathBuf,
        /// Output file path (e.g., ./genesis.json). Proofs and metadata go next to it as
        /// <name>-proofs.json and <name>-metadata.json.
        #[clap(long)]
        output: PathBuf,
    },
    /// Check a genesis file and list every violation found.
    Validate { genesis: PathBuf },
    /// Export the allocation table of a genesis file to CSV.
    Export {
        genesis: PathBuf,
        /// Output file path (e.g., ./allocations.csv).
        #[clap(long)]
        output: PathBuf,
        /// Snapshot the genesis was built from, adds scores to the table.
        #[clap(long)]
        snapshot: Option<PathBuf>,
    },
    /// Check an address's allocation against the genesis commitment.
    VerifyProof {
        #[clap(long)]
        genesis: PathBuf,
        #[clap(long)]
        proofs: PathBuf,
        #[clap(long)]
        address: Address,
        /// Amount in base units.
        #[clap(long)]
        amount: TokenAmount,
    },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, GenesisError> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), GenesisError> {
    fs::write(path, serde_json::to_string_pretty(value)? + "\n")?;
    Ok(())
}

/// `out/genesis.json` with suffix `proofs` becomes `out/genesis-proofs.json`.
fn sibling_path(output: &Path, suffix: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "genesis".to_string());
    output.with_file_name(format!("{stem}-{suffix}.json"))
}

/// 1 invalid genesis, 3 file failure, 4 snapshot or allocation failure.
fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(genesis_error) = error.downcast_ref::<GenesisError>() {
        return match genesis_error {
            GenesisError::Invalid(_) => 1,
            GenesisError::Allocation(AllocationError::Snapshot(SnapshotError::Store(_))) => 3,
            GenesisError::Allocation(_) | GenesisError::Merkle(_) => 4,
            GenesisError::Io(_) | GenesisError::Json(_) | GenesisError::Csv(_) => 3,
        };
    }

    if error.downcast_ref::<SnapshotError>().is_some() {
        return 4;
    }

    3
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Generate {
            snapshot,
            config,
            output,
        } => {
            let snapshot: Snapshot = read_json(&snapshot)?;
            let config: GenesisConfig = read_json(&config)?;

            let generated = generate_genesis(&snapshot, &config)?;
            export_genesis_json(&generated.genesis, &output)?;

            let proofs = genesis_proofs(&generated.genesis)?;
            let proofs_output = sibling_path(&output, "proofs");
            write_json(&proofs_output, &proofs)?;
            info!(path = %proofs_output.display(), "wrote genesis proofs");

            let metadata = genesis_metadata(&snapshot, &config, &generated, Utc::now());
            let metadata_output = sibling_path(&output, "metadata");
            write_json(&metadata_output, &metadata)?;
            info!(path = %metadata_output.display(), "wrote genesis metadata");

            let allocations = &generated.allocations;
            let statistics = &allocations.statistics;
            println!("network:         {}", config.network);
            println!("chain id:        {}", config.chain_id);
            println!("snapshot:        {}", snapshot.id);
            println!("allocations:     {}", statistics.count);
            println!(
                "total allocated: {}",
                format_allocation(allocations.total_allocated, config.decimals)
            );
            println!(
                "airdrop pool:    {}",
                format_allocation(allocations.airdrop_pool, config.decimals)
            );
            println!(
                "unallocated:     {}",
                format_allocation(allocations.unallocated, config.decimals)
            );
            println!(
                "min / median / max: {} / {} / {}",
                format_allocation(statistics.min, config.decimals),
                format_allocation(statistics.median, config.decimals),
                format_allocation(statistics.max, config.decimals)
            );
            let tiers = &statistics.tier_counts;
            println!(
                "tiers:           bronze {} / silver {} / gold {} / platinum {}",
                tiers.bronze, tiers.silver, tiers.gold, tiers.platinum
            );
            println!("system contracts: {}", config.system_contracts.len());
            println!("merkle root:     {}", generated.genesis.commitment.merkle_root);
        }
        Commands::Validate { genesis } => {
            let genesis = load_genesis_json(&genesis)?;
            match validate_genesis(&genesis) {
                Ok(()) => println!("genesis is valid"),
                Err(GenesisError::Invalid(violations)) => {
                    for violation in &violations {
                        println!("invalid: {violation}");
                    }
                    return Ok(ExitCode::from(1));
                }
                Err(error) => return Err(error.into()),
            }
        }
        Commands::Export {
            genesis,
            output,
            snapshot,
        } => {
            let genesis = load_genesis_json(&genesis)?;
            let snapshot = snapshot
                .map(|path| read_json::<Snapshot>(&path))
                .transpose()?;
            export_genesis_allocations_csv(&genesis, snapshot.as_ref(), &output)?;
            info!(path = %output.display(), "exported genesis allocations");
        }
        Commands::VerifyProof {
            genesis,
            proofs,
            address,
            amount,
        } => {
            let genesis = load_genesis_json(&genesis)?;
            let proofs: GenesisProofs = read_json(&proofs)?;
            if !verify_genesis_proof(&genesis, &proofs, &address, amount) {
                println!("proof for {address} is invalid");
                return Ok(ExitCode::from(1));
            }
            println!("proof for {address} is valid");
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    log::init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            error!(%error, "genesis-cli failed");
            eprintln!("error: {error:#}");
            ExitCode::from(exit_code(&error))
        }
    }
}
