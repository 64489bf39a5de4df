use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use testnet_genesis::{
    activity::{ActivityCalculator, ScoringWeights},
    chain_reader::{
        BlockNumber, ChainBlock, ChainLog, ChainReader, ChainReaderError, ChainTransaction,
        TransactionReceipt,
    },
    genesis::{
        export_genesis_json, generate_genesis, genesis_proofs, load_genesis_json,
        validate_genesis, verify_genesis_proof, BaselineAllocation, GenesisConfig, TierThresholds,
    },
    indexer::{IndexStore, Indexer, IndexerConfig, KnownContracts},
    snapshot::{SnapshotBuilder, SnapshotError, SnapshotStatus},
    store::MemoryStore,
    units::{Address, TokenAmount},
};

const CHAIN_LENGTH: BlockNumber = 24;
const SNAPSHOT_POOL: u128 = 1_000_000;
const TOTAL_SUPPLY: u128 = 1_500_000;

fn address(last_byte: u8) -> Address {
    format!("0x{:040x}", last_byte).parse().unwrap()
}

fn block_hash(number: BlockNumber) -> String {
    format!("0x{:064x}", 0x1000 + number)
}

/// Four senders paying one receiver, sender n sends in every block where height % n == 0.
fn chain_block(number: BlockNumber) -> ChainBlock {
    let transactions = (1..=4u8)
        .filter(|sender| number % i64::from(*sender) == 0)
        .enumerate()
        .map(|(index, sender)| ChainTransaction {
            hash: format!("0x{:060x}{:04x}", number, index),
            transaction_index: index as u64,
            from: address(sender),
            to: Some(address(0x10)),
            value: TokenAmount(1_000),
        })
        .collect();

    ChainBlock {
        hash: block_hash(number),
        number,
        parent_hash: if number == 0 {
            format!("0x{:064x}", 0)
        } else {
            block_hash(number - 1)
        },
        timestamp: Utc.timestamp_opt(1_700_000_000 + number * 12, 0).unwrap(),
        transactions,
    }
}

struct Testnet {
    blocks: Vec<ChainBlock>,
}

#[async_trait]
impl ChainReader for Testnet {
    async fn get_block_by_number(
        &self,
        block_number: BlockNumber,
    ) -> Result<Option<ChainBlock>, ChainReaderError> {
        Ok(usize::try_from(block_number)
            .ok()
            .and_then(|index| self.blocks.get(index))
            .cloned())
    }

    async fn get_transaction_receipts(
        &self,
        block: &ChainBlock,
    ) -> Result<Vec<TransactionReceipt>, ChainReaderError> {
        Ok(block
            .transactions
            .iter()
            .map(|transaction| TransactionReceipt {
                transaction_hash: transaction.hash.clone(),
                status: Some("0x1".to_string()),
                block_hash: Some(block.hash.clone()),
            })
            .collect())
    }

    async fn get_logs(&self, _block: &ChainBlock) -> Result<Vec<ChainLog>, ChainReaderError> {
        Ok(vec![])
    }
}

async fn index_testnet(store: Arc<MemoryStore>) {
    let indexer = Arc::new(Indexer::new(
        Arc::new(Testnet {
            blocks: (0..CHAIN_LENGTH).map(chain_block).collect(),
        }),
        store.clone(),
        IndexerConfig {
            start_block: 0,
            fetch_concurrency: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            known_contracts: KnownContracts::default(),
        },
    ));

    let task = tokio::spawn({
        let indexer = indexer.clone();
        async move { indexer.start(None).await }
    });

    tokio::time::timeout(Duration::from_secs(10), async {
        while store.last_indexed_block().await.unwrap() != Some(CHAIN_LENGTH - 1) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    indexer.stop();
    task.await.unwrap().unwrap();
}

fn genesis_config() -> GenesisConfig {
    GenesisConfig {
        chain_id: 4242,
        network: "pipeline".to_string(),
        total_supply: TokenAmount(TOTAL_SUPPLY),
        max_allocation_per_address: None,
        baseline_allocations: vec![BaselineAllocation {
            address: address(0xf0),
            amount: TokenAmount(TOTAL_SUPPLY - SNAPSHOT_POOL),
            label: Some("treasury".to_string()),
        }],
        unallocated_recipient: None,
        gas_limit: 30_000_000,
        timestamp: 1_700_000_000,
        clique: None,
        decimals: 18,
        tiers: TierThresholds::default(),
        system_contracts: vec![],
    }
}

#[tokio::test]
async fn index_to_genesis_test() {
    let store = Arc::new(MemoryStore::new());
    index_testnet(store.clone()).await;

    let calculator = ActivityCalculator::new(
        store.clone(),
        ScoringWeights::V1,
        0,
        TokenAmount(SNAPSHOT_POOL),
    );
    let scored = calculator.score_all().await.unwrap();
    assert_eq!(scored.as_of_block, CHAIN_LENGTH - 1);
    assert_eq!(scored.processed, 5);

    let builder = SnapshotBuilder::new(store.clone(), 0, TokenAmount(SNAPSHOT_POOL));
    let draft = builder
        .generate_snapshot(Some(CHAIN_LENGTH - 1))
        .await
        .unwrap();
    assert_eq!(draft.status, SnapshotStatus::Draft);
    assert_eq!(draft.total_allocated, TokenAmount(SNAPSHOT_POOL));
    draft.verify_integrity().unwrap();

    // Drafts never make it into a genesis.
    assert!(generate_genesis(&draft, &genesis_config()).is_err());

    let snapshot = builder.finalize_snapshot(&draft.id).await.unwrap();
    assert!(matches!(
        builder.finalize_snapshot(&draft.id).await,
        Err(SnapshotError::AlreadyFinalized(_))
    ));

    // Address 1 sends in every block, address 4 in every fourth.
    let amount_of = |target: &Address| {
        snapshot
            .leaves
            .iter()
            .find(|leaf| &leaf.address == target)
            .map(|leaf| leaf.amount)
            .unwrap()
    };
    assert!(amount_of(&address(1)) > amount_of(&address(4)));

    let snapshot_proof = builder
        .proof(&snapshot.id, &address(2))
        .await
        .unwrap()
        .unwrap();
    assert!(
        builder
            .verify_proof(
                &snapshot.id,
                &address(2),
                snapshot_proof.leaf.amount,
                &snapshot_proof.proof,
            )
            .await
    );

    let generated = generate_genesis(&snapshot, &genesis_config()).unwrap();
    let genesis = generated.genesis;
    validate_genesis(&genesis).unwrap();
    assert_eq!(generated.allocations.total_allocated, TokenAmount(TOTAL_SUPPLY));
    assert_eq!(genesis.commitment.snapshot_id, snapshot.id);
    assert_eq!(genesis.commitment.snapshot_merkle_root, snapshot.merkle_root);
    assert_eq!(genesis.commitment.allocation_count, 6);

    let again = generate_genesis(&snapshot, &genesis_config()).unwrap();
    assert_eq!(again.genesis, genesis);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("genesis.json");
    export_genesis_json(&genesis, &path).unwrap();
    let loaded = load_genesis_json(&path).unwrap();
    assert_eq!(loaded, genesis);

    let proofs = genesis_proofs(&loaded).unwrap();
    assert_eq!(proofs.proofs.len(), 6);
    for (holder, entry) in &proofs.proofs {
        assert!(verify_genesis_proof(&loaded, &proofs, holder, entry.amount));
        assert!(!verify_genesis_proof(
            &loaded,
            &proofs,
            holder,
            TokenAmount(entry.amount.0 + 1)
        ));
    }
}
