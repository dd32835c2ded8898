// Restarting a node against its own data directory

use std::path::PathBuf;
use utxo_node::consensus::ConsensusParams;
use utxo_node::node::{BlockId, Node, NodeConfig};
use utxo_node::wallet::{KeyPair, TransactionBuilder};

fn config(data_dir: PathBuf) -> NodeConfig {
    NodeConfig {
        data_dir,
        params: ConsensusParams {
            initial_difficulty: 8,
            ..ConsensusParams::default()
        },
        ..NodeConfig::default()
    }
}

#[tokio::test]
async fn test_restart_reproduces_state() {
    let data_dir = std::env::temp_dir().join(format!("utxo-node-test-{}", rand::random::<u64>()));
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();

    let (blocks, alice_balance, bob_balance, txid) = {
        let node = Node::open(config(data_dir.clone())).unwrap();
        node.mine(alice.address()).await.unwrap();

        let unspent = node.unspent_outputs(&alice.address()).await;
        let tx = TransactionBuilder::new(&alice)
            .build(&unspent, bob.address(), 2_500)
            .unwrap();
        let txid = node.submit_transaction(tx).await.unwrap();
        node.mine(alice.address()).await.unwrap();

        (
            node.blocks().await,
            node.balance(&alice.address()).await,
            node.balance(&bob.address()).await,
            txid,
        )
    };

    let node = Node::open(config(data_dir.clone())).unwrap();
    assert_eq!(node.blocks().await, blocks);
    assert_eq!(node.balance(&alice.address()).await, alice_balance);
    assert_eq!(node.balance(&bob.address()).await, bob_balance);
    assert_eq!(node.confirmations(&txid).await, Some(1));
    for block in &blocks {
        assert_eq!(&node.block(BlockId::Index(block.header.index)).await.unwrap(), block);
        assert_eq!(&node.block(BlockId::Hash(block.hash)).await.unwrap(), block);
    }

    drop(node);
    let _ = std::fs::remove_dir_all(&data_dir);
}
