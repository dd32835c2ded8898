// Node configuration

use crate::consensus::ConsensusParams;
use crate::consensus::pow::DEFAULT_POLL_INTERVAL;
use crate::core::Address;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings of a node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the block and UTXO databases
    pub data_dir: PathBuf,
    /// Address to accept peers on, `host:port`. Port 0 picks a free port.
    pub listen: Option<String>,
    /// Peers to sync with from startup
    pub peers: Vec<String>,
    /// Mine continuously, paying rewards here
    pub mine_to: Option<Address>,
    pub sync_interval: Duration,
    /// Bound on every network read, write and connect
    pub request_timeout: Duration,
    /// Nonce attempts between checks for a moved tip
    pub poll_interval: u64,
    pub params: ConsensusParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            listen: None,
            peers: Vec::new(),
            mine_to: None,
            sync_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            poll_interval: DEFAULT_POLL_INTERVAL,
            params: ConsensusParams::default(),
        }
    }
}
