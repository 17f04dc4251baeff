//! Fork rules.
//!
//! A fork version selects the sync protocol set and the decided-storage
//! strategy. Consensus traffic is SSZ at every fork; sync bodies stay JSON
//! for backwards compatibility.

/// Protocol id for the last-decided sync protocol.
pub const LAST_DECIDED_PROTOCOL: &str = "/ssv/sync/decided/last/0.0.1";
/// Protocol id for the decided-history sync protocol.
pub const DECIDED_HISTORY_PROTOCOL: &str = "/ssv/sync/decided/history/0.0.1";
/// Protocol id for the legacy last-change-round protocol.
pub const LAST_CHANGE_ROUND_PROTOCOL: &str = "/ssv/sync/round-change/0.0.1";

/// Known fork versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkVersion {
    /// The launch fork: serves the legacy change-round protocol and every
    /// node stores full decided history.
    Genesis,
    /// Drops the change-round protocol; light nodes keep only the highest
    /// decided certificate.
    V1,
}

impl ForkVersion {
    /// The version tag carried on every envelope.
    pub fn wire(&self) -> u64 {
        match self {
            ForkVersion::Genesis => 0,
            ForkVersion::V1 => 1,
        }
    }

    /// Decode a wire tag; unknown tags belong to forks this build does not
    /// speak.
    pub fn from_wire(v: u64) -> Option<ForkVersion> {
        match v {
            0 => Some(ForkVersion::Genesis),
            1 => Some(ForkVersion::V1),
            _ => None,
        }
    }
}

/// How much decided history a node persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecidedMode {
    /// Highest certificate plus full history.
    Full,
    /// Highest certificate only.
    Light,
}

/// Fork-dependent behavior bundle.
#[derive(Debug, Clone, Copy)]
pub struct Fork {
    version: ForkVersion,
}

impl Fork {
    pub fn new(version: ForkVersion) -> Fork {
        Fork { version }
    }

    pub fn version(&self) -> ForkVersion {
        self.version
    }

    /// The envelope tag this fork stamps and accepts.
    pub fn wire_version(&self) -> u64 {
        self.version.wire()
    }

    pub fn last_decided_protocol(&self) -> &'static str {
        LAST_DECIDED_PROTOCOL
    }

    pub fn decided_history_protocol(&self) -> &'static str {
        DECIDED_HISTORY_PROTOCOL
    }

    /// The legacy protocol exists only at genesis.
    pub fn last_change_round_protocol(&self) -> Option<&'static str> {
        match self.version {
            ForkVersion::Genesis => Some(LAST_CHANGE_ROUND_PROTOCOL),
            ForkVersion::V1 => None,
        }
    }

    /// Peer fan-out for sync requests.
    pub fn peers_for_sync(&self) -> usize {
        10
    }

    /// Storage strategy, honoring the node's full-node flag after genesis.
    pub fn decided_mode(&self, full_node: bool) -> DecidedMode {
        match self.version {
            ForkVersion::Genesis => DecidedMode::Full,
            ForkVersion::V1 => {
                if full_node {
                    DecidedMode::Full
                } else {
                    DecidedMode::Light
                }
            }
        }
    }
}
