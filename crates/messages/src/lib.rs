//! Wire messages for the dvq consensus protocol.
//!
//! Three layers:
//!
//! - [`consensus`]: the QBFT `Message`/`SignedMessage` pair and the four
//!   type-specific payloads, SSZ-encoded with tree-hash roots for signing.
//! - [`envelope`]: the outer `SsvMessage` envelope carried by the transport.
//! - [`sync`]: JSON request/response bodies for the sync protocols.

mod consensus;
mod envelope;
mod sync;

pub use consensus::{
    aggregate_messages, CodecError, CommitData, Message, MessageType, PrepareData, ProposalData,
    RoundChangeData, SignedMessage,
};
pub use envelope::{SsvMessage, SsvMsgType};
pub use sync::{Status, SyncMessage, SyncParams, SyncProtocol};
