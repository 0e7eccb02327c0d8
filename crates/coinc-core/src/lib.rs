pub mod buffer;
pub mod coordinator;
pub mod correlator;
pub mod counter;
pub mod offsets;
pub mod peer;
pub mod protocol;
pub mod records;
pub mod secure;
pub mod session;
pub mod stats;
pub mod tail;
pub mod transfer;

pub use buffer::TimestampBuffer;
pub use coordinator::{Coordinator, CoordinatorConfig, PairTickEntry, TickReport};
pub use correlator::{
    estimate_offset, Confidence, CorrelateError, CorrelationParams, OffsetEstimate,
};
pub use counter::{count_coincidences, CorrelationPair, Endpoint, PairCount};
pub use offsets::OffsetTable;
pub use peer::{PeerConfig, PeerConnection, PeerMode};
pub use records::{read_timestamp_file, FileInfo};
pub use session::{Acquisition, FileTagger, Session, Tagger};
pub use tail::TailWorker;
pub use transfer::FileTransferManager;
