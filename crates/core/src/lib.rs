pub mod config;
pub mod error;
pub mod source;
pub mod telemetry;
pub mod types;

pub use config::{
    BucketChains, CapabilityTable, ChainConfig, CollectionBinding, CollectionConfig, ContractBinding,
    ContractConfig, ContractKind, Settings, StoreKind, SupplyPolicy,
};
pub use error::{ConfigError, SourceError};
pub use source::LogSource;
pub use types::{
    BlockHeader, ChainId, DecodedEvent, EventArgs, EventKey, EventType, StreamId, ZERO_ADDRESS,
    normalize_address,
};
