pub mod abi;
pub mod decoder;
pub mod provider;
pub mod source;

pub use abi::{HoneyJar, MoneycombVault};
pub use decoder::decode_log;
pub use provider::create_provider;
pub use source::RpcLogSource;
