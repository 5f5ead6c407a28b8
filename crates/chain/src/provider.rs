use alloy::providers::{DynProvider, Provider, ProviderBuilder};

/// Type-erased HTTP provider; one per chain.
pub type ChainProvider = DynProvider;

/// Create an HTTP provider from an RPC URL string.
pub fn create_provider(rpc_url: &str) -> eyre::Result<ChainProvider> {
    let url = rpc_url.parse()?;
    let provider = ProviderBuilder::new().connect_http(url).erased();
    Ok(provider)
}
