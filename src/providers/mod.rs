use alloy_provider::{ProviderBuilder, RootProvider};
use alloy_transport::BoxTransport;
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::info;

pub type HttpProvider = RootProvider<BoxTransport>;

/// Read-only HTTP provider for the configured RPC endpoint.
pub fn create_http_provider(rpc_url: &str) -> Result<Arc<HttpProvider>> {
    let url = url::Url::parse(rpc_url).wrap_err_with(|| format!("Invalid RPC URL {}", redact_rpc_url(rpc_url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(eyre::eyre!("RPC URL must be http(s), got {}", url.scheme()));
    }

    info!("🔌 HTTP provider connected to: {}", redact_rpc_url(rpc_url));
    let provider = ProviderBuilder::new().on_http(url).boxed();
    Ok(Arc::new(provider))
}

/// RPC URL safe for logs: hosted endpoints often carry the API key as the
/// last path segment or as a query parameter.
pub fn redact_rpc_url(rpc_url: &str) -> String {
    let Ok(mut url) = url::Url::parse(rpc_url) else {
        return "<unparseable url>".to_string();
    };
    url.set_query(None);

    let segments: Vec<String> = url
        .path_segments()
        .map(|s| s.map(str::to_string).collect())
        .unwrap_or_default();
    if let Some(last) = segments.last() {
        if last.len() > 20 {
            let mut kept: Vec<String> = segments[..segments.len() - 1].to_vec();
            kept.push("***".to_string());
            url.set_path(&format!("/{}", kept.join("/")));
        }
    }
    url.to_string()
}
