use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("proxy url {url:?} could not be parsed")]
    ProxyParse { url: String },

    #[error("proxy scheme {scheme:?} is not supported")]
    ProxyScheme { scheme: String },

    #[error("client pool is full and no entry is evictable")]
    PoolExhausted,

    #[error("failed to build upstream client: {0}")]
    Build(#[source] reqwest::Error),
}
