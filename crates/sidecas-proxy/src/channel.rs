//! gRPC channel management for the remote CAS and telemetry endpoints

use crate::config::RemoteConfig;
use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use sidecas_core::{ProxyError, Result};
use std::time::Duration;
use tonic::metadata::AsciiMetadataValue;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

// The flush workers leave the channel idle between ticks; keep-alive
// pings stop intermediate proxies from reaping the connection in the
// meantime.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(45);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared gRPC channel for the remote services
#[derive(Clone)]
pub struct GrpcChannel {
    inner: Channel,
}

impl GrpcChannel {
    /// Connect to `endpoint`, retrying transient failures with
    /// exponential backoff
    pub async fn connect(endpoint: &str, config: &RemoteConfig) -> Result<Self> {
        let target = build_endpoint(endpoint, config)?;

        info!(endpoint = %endpoint, "Connecting to remote endpoint");

        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_secs(5))
            .with_max_elapsed_time(Some(Duration::from_secs(30)))
            .build();

        loop {
            match target.connect().await {
                Ok(channel) => {
                    debug!("Connected to remote endpoint");
                    return Ok(Self { inner: channel });
                }
                Err(e) => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(error = %e, retry_in_ms = delay.as_millis(), "Connection failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(ProxyError::unavailable(format!(
                            "failed to connect to {endpoint}: {e}"
                        )));
                    }
                },
            }
        }
    }

    /// Get the raw channel for creating service clients
    pub fn channel(&self) -> Channel {
        self.inner.clone()
    }
}

/// Interceptor adding the proxy's own API key to outbound requests
///
/// Per-request forwarded headers are attached by the callers; this only
/// carries the credential the proxy itself was configured with.
#[derive(Clone)]
pub struct ApiKeyInterceptor {
    api_key: Option<AsciiMetadataValue>,
}

impl ApiKeyInterceptor {
    pub fn new(config: &RemoteConfig) -> Self {
        let api_key = config.api_key.as_ref().and_then(|key| {
            match AsciiMetadataValue::try_from(key) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "API key contains invalid characters, proceeding without auth"
                    );
                    None
                }
            }
        });
        Self { api_key }
    }
}

impl Interceptor for ApiKeyInterceptor {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> std::result::Result<tonic::Request<()>, tonic::Status> {
        if let Some(key) = &self.api_key {
            request
                .metadata_mut()
                .insert("x-sidecas-api-key", key.clone());
        }
        Ok(request)
    }
}

/// Build the tonic endpoint for `target`
///
/// Accepts `grpc://`, `grpcs://`, `http://`, and `https://` targets; a
/// bare `host:port` is treated as TLS, since every production remote
/// sits behind it.
fn build_endpoint(target: &str, config: &RemoteConfig) -> Result<Endpoint> {
    let (tls, host) = match target.split_once("://") {
        Some(("grpc" | "http", rest)) => (false, rest),
        Some(("grpcs" | "https", rest)) => (true, rest),
        Some((scheme, _)) => {
            return Err(ProxyError::config(format!(
                "unsupported scheme {scheme:?} in endpoint {target:?}"
            )));
        }
        None => (true, target),
    };
    let uri = format!("{}://{}", if tls { "https" } else { "http" }, host);

    let mut endpoint = Endpoint::from_shared(uri)
        .map_err(|e| ProxyError::config(format!("bad endpoint {target:?}: {e}")))?
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(CONNECT_TIMEOUT)
        .http2_keep_alive_interval(KEEP_ALIVE_INTERVAL)
        .keep_alive_timeout(KEEP_ALIVE_TIMEOUT)
        .keep_alive_while_idle(true);

    if tls {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| ProxyError::config(format!("TLS setup for {target:?} failed: {e}")))?;
    }

    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RemoteConfig {
        RemoteConfig::default()
    }

    #[test]
    fn test_plaintext_and_tls_schemes_accepted() {
        for target in [
            "grpc://localhost:1985",
            "http://localhost:1985",
            "grpcs://cas.internal:443",
            "https://cas.internal",
        ] {
            assert!(build_endpoint(target, &config()).is_ok(), "{target}");
        }
    }

    #[test]
    fn test_bare_target_defaults_to_tls() {
        // No scheme means TLS; the same host over grpc:// stays
        // plaintext, and both must parse.
        assert!(build_endpoint("cas.internal:443", &config()).is_ok());
        assert!(build_endpoint("grpc://cas.internal:443", &config()).is_ok());
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let err = build_endpoint("ftp://cas.internal", &config()).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_malformed_target_rejected() {
        assert!(build_endpoint("grpc://not a uri", &config()).is_err());
        assert!(build_endpoint("grpc://", &config()).is_err());
    }

    #[test]
    fn test_api_key_interceptor() {
        let config = RemoteConfig {
            api_key: Some("test-key".to_string()),
            ..Default::default()
        };
        let interceptor = ApiKeyInterceptor::new(&config);
        assert!(interceptor.api_key.is_some());

        let none = ApiKeyInterceptor::new(&RemoteConfig::default());
        assert!(none.api_key.is_none());
    }
}
