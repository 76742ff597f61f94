use crate::{admission::Admission, core::PolicyConfig, server::Bound, tls};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    sync::Arc,
};
use tokio_rustls::rustls::ServerConfig;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[clap(
    name = "annotation-webhook",
    about = "Admits pods that carry a matching annotation"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "annotation_webhook=info,warn",
        env = "ANNOTATION_WEBHOOK_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    /// TLS certificate file
    #[clap(long, env = "ANNOTATION_WEBHOOK_TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// TLS key file
    #[clap(long, env = "ANNOTATION_WEBHOOK_TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    /// The address to start the server
    ///
    /// An empty host (e.g. `:8080`) listens on all IPv4 interfaces only. Use
    /// `[::]:8080` to listen on IPv6.
    #[clap(long, default_value = ":8080", env = "ANNOTATION_WEBHOOK_LISTEN_ADDR")]
    listen_addr: ListenAddr,

    /// The regex that matches the pod annotation key
    #[clap(long, default_value = "", env = "ANNOTATION_WEBHOOK_KEY")]
    key: String,

    /// The regex that matches the pod annotation value
    #[clap(long, default_value = "", env = "ANNOTATION_WEBHOOK_VALUE")]
    value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ListenAddr(SocketAddr);

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        // Everything that can fail on bad configuration runs before the
        // listener is bound.
        let policy = self.policy()?;
        let tls = self.tls()?;

        let Self {
            log_level,
            log_format,
            listen_addr: ListenAddr(listen_addr),
            ..
        } = self;
        log_format.try_init(log_level)?;
        info!(
            key = policy.key_pattern(),
            value = policy.value_pattern(),
            "Loaded annotation policy"
        );

        let (shutdown, _) = kubert::shutdown::sigint_or_sigterm()?;

        let server = Bound::bind(listen_addr, tls)
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;
        server
            .serve(Admission::new(policy), async move {
                if shutdown.signaled().await.is_err() {
                    warn!("Aborted");
                }
            })
            .await;

        Ok(())
    }

    /// Returns the `PolicyConfig` compiled from the key and value patterns.
    pub fn policy(&self) -> Result<PolicyConfig> {
        PolicyConfig::new(&self.key, &self.value).map_err(Into::into)
    }

    /// Returns the server's TLS configuration.
    pub fn tls(&self) -> Result<Arc<ServerConfig>> {
        let cert = self.tls_cert_file.as_deref();
        let key = self.tls_key_file.as_deref();
        tls::load(cert, key).map_err(Into::into)
    }
}

// === impl ListenAddr ===

impl std::str::FromStr for ListenAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(port) = s.strip_prefix(':') {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid port: {port}"))?;
            return Ok(Self(SocketAddr::from(([0, 0, 0, 0], port))));
        }

        s.to_socket_addrs()
            .with_context(|| format!("invalid listen address: {s}"))?
            .next()
            .map(Self)
            .ok_or_else(|| anyhow!("listen address resolved to nothing: {s}"))
    }
}
