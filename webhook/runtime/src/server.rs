use crate::admission::Admission;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use std::{future::Future, io, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{self, Duration},
};
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};
use tracing::{debug, info, info_span, warn, Instrument};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// Keeps a persistent accept failure (e.g. EMFILE) from spinning the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A TLS listener bound to its address but not yet serving.
pub struct Bound {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    local_addr: SocketAddr,
}

// === impl Bound ===

impl Bound {
    pub async fn bind(addr: SocketAddr, tls: Arc<ServerConfig>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves admission requests until `shutdown` completes, then waits for
    /// open connections to finish.
    ///
    /// Every connection is served on its own task. A failed handshake or a
    /// broken connection ends only that task.
    pub async fn serve<F>(self, admission: Admission, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            acceptor,
            local_addr,
        } = self;
        let (drain_tx, drain_rx) = drain::channel();

        info!(addr = %local_addr, "Admission server listening");
        tokio::pin!(shutdown);
        loop {
            let (tcp, client_addr) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                () = &mut shutdown => break,
            };

            tokio::spawn(
                serve_conn(tcp, acceptor.clone(), admission.clone(), drain_rx.clone())
                    .instrument(info_span!("conn", client.addr = %client_addr)),
            );
        }

        drop(listener);
        drop(drain_rx);
        debug!("Draining connections");
        drain_tx.drain().await;
        info!("Admission server stopped");
    }
}

async fn serve_conn(
    tcp: TcpStream,
    acceptor: TlsAcceptor,
    admission: Admission,
    drain: drain::Watch,
) {
    let tls = match time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(error)) => {
            debug!(%error, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!(timeout = ?HANDSHAKE_TIMEOUT, "TLS handshake timed out");
            return;
        }
    };

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(tls), TowerToHyperService::new(admission));
    tokio::pin!(conn);

    let res = tokio::select! {
        res = conn.as_mut() => res,
        release = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            release.release_after(conn).await
        }
    };
    if let Err(error) = res {
        debug!(%error, "Connection closed");
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::tls::test_util::TestCert;
    use std::{net::SocketAddr, sync::Arc};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };
    use tokio_rustls::{
        rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore},
        TlsConnector,
    };

    pub(crate) const UID: &str = "b1a6f1d2-35c9-4a36-9c53-0f4f2f7b1e55";

    /// A client that trusts only `tc`.
    pub(crate) fn connector(tc: &TestCert) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(tc.der.clone()).expect("root must be added");
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions must be supported")
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// Sends `body` as a single HTTP/1.1 POST and returns the raw response.
    pub(crate) async fn post(addr: SocketAddr, connector: &TlsConnector, body: &str) -> String {
        let tcp = TcpStream::connect(addr).await.expect("must connect");
        let server_name = ServerName::try_from("localhost").expect("name must be valid");
        let mut tls = connector
            .connect(server_name, tcp)
            .await
            .expect("handshake must succeed");
        let req = format!(
            "POST /validate HTTP/1.1\r\n\
             host: localhost\r\n\
             content-type: application/json\r\n\
             content-length: {}\r\n\
             connection: close\r\n\
             \r\n\
             {}",
            body.len(),
            body
        );
        tls.write_all(req.as_bytes()).await.expect("must write");
        let mut buf = Vec::new();
        // The server may close without a close_notify; keep what was read.
        let _ = tls.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// A review of a pod annotated `policy/foo=allow`.
    pub(crate) fn review() -> String {
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": UID,
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "name": "web-0",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {},
                "dryRun": false,
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {
                        "name": "web-0",
                        "annotations": { "policy/foo": "allow" },
                    },
                },
            },
        })
        .to_string()
    }
}
