use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::TargetServer;
use crate::transport::{
    open_reason, ChannelStream, IncomingChannel, TransportError, TransportFactory,
    TransportSession,
};

/// Plain-TCP implementation of the transport contract.
///
/// No authentication or wire crypto: direct channels are ordinary TCP
/// connections from this process and remote forwards are listeners bound on
/// this machine. It backs the bundled binary and the integration tests;
/// deployments tunnel through a real SSH stack by injecting their own
/// factory.
#[derive(Debug, Clone, Default)]
pub struct TcpFactory;

#[async_trait]
impl TransportFactory for TcpFactory {
    async fn connect(
        &self,
        _server: &TargetServer,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        Ok(Arc::new(TcpSession::new()))
    }
}

pub struct TcpSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    routes: StdMutex<HashMap<u16, mpsc::UnboundedSender<IncomingChannel>>>,
    forwards: StdMutex<HashMap<u16, JoinHandle<()>>>,
    closed_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl TcpSession {
    pub fn new() -> Self {
        let (closed_tx, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(SessionInner {
                routes: StdMutex::new(HashMap::new()),
                forwards: StdMutex::new(HashMap::new()),
                closed_tx,
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        Ok(())
    }
}

impl Default for TcpSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportSession for TcpSession {
    async fn open_direct_channel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ChannelStream, TransportError> {
        self.ensure_open()?;
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::ChannelOpen {
                code: open_reason::CONNECT_FAILED,
                message: format!("connect to {host}:{port} failed: {e}"),
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    async fn request_remote_forward(
        &self,
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<u16, TransportError> {
        self.ensure_open()?;
        let addr = if bind_addr.is_empty() {
            "127.0.0.1"
        } else {
            bind_addr
        };
        let listener = TcpListener::bind((addr, bind_port))
            .await
            .map_err(TransportError::io)?;
        let allocated = listener
            .local_addr()
            .map_err(TransportError::io)?
            .port();

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let sender = inner.routes.lock().unwrap().get(&allocated).cloned();
                match sender {
                    Some(tx) => {
                        let offered = IncomingChannel {
                            origin_host: peer.ip().to_string(),
                            origin_port: peer.port(),
                            stream: Box::new(stream),
                        };
                        if tx.send(offered).is_err() {
                            // Subscriber gone; keep accepting so the port
                            // stays reserved until the forward is cancelled.
                            inner.routes.lock().unwrap().remove(&allocated);
                        }
                    }
                    None => drop(stream),
                }
            }
        });
        self.inner.forwards.lock().unwrap().insert(allocated, task);
        Ok(allocated)
    }

    async fn cancel_remote_forward(
        &self,
        _bind_addr: &str,
        bind_port: u16,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if let Some(task) = self.inner.forwards.lock().unwrap().remove(&bind_port) {
            task.abort();
        }
        self.inner.routes.lock().unwrap().remove(&bind_port);
        Ok(())
    }

    fn incoming_on_port(&self, bind_port: u16) -> mpsc::UnboundedReceiver<IncomingChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.lock().unwrap().insert(bind_port, tx);
        rx
    }

    fn closed(&self) -> broadcast::Receiver<()> {
        self.inner.closed_tx.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn dispose(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .forwards
            .lock()
            .unwrap()
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.inner.routes.lock().unwrap().clear();
        let _ = self.inner.closed_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn direct_channel_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let session = TcpSession::new();
        let mut channel = session.open_direct_channel("127.0.0.1", port).await.unwrap();
        channel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn direct_channel_to_dead_port_reports_connect_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = TcpSession::new();
        let err = match session.open_direct_channel("127.0.0.1", port).await {
            Ok(_) => panic!("expected connect to fail"),
            Err(e) => e,
        };
        match err {
            TransportError::ChannelOpen { code, .. } => {
                assert_eq!(code, open_reason::CONNECT_FAILED)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn remote_forward_allocates_and_delivers() {
        let session = TcpSession::new();
        let allocated = session.request_remote_forward("", 0).await.unwrap();
        assert_ne!(allocated, 0);
        let mut incoming = session.incoming_on_port(allocated);

        let mut client = TcpStream::connect(("127.0.0.1", allocated)).await.unwrap();
        client.write_all(b"hi").await.unwrap();

        let mut offered = incoming.recv().await.expect("incoming channel");
        let mut buf = [0u8; 2];
        offered.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        session.cancel_remote_forward("", allocated).await.unwrap();
        session.dispose().await;
        assert!(session.is_closed());
        let err = match session.open_direct_channel("127.0.0.1", 1).await {
            Ok(_) => panic!("expected session closed error"),
            Err(e) => e,
        };
        assert_eq!(err, TransportError::SessionClosed);
    }
}
