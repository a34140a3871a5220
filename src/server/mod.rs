/// Caller-facing hub service
///
/// One request frame per connection. The hub answers with the workflow's
/// log, stdout and progress frames followed by exactly one terminal frame.
/// Frames are length-delimited JSON over mutual TLS.
use crate::agent::ServiceStatus;
use crate::core::{AddMirrorsRequest, MakeClusterRequest};
use crate::error::{HubError, HubResult};
use crate::stream::progress::{consume_stream, ProgressTracker};
use crate::stream::{ChannelSender, HubReply, HubStream};
use crate::tls::{accept_tls, connect_tls, Credentials};
use crate::utils::{frame_error, json_framed, JsonFramed};
use crate::workflow::log_and_return;
use crate::Hub;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use openssl::ssl::SslAcceptor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Request frame sent by a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum HubRequest {
    MakeCluster(MakeClusterRequest),
    AddMirrors(AddMirrorsRequest),
    StopAgents,
    StatusAgents,
    /// Shut the hub service down
    Stop,
}

impl HubRequest {
    pub fn name(&self) -> &'static str {
        match self {
            HubRequest::MakeCluster(_) => "make_cluster",
            HubRequest::AddMirrors(_) => "add_mirrors",
            HubRequest::StopAgents => "stop_agents",
            HubRequest::StatusAgents => "status_agents",
            HubRequest::Stop => "stop",
        }
    }
}

/// Accept loop of the hub service
pub struct HubServer {
    hub: Arc<Hub>,
    acceptor: Arc<SslAcceptor>,
}

impl HubServer {
    pub fn new(hub: Arc<Hub>, acceptor: SslAcceptor) -> Self {
        Self {
            hub,
            acceptor: Arc::new(acceptor),
        }
    }

    /// Listen on the configured hub port on all interfaces
    pub async fn bind(&self) -> HubResult<TcpListener> {
        let port = self.hub.config().hub.port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| HubError::from(e).context(format!("listening on port {}", port)))?;
        info!("Hub listening on port {}", port);
        Ok(listener)
    }

    /// Serve connections until `shutdown` fires or a caller sends `Stop`
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> HubResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Hub shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    debug!("New connection from {}", peer);

                    let hub = Arc::clone(&self.hub);
                    let acceptor = Arc::clone(&self.acceptor);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let tls = match accept_tls(&acceptor, tcp).await {
                            Ok(tls) => tls,
                            Err(e) => {
                                warn!("Rejected connection from {}: {}", peer, e);
                                return;
                            }
                        };
                        if let Err(e) = handle_connection(hub, tls, shutdown).await {
                            warn!("Request from {} failed: {}", peer, e);
                        }
                    });
                }
            }
        }
    }
}

/// Writes reply frames until the caller goes away, then drops them
struct ReplyWriter<S> {
    conn: SplitSink<JsonFramed<S, HubRequest, HubReply>, HubReply>,
    connected: bool,
}

impl<S> ReplyWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(conn: SplitSink<JsonFramed<S, HubRequest, HubReply>, HubReply>) -> Self {
        Self {
            conn,
            connected: true,
        }
    }

    async fn send(&mut self, reply: HubReply) {
        if !self.connected {
            return;
        }
        if let Err(e) = self.conn.send(reply).await {
            error!("failed to send stream message: {}", e);
            self.connected = false;
        }
    }

    /// Relay replies until the terminal frame has been written
    async fn relay(mut self, mut rx: mpsc::UnboundedReceiver<HubReply>) {
        while let Some(reply) = rx.recv().await {
            let terminal = reply.is_terminal();
            self.send(reply).await;
            if terminal {
                break;
            }
        }
    }
}

async fn dispatch(hub: &Hub, request: HubRequest, stream: HubStream) -> HubResult<Option<Vec<ServiceStatus>>> {
    match request {
        HubRequest::MakeCluster(req) => hub.make_cluster(req, &stream).await.map(|_| None),
        HubRequest::AddMirrors(req) => hub.add_mirrors(req, &stream).await.map(|_| None),
        HubRequest::StopAgents => log_and_return(hub.stop_agents().await).map(|_| None),
        HubRequest::StatusAgents => log_and_return(hub.status_agents().await).map(Some),
        HubRequest::Stop => Ok(None),
    }
}

/// Serve one caller: read its request, run the workflow while a separate
/// task relays its stream, then send the terminal frame.
///
/// The workflow only ever pushes into an unbounded channel, so a caller that
/// stops reading never holds it up.
pub async fn handle_connection<S>(hub: Arc<Hub>, io: S, shutdown: CancellationToken) -> HubResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, mut source) = json_framed::<_, HubRequest, HubReply>(io).split();
    let mut writer = ReplyWriter::new(sink);

    let request = match source.next().await {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            let e = frame_error(e);
            writer
                .send(HubReply::Error {
                    message: e.to_string(),
                })
                .await;
            return Err(e);
        }
        None => return Ok(()),
    };
    info!("Received {} request", request.name());
    let stop_requested = matches!(request, HubRequest::Stop);

    let (tx, rx) = mpsc::unbounded_channel();
    let stream = HubStream::new(Arc::new(ChannelSender::new(tx.clone())));
    let relay = tokio::spawn(writer.relay(rx));

    let outcome = dispatch(&hub, request, stream).await;

    let result = match outcome {
        Ok(statuses) => {
            if let Some(statuses) = statuses {
                let _ = tx.send(HubReply::Statuses { statuses });
            }
            let _ = tx.send(HubReply::Done);
            Ok(())
        }
        Err(e) => {
            let _ = tx.send(HubReply::Error {
                message: e.to_string(),
            });
            Err(e)
        }
    };
    if let Err(e) = relay.await {
        error!("reply relay task failed: {}", e);
    }

    if stop_requested {
        shutdown.cancel();
    }
    result
}

/// Send one request over `io` and consume the reply stream
pub async fn run_request<S>(
    io: S,
    request: &HubRequest,
    tracker: &mut ProgressTracker,
) -> HubResult<Vec<ServiceStatus>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = json_framed::<_, HubReply, HubRequest>(io);
    conn.send(request.clone()).await?;

    consume_stream(conn.map(|reply| reply.map_err(frame_error)), tracker).await
}

/// Command-line side of the hub service
pub struct HubClient {
    host: String,
    port: u16,
    credentials: Arc<dyn Credentials>,
}

impl HubClient {
    pub fn new<S: Into<String>>(host: S, port: u16, credentials: Arc<dyn Credentials>) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
        }
    }

    pub async fn request(&self, request: &HubRequest, tracker: &mut ProgressTracker) -> HubResult<Vec<ServiceStatus>> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                HubError::from(e).context(format!("connecting to hub at {}:{}", self.host, self.port))
            })?;
        tcp.set_nodelay(true)?;
        let tls = connect_tls(&self.credentials, &self.host, tcp).await?;

        debug!("Sending {} request to {}", request.name(), self.host);
        run_request(tls, request, tracker).await
    }
}
