/// Framed JSON agent client
///
/// Requests and replies travel as length-delimited JSON envelopes over one
/// mutual TLS stream per agent. Replies are matched to callers by envelope
/// id, so any number of calls may be in flight on the same channel.
use super::*;
use crate::core::connection::{ChannelState, Connection, Dialer};
use crate::error::{HubError, HubResult};
use crate::tls::{connect_tls, Credentials};
use crate::utils::{frame_error, json_framed};
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Wire envelope carrying a request or reply body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum AgentRequest {
    MakeSegment(MakeSegmentRequest),
    StartSegment(StartSegmentRequest),
    UpdatePgConf(UpdatePgConfRequest),
    UpdatePgHbaConfAndReload(UpdatePgHbaConfRequest),
    PgBasebackup(PgBasebackupRequest),
    GetInterfaceAddrs,
    ValidateHostEnv(ValidateHostEnvRequest),
    GetHostname,
    Status,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentReply {
    Ok,
    InterfaceAddrs { addrs: Vec<String> },
    Validation { messages: Vec<LogMessage> },
    Hostname { hostname: String },
    Status { status: ServiceStatus },
    Error { message: String },
}

type Pending = Arc<Mutex<FnvHashMap<u64, oneshot::Sender<HubResult<AgentReply>>>>>;

/// Release every caller still waiting on a reply
fn fail_pending(pending: &Pending, host: &str, message: &str) {
    let waiters: Vec<_> = match pending.lock() {
        Ok(mut pending) => pending.drain().map(|(_, tx)| tx).collect(),
        Err(_) => return,
    };
    for tx in waiters {
        let _ = tx.send(Err(HubError::unavailable(host, message)));
    }
}

fn encode_state(state: ChannelState) -> u8 {
    match state {
        ChannelState::Idle => 0,
        ChannelState::Connecting => 1,
        ChannelState::Ready => 2,
        ChannelState::TransientFailure => 3,
        ChannelState::Shutdown => 4,
    }
}

fn decode_state(value: u8) -> ChannelState {
    match value {
        0 => ChannelState::Idle,
        1 => ChannelState::Connecting,
        2 => ChannelState::Ready,
        3 => ChannelState::TransientFailure,
        _ => ChannelState::Shutdown,
    }
}

/// Agent client multiplexing calls over one framed stream
pub struct FramedAgentClient {
    host: String,
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<Envelope<AgentRequest>>,
    pending: Pending,
    state: Arc<AtomicU8>,
}

impl FramedAgentClient {
    /// Take over an established stream, spawning its reader and writer
    /// tasks. Both stop when `cancel` fires or the stream breaks.
    pub fn spawn<S>(host: &str, io: S, cancel: CancellationToken) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut source) =
            json_framed::<_, Envelope<AgentReply>, Envelope<AgentRequest>>(io).split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Envelope<AgentRequest>>();
        let pending: Pending = Arc::new(Mutex::new(FnvHashMap::default()));
        let state = Arc::new(AtomicU8::new(encode_state(ChannelState::Ready)));

        let writer_cancel = cancel.clone();
        let writer_pending = Arc::clone(&pending);
        let writer_state = Arc::clone(&state);
        let writer_host = host.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = outgoing_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                warn!("Write to agent on host {} failed: {}", writer_host, e);
                                writer_state.store(
                                    encode_state(ChannelState::TransientFailure),
                                    Ordering::SeqCst,
                                );
                                fail_pending(&writer_pending, &writer_host, "write to agent failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        let reader_state = Arc::clone(&state);
        let reader_host = host.to_string();
        tokio::spawn(async move {
            let final_state = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break ChannelState::Shutdown,
                    frame = source.next() => match frame {
                        Some(Ok(envelope)) => {
                            let waiter = reader_pending
                                .lock()
                                .ok()
                                .and_then(|mut p| p.remove(&envelope.id));
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(Ok(envelope.body));
                                }
                                None => debug!(
                                    "Dropping reply {} from host {} with no caller",
                                    envelope.id, reader_host
                                ),
                            }
                        }
                        Some(Err(e)) => {
                            warn!(
                                "Read from agent on host {} failed: {}",
                                reader_host,
                                frame_error(e)
                            );
                            break ChannelState::TransientFailure;
                        }
                        None => {
                            debug!("Agent on host {} closed the connection", reader_host);
                            break ChannelState::TransientFailure;
                        }
                    },
                }
            };

            reader_state.store(encode_state(final_state), Ordering::SeqCst);
            fail_pending(
                &reader_pending,
                &reader_host,
                "connection closed while waiting for reply",
            );
        });

        Self {
            host: host.to_string(),
            next_id: AtomicU64::new(1),
            outgoing,
            pending,
            state,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn call(&self, request: AgentRequest) -> HubResult<AgentReply> {
        let state = self.state();
        if state != ChannelState::Ready {
            return Err(HubError::unavailable(
                &self.host,
                format!("connection is {}", state),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.pending
            .lock()
            .map_err(|_| HubError::internal("agent reply table poisoned"))?
            .insert(id, tx);

        // The reader may have shut down between the first check and the insert
        if self.state() != ChannelState::Ready {
            self.forget(id);
            return Err(HubError::unavailable(&self.host, "connection closed"));
        }

        if self.outgoing.send(Envelope { id, body: request }).is_err() {
            self.forget(id);
            return Err(HubError::unavailable(&self.host, "connection closed"));
        }

        let reply = rx.await.map_err(|_| {
            HubError::unavailable(&self.host, "connection closed while waiting for reply")
        })??;

        match reply {
            AgentReply::Error { message } => Err(HubError::rpc(message)),
            other => Ok(other),
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    async fn call_ok(&self, request: AgentRequest) -> HubResult<()> {
        match self.call(request).await? {
            AgentReply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: AgentReply) -> HubError {
    HubError::protocol(format!("unexpected agent reply: {:?}", reply))
}

#[async_trait]
impl AgentClient for FramedAgentClient {
    async fn make_segment(&self, req: MakeSegmentRequest) -> HubResult<()> {
        self.call_ok(AgentRequest::MakeSegment(req)).await
    }

    async fn start_segment(&self, req: StartSegmentRequest) -> HubResult<()> {
        self.call_ok(AgentRequest::StartSegment(req)).await
    }

    async fn update_pg_conf(&self, req: UpdatePgConfRequest) -> HubResult<()> {
        self.call_ok(AgentRequest::UpdatePgConf(req)).await
    }

    async fn update_pg_hba_conf_and_reload(&self, req: UpdatePgHbaConfRequest) -> HubResult<()> {
        self.call_ok(AgentRequest::UpdatePgHbaConfAndReload(req)).await
    }

    async fn pg_basebackup(&self, req: PgBasebackupRequest) -> HubResult<()> {
        self.call_ok(AgentRequest::PgBasebackup(req)).await
    }

    async fn get_interface_addrs(&self) -> HubResult<Vec<String>> {
        match self.call(AgentRequest::GetInterfaceAddrs).await? {
            AgentReply::InterfaceAddrs { addrs } => Ok(addrs),
            other => Err(unexpected(other)),
        }
    }

    async fn validate_host_env(&self, req: ValidateHostEnvRequest) -> HubResult<Vec<LogMessage>> {
        match self.call(AgentRequest::ValidateHostEnv(req)).await? {
            AgentReply::Validation { messages } => Ok(messages),
            other => Err(unexpected(other)),
        }
    }

    async fn get_hostname(&self) -> HubResult<String> {
        match self.call(AgentRequest::GetHostname).await? {
            AgentReply::Hostname { hostname } => Ok(hostname),
            other => Err(unexpected(other)),
        }
    }

    async fn status(&self) -> HubResult<ServiceStatus> {
        match self.call(AgentRequest::Status).await? {
            AgentReply::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    async fn stop(&self) -> HubResult<()> {
        self.call_ok(AgentRequest::Stop).await
    }

    fn state(&self) -> ChannelState {
        decode_state(self.state.load(Ordering::SeqCst))
    }
}

/// Dials agents over TCP with mutual TLS
pub struct TlsDialer {
    credentials: Arc<dyn Credentials>,
    agent_port: u16,
}

impl TlsDialer {
    pub fn new(credentials: Arc<dyn Credentials>, agent_port: u16) -> Self {
        Self {
            credentials,
            agent_port,
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, host: &str) -> HubResult<Connection> {
        let tcp = TcpStream::connect((host, self.agent_port))
            .await
            .map_err(|e| HubError::connection(host, e.to_string()))?;
        tcp.set_nodelay(true)?;
        socket2::SockRef::from(&tcp).set_keepalive(true)?;

        let tls = connect_tls(&self.credentials, host, tcp)
            .await
            .map_err(|e| HubError::connection(host, e.to_string()))?;

        let cancel = CancellationToken::new();
        let client = FramedAgentClient::spawn(host, tls, cancel.clone());
        Ok(Connection::new(host, Arc::new(client), cancel))
    }
}
