//! # TCP Broker Transport
//!
//! Direct-method calls and fleet requests carried over TCP to a broker
//! process (this binary started with `--mode device`).
//!
//! ## Wire Format
//!
//! Every frame is a 4-byte little-endian length followed by a bincode-encoded
//! [`BrokerFrame`]. Frames larger than [`MAX_FRAME_SIZE`] are rejected on both
//! ends.
//!
//! ## Connections
//!
//! - [`TcpTransport`] keeps one connection per device loop. A reader task
//!   forwards incoming frames over a channel so an abandoned call never
//!   leaves half a frame unread on the socket; late answers are recognised by
//!   their correlation id and dropped.
//! - [`TcpBrokerClient`] opens a short-lived connection per fleet request.
//! - [`serve_fleet`] answers both kinds of traffic from a [`SimulatedFleet`].

use super::{
    CloseError, ConnectError, InvokeError, MethodRequest, MethodResponse, RpcTransport,
    TransportConfig, TransportState,
};
use crate::cancel::CancellationSignal;
use crate::device::SimulatedFleet;
use crate::fleet::{
    ConfigurationPush, DesiredSettings, DeviceDirectory, DeviceQuery, FleetError, JobId,
    JobStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Largest frame accepted on the wire
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Messages exchanged with the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerFrame {
    Invoke {
        correlation_id: u64,
        request: MethodRequest,
    },
    InvokeResult {
        correlation_id: u64,
        response: MethodResponse,
    },
    QueryDevices(DeviceQuery),
    Devices(Vec<String>),
    ScheduleUpdate {
        query: DeviceQuery,
        settings: DesiredSettings,
    },
    JobScheduled(JobId),
    JobStatusRequest(JobId),
    JobState(JobStatus),
    Error(String),
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> io::Result<BrokerFrame>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        ));
    }

    let mut frame_data = vec![0u8; frame_len];
    reader.read_exact(&mut frame_data).await?;
    bincode::deserialize(&frame_data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one length-prefixed frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &BrokerFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame_bytes =
        bincode::serialize(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if frame_bytes.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes", frame_bytes.len()),
        ));
    }

    writer
        .write_all(&(frame_bytes.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(&frame_bytes).await?;
    writer.flush().await
}

/// Connect within `connect_timeout` and apply the low-latency socket options
async fn connect(
    address: &str,
    buffer_size: usize,
    connect_timeout: Duration,
) -> io::Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no connection after {:?}", connect_timeout),
            )
        })??;

    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;

    TcpStream::from_std(std_stream)
}

/// Per-device connection to the broker
pub struct TcpTransport {
    config: TransportConfig,
    state: TransportState,
    writer: Option<OwnedWriteHalf>,
    frames: Option<mpsc::Receiver<BrokerFrame>>,
    reader_task: Option<JoinHandle<()>>,
    next_correlation_id: u64,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: TransportState::Uninitialized,
            writer: None,
            frames: None,
            reader_task: None,
            next_correlation_id: 1,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    fn teardown(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        self.frames = None;
        self.state = TransportState::Disconnected;
    }

    async fn await_result(
        frames: &mut mpsc::Receiver<BrokerFrame>,
        correlation_id: u64,
    ) -> Result<MethodResponse, InvokeError> {
        loop {
            match frames.recv().await {
                Some(BrokerFrame::InvokeResult {
                    correlation_id: id,
                    response,
                }) if id == correlation_id => return Ok(response),
                Some(BrokerFrame::InvokeResult {
                    correlation_id: id, ..
                }) => {
                    debug!("Dropping late response for call {}", id);
                }
                Some(BrokerFrame::Error(message)) => return Err(InvokeError::Protocol(message)),
                Some(other) => {
                    return Err(InvokeError::Protocol(format!(
                        "unexpected frame {:?}",
                        other
                    )))
                }
                None => {
                    return Err(InvokeError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "broker closed the connection",
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl RpcTransport for TcpTransport {
    async fn open(&mut self) -> Result<(), ConnectError> {
        let address = self.config.address();
        debug!("Connecting TCP transport to {}", address);

        let stream = connect(
            &address,
            self.config.buffer_size,
            self.config.connect_timeout,
        )
            .await
            .map_err(|source| ConnectError::Io {
                address: address.clone(),
                source,
            })?;
        let (mut read_half, write_half) = stream.into_split();

        let (sender, receiver) = mpsc::channel(64);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(frame) => {
                        if sender.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Broker connection reader finished: {}", e);
                        break;
                    }
                }
            }
        });

        self.writer = Some(write_half);
        self.frames = Some(receiver);
        self.reader_task = Some(reader_task);
        self.state = TransportState::Connected;
        debug!("TCP transport connected to {}", address);
        Ok(())
    }

    async fn invoke(
        &mut self,
        request: &MethodRequest,
        call_timeout: Duration,
    ) -> Result<MethodResponse, InvokeError> {
        let (Some(writer), Some(_)) = (self.writer.as_mut(), self.frames.as_ref()) else {
            return Err(InvokeError::NotOpen);
        };

        let correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;
        let frame = BrokerFrame::Invoke {
            correlation_id,
            request: request.clone(),
        };

        let started = Instant::now();
        match timeout(call_timeout, write_frame(writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.teardown();
                return Err(InvokeError::Io(e));
            }
            Err(_) => {
                // A partially written frame leaves the stream unusable.
                warn!("Send to broker timed out, dropping connection");
                self.teardown();
                return Err(InvokeError::Timeout(call_timeout));
            }
        }

        let remaining = call_timeout.saturating_sub(started.elapsed());
        let Some(frames) = self.frames.as_mut() else {
            return Err(InvokeError::NotOpen);
        };
        match timeout(remaining, Self::await_result(frames, correlation_id)).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Timeout(call_timeout)),
        }
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        let Some(mut writer) = self.writer.take() else {
            self.teardown();
            return Err(CloseError::NotOpen);
        };
        let result = writer.shutdown().await;
        self.teardown();
        debug!("TCP transport closed");
        result.map_err(CloseError::Io)
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Fleet collaborators reached through the broker
#[derive(Debug, Clone)]
pub struct TcpBrokerClient {
    address: String,
}

impl TcpBrokerClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn request(&self, frame: BrokerFrame) -> Result<BrokerFrame, FleetError> {
        let broker = |e: io::Error| FleetError::Broker(format!("{}: {}", self.address, e));

        let defaults = TransportConfig::default();
        let mut stream = connect(&self.address, defaults.buffer_size, defaults.connect_timeout)
            .await
            .map_err(broker)?;
        write_frame(&mut stream, &frame).await.map_err(broker)?;
        let reply = read_frame(&mut stream).await.map_err(broker)?;
        // The broker notices the closed socket and ends the session.
        let _ = stream.shutdown().await;
        Ok(reply)
    }
}

fn unexpected(frame: BrokerFrame) -> FleetError {
    FleetError::Broker(format!("unexpected reply {:?}", frame))
}

#[async_trait]
impl DeviceDirectory for TcpBrokerClient {
    async fn query_devices(&self, query: &DeviceQuery) -> Result<Vec<String>, FleetError> {
        match self.request(BrokerFrame::QueryDevices(query.clone())).await? {
            BrokerFrame::Devices(ids) => Ok(ids),
            BrokerFrame::Error(message) => Err(FleetError::Query(message)),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl ConfigurationPush for TcpBrokerClient {
    async fn schedule_update(
        &self,
        query: &DeviceQuery,
        settings: DesiredSettings,
    ) -> Result<JobId, FleetError> {
        let frame = BrokerFrame::ScheduleUpdate {
            query: query.clone(),
            settings,
        };
        match self.request(frame).await? {
            BrokerFrame::JobScheduled(job_id) => Ok(job_id),
            BrokerFrame::Error(message) => Err(FleetError::Schedule(message)),
            other => Err(unexpected(other)),
        }
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, FleetError> {
        match self
            .request(BrokerFrame::JobStatusRequest(job_id.to_string()))
            .await?
        {
            BrokerFrame::JobState(status) => Ok(status),
            BrokerFrame::Error(message) => Err(FleetError::Broker(message)),
            other => Err(unexpected(other)),
        }
    }
}

/// Answer one request frame from the fleet
async fn answer(fleet: &SimulatedFleet, frame: BrokerFrame) -> BrokerFrame {
    match frame {
        BrokerFrame::Invoke {
            correlation_id,
            request,
        } => BrokerFrame::InvokeResult {
            correlation_id,
            response: fleet.dispatch(&request).await,
        },
        BrokerFrame::QueryDevices(query) => match fleet.query_devices(&query).await {
            Ok(ids) => BrokerFrame::Devices(ids),
            Err(e) => BrokerFrame::Error(e.to_string()),
        },
        BrokerFrame::ScheduleUpdate { query, settings } => {
            match fleet.schedule_update(&query, settings).await {
                Ok(job_id) => BrokerFrame::JobScheduled(job_id),
                Err(e) => BrokerFrame::Error(e.to_string()),
            }
        }
        BrokerFrame::JobStatusRequest(job_id) => match fleet.job_status(&job_id).await {
            Ok(status) => BrokerFrame::JobState(status),
            Err(e) => BrokerFrame::Error(e.to_string()),
        },
        other => BrokerFrame::Error(format!("frame {:?} is not a request", other)),
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    fleet: Arc<SimulatedFleet>,
    cancel: CancellationSignal,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut stream) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Broker session ended: {}", e);
                break;
            }
        };

        let reply = answer(&fleet, frame).await;
        if let Err(e) = write_frame(&mut stream, &reply).await {
            debug!("Failed to reply to client: {}", e);
            break;
        }
    }
}

/// Serve the fleet on `listener` until `cancel` fires.
pub async fn serve_fleet(
    listener: TcpListener,
    fleet: Arc<SimulatedFleet>,
    cancel: CancellationSignal,
) -> io::Result<()> {
    info!(
        "Broker listening on {} with {} simulated device(s)",
        listener.local_addr()?,
        fleet.len()
    );

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted broker connection from {}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                tokio::spawn(handle_connection(stream, fleet.clone(), cancel.clone()));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }

    info!("Broker stopped");
    Ok(())
}
