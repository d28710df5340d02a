//! Carries IP packets between a local device and a session, one stream per flow.
//!
//! Four loops run concurrently for the lifetime of a [`FlowTransmitter`]:
//!
//! - device ingest reads packets, binds new flows to freshly opened streams and queues the
//!   packets for sending;
//! - the scheduler drains the queue, prioritises and ECN-marks packets, and writes them out as
//!   datagrams on their flow's stream;
//! - network ingest accepts the peer's streams and writes every datagram received on them to
//!   the device;
//! - the reaper closes streams of flows that have gone idle.
//!
//! The first loop to fail ends the transmitter and stops the others.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Mutex, Semaphore, mpsc},
    task::JoinSet,
    time::{Instant, sleep, timeout},
};
use tracing::{debug, info, trace, warn};

use crate::{
    Error, PacketDevice, Session,
    codec::{read_datagram, write_datagram},
    flow::{Flow, classify},
    packet::mark_ecn,
};

/// Which side of the session this transmitter runs on.
///
/// This decides the scheduling priority key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// The side that dialled out; batches are ordered by source endpoint.
    #[default]
    Client,

    /// The side that accepted the session; batches are ordered by destination endpoint.
    Server,
}

/// Options for a [`FlowTransmitter`].
#[derive(Debug, Clone)]
pub struct TransmitterOptions {
    /// Which side of the session this is.
    pub role: Role,

    /// Give each flow its own stream. When `false`, all packets share one stream which is never
    /// reaped.
    pub multi_streams: bool,

    /// How long a flow can go without packets before its stream is closed.
    pub inactivity_timeout: Duration,

    /// How long the reaper sleeps when no flow is idle.
    pub poll_interval: Duration,

    /// Maximum number of packets waiting to be sent, counting both the queue and the batch the
    /// scheduler is working through. Device ingest stalls when it is reached.
    pub queue_capacity: usize,

    /// Size of the device read buffer; larger packets are truncated by the device.
    pub read_buffer_size: usize,

    /// How long to wait for the peer to acknowledge the close of an idle stream.
    pub teardown_timeout: Duration,
}

impl Default for TransmitterOptions {
    fn default() -> Self {
        Self {
            role: Role::Client,
            multi_streams: true,
            inactivity_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            queue_capacity: 1000,
            read_buffer_size: 20_000,
            teardown_timeout: Duration::from_secs(1),
        }
    }
}

/// A packet waiting to be sent on its flow's stream.
#[derive(Debug, Clone)]
pub struct PendingSend {
    /// The flow the packet belongs to.
    pub flow: Flow,

    /// The raw IP packet.
    pub packet: BytesMut,

    /// When the packet was queued.
    pub enqueued: Instant,
}

/// Order a batch of pending sends by priority.
///
/// Clients order by source endpoint and servers by destination endpoint. The sort is stable,
/// so packets of one flow keep their relative order.
pub fn sort_batch(batch: &mut [PendingSend], role: Role) {
    match role {
        Role::Client => batch.sort_by_key(|pending| pending.flow.src),
        Role::Server => batch.sort_by_key(|pending| pending.flow.dst),
    }
}

/// The stream currently carrying a flow.
struct StreamBinding<S: Session> {
    id: u64,
    send: Mutex<S::SendStream>,
    recv: Mutex<Option<S::RecvStream>>,
}

impl<S: Session> fmt::Debug for StreamBinding<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBinding")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<S: Session> StreamBinding<S> {
    /// Finish the stream and wait (boundedly) for the peer to finish its side.
    async fn close(&self, wait: Duration) {
        if let Err(err) = self.send.lock().await.shutdown().await {
            trace!(id = self.id, %err, "stream already closed");
        }

        if let Some(mut recv) = self.recv.lock().await.take() {
            let mut byte = [0_u8; 1];
            match timeout(wait, recv.read(&mut byte)).await {
                Ok(_) => trace!(id = self.id, "stream torn down"),
                Err(_) => debug!(id = self.id, "peer did not close stream in time"),
            }
        }
    }
}

struct Inner<S: Session, D> {
    session: S,
    device: Arc<D>,
    options: TransmitterOptions,
    bindings: DashMap<Flow, Arc<StreamBinding<S>>>,
    activity: DashMap<Flow, Instant>,
    next_id: AtomicU64,
}

/// Multiplexes the packets of a local device over a session, one stream per flow.
///
/// Cloning gives another handle to the same transmitter.
pub struct FlowTransmitter<S: Session, D: PacketDevice> {
    inner: Arc<Inner<S, D>>,
}

impl<S: Session, D: PacketDevice> Clone for FlowTransmitter<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Session, D: PacketDevice> fmt::Debug for FlowTransmitter<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTransmitter")
            .field("session", &self.inner.session)
            .field("device", &self.inner.device)
            .field("options", &self.inner.options)
            .field("flows", &self.inner.bindings.len())
            .finish()
    }
}

impl<S: Session, D: PacketDevice> FlowTransmitter<S, D> {
    /// Set up a transmitter between a session and a device. Nothing runs until [`run`](Self::run).
    pub fn new(session: S, device: Arc<D>, options: TransmitterOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                device,
                options,
                bindings: DashMap::new(),
                activity: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The options this transmitter runs with.
    pub fn options(&self) -> &TransmitterOptions {
        &self.inner.options
    }

    /// Flows that currently have a stream.
    pub fn active_flows(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.inner.activity.iter().map(|e| *e.key()).collect();
        flows.sort();
        flows
    }

    /// Whether a flow currently has a stream.
    pub fn is_bound(&self, flow: &Flow) -> bool {
        self.inner.bindings.contains_key(flow)
    }

    /// Run until the session ends or a loop fails.
    ///
    /// A graceful close of the session returns `Ok(())`. Otherwise the first error is returned;
    /// either way every loop is stopped before this returns.
    pub async fn run(&self) -> Result<(), Error> {
        let capacity = self.inner.options.queue_capacity.max(1);
        let (queue, pending) = mpsc::channel(capacity);
        let room = Arc::new(Semaphore::new(capacity));

        let mut loops = JoinSet::new();
        loops.spawn(self.clone().ingest_device(queue, room.clone()));
        loops.spawn(self.clone().schedule(pending, room));
        loops.spawn(self.clone().ingest_network());
        if self.inner.options.multi_streams {
            loops.spawn(self.clone().reap());
        }

        let result = match loops.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(err)) => Err(err.into()),
            None => Ok(()),
        };
        loops.shutdown().await;

        match result {
            Err(err) if err.is_graceful_close() => {
                debug!("session closed, transmitter stopping");
                Ok(())
            }
            Err(err) => {
                warn!(%err, "transmitter failed");
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn ingest_device(
        self,
        queue: mpsc::Sender<PendingSend>,
        room: Arc<Semaphore>,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        let mut buf = vec![0_u8; inner.options.read_buffer_size];
        loop {
            // a slot for the packet, forgotten once queued and handed back by the scheduler
            let Ok(slot) = room.acquire().await else {
                return Ok(());
            };

            let len = inner.device.read_packet(&mut buf).await?;
            let packet = &buf[..len];

            let flow = if inner.options.multi_streams {
                match classify(packet) {
                    Ok(flow) => flow,
                    Err(err) => {
                        warn!(%err, len, "dropping unparseable packet");
                        continue;
                    }
                }
            } else {
                Flow::UNCLASSIFIED
            };

            // checked and refreshed in one step so the reaper can't evict in between
            let revived = match inner.activity.entry(flow) {
                Entry::Occupied(mut entry) => {
                    entry.insert(Instant::now());
                    false
                }
                Entry::Vacant(entry) => {
                    entry.insert(Instant::now());
                    true
                }
            };
            if revived || !inner.bindings.contains_key(&flow) {
                self.bind(flow).await?;
            }

            let pending = PendingSend {
                flow,
                packet: BytesMut::from(packet),
                enqueued: Instant::now(),
            };
            if queue.send(pending).await.is_err() {
                return Ok(());
            }
            slot.forget();
        }
    }

    async fn bind(&self, flow: Flow) -> Result<(), Error> {
        let (send, recv) = self.inner.session.open_stream().await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        info!(%flow, id, "opened stream for flow");

        self.inner.bindings.insert(
            flow,
            Arc::new(StreamBinding {
                id,
                send: Mutex::new(send),
                recv: Mutex::new(Some(recv)),
            }),
        );
        Ok(())
    }

    async fn schedule(
        self,
        mut pending: mpsc::Receiver<PendingSend>,
        room: Arc<Semaphore>,
    ) -> Result<(), Error> {
        let capacity = self.inner.options.queue_capacity.max(1);
        let mut backlog = VecDeque::with_capacity(capacity);
        loop {
            if backlog.is_empty() {
                match pending.recv().await {
                    Some(item) => backlog.push_back(item),
                    None => return Ok(()),
                }
            }

            while backlog.len() < capacity {
                match pending.try_recv() {
                    Ok(item) => backlog.push_back(item),
                    Err(_) => break,
                }
            }

            if backlog.len() > 1 {
                sort_batch(backlog.make_contiguous(), self.inner.options.role);
            }

            if let Some(item) = backlog.pop_front() {
                self.send(item).await;
                room.add_permits(1);
            }
        }
    }

    async fn send(&self, mut item: PendingSend) {
        let rtt = self.inner.session.rtt();
        if item.enqueued.elapsed() > rtt {
            trace!(flow = %item.flow, ?rtt, "queued longer than rtt, marking");
            mark_ecn(&mut item.packet);
        }

        let Some(binding) = self.inner.bindings.get(&item.flow).map(|b| b.clone()) else {
            debug!(flow = %item.flow, "flow was evicted, dropping packet");
            return;
        };

        let mut send = binding.send.lock().await;
        if let Err(err) = write_datagram(&mut *send, &item.packet).await {
            debug!(flow = %item.flow, id = binding.id, %err, "cannot write packet");
        }
    }

    async fn ingest_network(self) -> Result<(), Error> {
        let mut readers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.inner.session.accept_stream() => {
                    let (send, recv) = accepted?;
                    trace!("accepted stream");
                    readers.spawn(read_stream::<S, D>(self.inner.device.clone(), send, recv));
                }
                Some(done) = readers.join_next(), if !readers.is_empty() => {
                    done??;
                }
            }
        }
    }

    async fn reap(self) -> Result<(), Error> {
        let inner = &self.inner;
        loop {
            let idle_for = inner.options.inactivity_timeout;
            let stale = inner
                .activity
                .iter()
                .find(|entry| entry.value().elapsed() > idle_for)
                .map(|entry| *entry.key());

            match stale {
                Some(flow) => self.evict(flow).await,
                None => sleep(inner.options.poll_interval).await,
            }
        }
    }

    async fn evict(&self, flow: Flow) {
        let inner = &self.inner;
        let idle_for = inner.options.inactivity_timeout;
        let binding = inner.bindings.get(&flow).map(|b| b.clone());

        // packets may have arrived since the scan
        if inner
            .activity
            .remove_if(&flow, |_, last| last.elapsed() > idle_for)
            .is_none()
        {
            return;
        }

        let Some(binding) = binding else {
            return;
        };
        inner
            .bindings
            .remove_if(&flow, |_, current| current.id == binding.id);

        info!(%flow, id = binding.id, "closing stream of idle flow");
        binding.close(inner.options.teardown_timeout).await;
    }
}

async fn read_stream<S: Session, D: PacketDevice>(
    device: Arc<D>,
    mut send: S::SendStream,
    mut recv: S::RecvStream,
) -> Result<(), Error> {
    loop {
        match read_datagram(&mut recv).await {
            Ok(Some(packet)) => device.write_packet(&packet).await?,
            Ok(None) => {
                trace!("peer closed stream");
                send.shutdown().await.ok();
                return Ok(());
            }
            Err(err) if err.is_graceful_close() => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}
