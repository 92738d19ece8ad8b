// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use qos_core::limits::MAX_PACKET_SIZE;
use qos_core::{Datagram, ProbeSocket, RecvNotify, SocketFactory, SocketOptions, Time};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use crate::sockopt;

/// Opens UDP probe sockets on a tokio runtime.
#[derive(Clone)]
pub struct TokioSockets {
    runtime: Handle,
    time: Arc<dyn Time>,
}

impl TokioSockets {
    /// Creates a factory spawning onto the current runtime. Datagrams are
    /// stamped with `time` as they arrive.
    pub fn new(time: Arc<dyn Time>) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("probe sockets need a tokio runtime")?;
        Ok(Self { runtime, time })
    }
}

impl SocketFactory for TokioSockets {
    fn open(
        &self,
        options: &SocketOptions,
        notify: RecvNotify,
    ) -> anyhow::Result<Box<dyn ProbeSocket>> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, options.listen_port))
            .with_context(|| format!("unable to bind udp port {}", options.listen_port))?;
        socket.set_nonblocking(true)?;
        sockopt::set_buffer_sizes(&socket, options.recv_buffer, options.send_buffer)
            .context("unable to size socket buffers")?;

        let socket = {
            let _guard = self.runtime.enter();
            Arc::new(UdpSocket::from_std(socket)?)
        };
        let local_addr = socket.local_addr()?;

        let (queue, datagrams) = mpsc::channel(options.packet_queue.max(1));
        let high_water = Arc::new(AtomicUsize::new(0));
        let receiver = self.runtime.spawn(
            receive_loop(
                socket.clone(),
                queue,
                high_water.clone(),
                notify,
                self.time.clone(),
            )
            .in_current_span(),
        );

        info!(%local_addr, "bound probe socket");

        Ok(Box::new(TokioProbeSocket {
            socket,
            local_addr,
            datagrams,
            high_water,
            receiver,
        }))
    }
}

/// Reads datagrams off `socket` into `queue` until the socket fails or the
/// queue is closed. Datagrams arriving while the queue is full are dropped.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    queue: mpsc::Sender<Datagram>,
    high_water: Arc<AtomicUsize>,
    notify: RecvNotify,
    time: Arc<dyn Time>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // icmp port unreachable surfaces as a reset on some platforms
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!(error = %e, "probe socket receive failed");
                break;
            }
        };

        let datagram = Datagram {
            payload: Bytes::copy_from_slice(&buf[..len]),
            from,
            received: time.now(),
        };

        match queue.try_send(datagram) {
            Ok(()) => {
                let queued = queue.max_capacity() - queue.capacity();
                high_water.fetch_max(queued, Ordering::Relaxed);
                trace!(%from, len, queued, "queued datagram");
                notify();
            }
            Err(TrySendError::Full(_)) => debug!(%from, len, "packet queue full, dropping datagram"),
            Err(TrySendError::Closed(_)) => break,
        }
    }

    debug!("probe socket receiver finished");
}

struct TokioProbeSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    datagrams: mpsc::Receiver<Datagram>,
    high_water: Arc<AtomicUsize>,
    receiver: JoinHandle<()>,
}

impl ProbeSocket for TokioProbeSocket {
    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        match self.socket.try_send_to(buf, target) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            result => result,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn try_recv(&mut self) -> Option<Datagram> {
        self.datagrams.try_recv().ok()
    }

    fn queue_high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}

impl Drop for TokioProbeSocket {
    fn drop(&mut self) {
        self.receiver.abort();
        debug!(local_addr = %self.local_addr, "closed probe socket");
    }
}
