use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use stun::message::is_message;
use tokio::sync::mpsc;
use util::{Buffer, Conn};

use super::agent_config::MAX_BUFFER_SIZE;
use super::agent_runner::wait_closed;
use super::*;

impl Agent {
    /// Connects to the remote agent, acting as the controlling ice agent.
    /// Blocks until a pair is selected, the caller cancels or the agent is closed.
    pub async fn connect(
        &self,
        cancel_rx: mpsc::Receiver<()>,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<Arc<AgentConn>> {
        self.start_connectivity_checks(true, remote_ufrag, remote_pwd)
            .await?;
        self.wait_connected(cancel_rx).await
    }

    /// Connects to the remote agent, acting as the controlled ice agent.
    /// Blocks until a pair is selected, the caller cancels or the agent is closed.
    pub async fn accept(
        &self,
        cancel_rx: mpsc::Receiver<()>,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<Arc<AgentConn>> {
        self.start_connectivity_checks(false, remote_ufrag, remote_pwd)
            .await?;
        self.wait_connected(cancel_rx).await
    }

    async fn start_connectivity_checks(
        &self,
        is_controlling: bool,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<()> {
        self.runner
            .run(move |ai| ai.start_connectivity_checks(is_controlling, remote_ufrag, remote_pwd))
            .await??;

        let force_candidate_contact_rx = self.force_candidate_contact_rx.lock().await.take();
        if let Some(force_candidate_contact_rx) = force_candidate_contact_rx {
            self.runner.start_task_loop(force_candidate_contact_rx);
        }

        Ok(())
    }

    async fn wait_connected(&self, mut cancel_rx: mpsc::Receiver<()>) -> Result<Arc<AgentConn>> {
        let on_connected_rx = self.on_connected_rx.lock().await.take();

        if let Some(mut on_connected_rx) = on_connected_rx {
            let closed_rx = self.closed_tx.subscribe();
            // block until pair selected
            tokio::select! {
                _ = on_connected_rx.recv() => {},
                _ = cancel_rx.recv() => {
                    return Err(Error::ErrCanceledByCaller);
                }
                _ = wait_closed(closed_rx) => {
                    return Err(Error::ErrClosed);
                }
            }
        }

        if *self.closed_tx.borrow() {
            return Err(Error::ErrClosed);
        }

        Ok(Arc::clone(&self.runner.agent_conn))
    }
}

/// The data path of a connected agent. Writes go out over the selected pair, reads return the
/// application data received on any valid pair.
pub struct AgentConn {
    pub(crate) selected_pair: ArcSwapOption<CandidatePair>,

    pub(crate) buffer: Buffer,
    pub(crate) bytes_received: AtomicUsize,
    pub(crate) bytes_sent: AtomicUsize,
    pub(crate) done: AtomicBool,
}

impl AgentConn {
    pub(crate) fn new() -> Self {
        Self {
            selected_pair: ArcSwapOption::empty(),
            // Make sure the buffer doesn't grow indefinitely.
            // NOTE: We actually won't get anywhere close to this limit.
            // SRTP will constantly read from the endpoint and drop packets if it's full.
            buffer: Buffer::new(0, MAX_BUFFER_SIZE),
            bytes_received: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            done: AtomicBool::new(false),
        }
    }

    pub(crate) fn get_selected_pair(&self) -> Option<Arc<CandidatePair>> {
        self.selected_pair.load_full()
    }

    /// Returns the number of bytes sent.
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// Returns the number of bytes received.
    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Stores inbound application data for `recv`.
    pub(crate) async fn deliver(&self, buf: &[u8]) {
        if let Err(err) = self.buffer.write(buf).await {
            log::warn!("failed to write packet: {}", err);
        }
    }

    /// Marks the conn done and wakes pending readers.
    pub(crate) async fn shutdown(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.buffer.close().await;
        }
    }
}

#[async_trait]
impl Conn for AgentConn {
    async fn connect(&self, _addr: SocketAddr) -> std::result::Result<(), util::Error> {
        Err(io::Error::new(io::ErrorKind::Other, "Not applicable").into())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        if self.done.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed.into());
        }

        let n = match self.buffer.read(buf, None).await {
            Ok(n) => n,
            Err(util::Error::ErrBufferClosed) => return Err(Error::ErrClosed.into()),
            Err(err) => return Err(err),
        };
        self.bytes_received.fetch_add(n, Ordering::SeqCst);

        Ok(n)
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> std::result::Result<(usize, SocketAddr), util::Error> {
        if let Some(raddr) = self.remote_addr() {
            let n = self.recv(buf).await?;
            Ok((n, raddr))
        } else {
            Err(Error::ErrNoCandidatePairs.into())
        }
    }

    async fn send(&self, buf: &[u8]) -> std::result::Result<usize, util::Error> {
        if self.done.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed.into());
        }

        if is_message(buf) {
            return Err(Error::ErrIceWriteStunMessage.into());
        }

        let pair = self
            .get_selected_pair()
            .ok_or(Error::ErrNoCandidatePairs)?;
        let n = pair.write(buf).await?;
        self.bytes_sent.fetch_add(buf.len(), Ordering::SeqCst);

        Ok(n)
    }

    async fn send_to(
        &self,
        _buf: &[u8],
        _target: SocketAddr,
    ) -> std::result::Result<usize, util::Error> {
        Err(io::Error::new(io::ErrorKind::Other, "Not applicable").into())
    }

    fn local_addr(&self) -> std::result::Result<SocketAddr, util::Error> {
        if let Some(pair) = self.get_selected_pair() {
            Ok(pair.local.addr())
        } else {
            Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "Addr Not Available").into())
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.get_selected_pair().map(|pair| pair.remote.addr())
    }

    async fn close(&self) -> std::result::Result<(), util::Error> {
        self.shutdown().await;
        Ok(())
    }
}
