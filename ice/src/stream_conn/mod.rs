#[cfg(test)]
mod stream_conn_test;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use dtls::conn::DTLSConn;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use util::vnet::net::Net;
use util::Conn;

use crate::error::*;

const STUN_HEADER_SIZE: usize = 20;
const CHANNEL_DATA_HEADER_SIZE: usize = 4;
const FRAME_PADDING: usize = 4;

/// Length of the frame starting with `header`: a STUN message or a padded ChannelData message.
pub(crate) fn frame_len(header: &[u8; 4]) -> Result<usize> {
    let l = u16::from_be_bytes([header[2], header[3]]) as usize;
    match header[0] >> 6 {
        // STUN messages start with two zero bits
        0 => Ok(STUN_HEADER_SIZE + l),
        // channel numbers live in 0x4000..=0x7FFF
        1 => Ok(CHANNEL_DATA_HEADER_SIZE + (l + FRAME_PADDING - 1) / FRAME_PADDING * FRAME_PADDING),
        _ => Err(Error::ErrInvalidStreamFrame),
    }
}

/// Datagram view of a TCP or TLS stream towards a TURN server: every `recv`
/// yields exactly one STUN or ChannelData frame.
pub(crate) struct StreamConn<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl<S: AsyncRead + AsyncWrite> StreamConn<S> {
    pub(crate) fn new(stream: S, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        StreamConn {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            remote_addr,
        }
    }

    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;

        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        let n = frame_len(&header)?;
        if n > buf.len() {
            return Err(Error::ErrInvalidStreamFrame);
        }

        buf[..4].copy_from_slice(&header);
        reader.read_exact(&mut buf[4..n]).await?;

        Ok(n)
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> Conn for StreamConn<S> {
    async fn connect(&self, _addr: SocketAddr) -> util::Result<()> {
        Err(util::Error::Other("Not applicable".to_owned()))
    }

    async fn recv(&self, buf: &mut [u8]) -> util::Result<usize> {
        Ok(self.read_frame(buf).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> util::Result<(usize, SocketAddr)> {
        let n = self.read_frame(buf).await?;
        Ok((n, self.remote_addr))
    }

    async fn send(&self, buf: &[u8]) -> util::Result<usize> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(buf.len())
    }

    /// The stream reaches only the TURN server, so `target` is ignored.
    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> util::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    async fn close(&self) -> util::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Opens a TCP control connection to a TURN server.
pub(crate) async fn dial_tcp(server_addr: SocketAddr) -> Result<StreamConn<TcpStream>> {
    let stream = TcpStream::connect(server_addr).await?;
    let local_addr = stream.local_addr()?;
    Ok(StreamConn::new(stream, local_addr, server_addr))
}

/// Accepts any certificate the server presents.
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn tls_client_config(insecure_skip_verify: bool) -> ClientConfig {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if insecure_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(SkipServerVerification));
    }
    config
}

/// Opens a TLS control connection to a TURNS server, verifying it as `host`.
pub(crate) async fn dial_tls(
    server_addr: SocketAddr,
    host: &str,
    insecure_skip_verify: bool,
) -> Result<StreamConn<TlsStream<TcpStream>>> {
    let server_name =
        ServerName::try_from(host).map_err(|err| Error::Other(format!("{host}: {err}")))?;
    let connector = TlsConnector::from(Arc::new(tls_client_config(insecure_skip_verify)));

    let stream = TcpStream::connect(server_addr).await?;
    let local_addr = stream.local_addr()?;
    let stream = connector.connect(server_name, stream).await?;

    Ok(StreamConn::new(stream, local_addr, server_addr))
}

/// Opens a DTLS control connection to a TURNS server over UDP, verifying it as `host`.
pub(crate) async fn dial_dtls(
    net: &Arc<Net>,
    server_addr: SocketAddr,
    host: &str,
    insecure_skip_verify: bool,
) -> Result<DTLSConn> {
    let conn = net
        .dail(server_addr.is_ipv4(), &server_addr.to_string())
        .await?;

    let config = dtls::config::Config {
        server_name: host.to_owned(),
        insecure_skip_verify,
        ..Default::default()
    };

    DTLSConn::new(conn, config, true, None)
        .await
        .map_err(|err| Error::Other(format!("dtls: {err}")))
}

/// Control connection handed to the TURN client. Closing it fails every pending and later
/// read, which ends the client's read loop and releases the socket underneath.
pub(crate) struct ControlConn {
    conn: Arc<dyn Conn + Send + Sync>,
    /// Set when `conn` is connected to the server and only supports `send`/`recv`.
    server_addr: Option<SocketAddr>,
    closed_tx: watch::Sender<bool>,
}

impl ControlConn {
    /// Wraps a socket that addresses the server with `send_to`/`recv_from`.
    pub(crate) fn new(conn: Arc<dyn Conn + Send + Sync>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        ControlConn {
            conn,
            server_addr: None,
            closed_tx,
        }
    }

    /// Wraps a connection that is already bound to `server_addr`.
    pub(crate) fn connected(conn: Arc<dyn Conn + Send + Sync>, server_addr: SocketAddr) -> Self {
        let (closed_tx, _) = watch::channel(false);
        ControlConn {
            conn,
            server_addr: Some(server_addr),
            closed_tx,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    async fn read(&self, buf: &mut [u8]) -> util::Result<(usize, SocketAddr)> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(util::Error::ErrUseClosedNetworkConn);
        }

        tokio::select! {
            result = async {
                match self.server_addr {
                    Some(server_addr) => self.conn.recv(buf).await.map(|n| (n, server_addr)),
                    None => self.conn.recv_from(buf).await,
                }
            } => result,
            _ = closed_rx.changed() => Err(util::Error::ErrUseClosedNetworkConn),
        }
    }
}

#[async_trait]
impl Conn for ControlConn {
    async fn connect(&self, addr: SocketAddr) -> util::Result<()> {
        self.conn.connect(addr).await
    }

    async fn recv(&self, buf: &mut [u8]) -> util::Result<usize> {
        let (n, _) = self.read(buf).await?;
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> util::Result<(usize, SocketAddr)> {
        self.read(buf).await
    }

    async fn send(&self, buf: &[u8]) -> util::Result<usize> {
        if self.is_closed() {
            return Err(util::Error::ErrUseClosedNetworkConn);
        }
        self.conn.send(buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> util::Result<usize> {
        if self.is_closed() {
            return Err(util::Error::ErrUseClosedNetworkConn);
        }
        match self.server_addr {
            Some(_) => self.conn.send(buf).await,
            None => self.conn.send_to(buf, target).await,
        }
    }

    fn local_addr(&self) -> util::Result<SocketAddr> {
        self.conn.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.server_addr.or_else(|| self.conn.remote_addr())
    }

    async fn close(&self) -> util::Result<()> {
        if self.closed_tx.send_replace(true) {
            return Err(util::Error::ErrAlreadyClosed);
        }
        self.conn.close().await
    }
}
