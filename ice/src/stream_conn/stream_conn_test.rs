use std::time::Duration;

use stun::message::*;
use tokio::net::{TcpListener, UdpSocket};

use super::*;

#[test]
fn test_frame_len() -> Result<()> {
    // STUN header, 8 bytes of attributes
    assert_eq!(frame_len(&[0x00, 0x01, 0x00, 0x08])?, 28);
    // ChannelData, 5 bytes of payload padded to 8
    assert_eq!(frame_len(&[0x40, 0x00, 0x00, 0x05])?, 12);
    // ChannelData, already aligned payload
    assert_eq!(frame_len(&[0x7f, 0xff, 0x00, 0x04])?, 8);
    // neither STUN nor ChannelData
    assert_eq!(
        frame_len(&[0x80, 0x00, 0x00, 0x04]),
        Err(Error::ErrInvalidStreamFrame)
    );

    Ok(())
}

#[tokio::test]
async fn test_stream_conn_splits_frames() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;

    let mut msg = Message::new();
    msg.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(stun::agent::TransactionId::new()),
    ])?;
    let stun_raw = msg.raw.clone();
    let channel_data = vec![0x40, 0x00, 0x00, 0x03, 0xaa, 0xbb, 0xcc, 0x00];

    let mut wire = stun_raw.clone();
    wire.extend_from_slice(&channel_data);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await?;
        stream.write_all(&wire).await?;
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await?;
        Ok::<[u8; 4], std::io::Error>(echo)
    });

    let conn = dial_tcp(server_addr).await?;
    assert_eq!(conn.remote_addr(), Some(server_addr));

    let mut buf = vec![0u8; 1500];
    let (n, from) = conn.recv_from(&mut buf).await?;
    assert_eq!(from, server_addr);
    assert_eq!(&buf[..n], &stun_raw[..], "first frame is the STUN message");

    let n = conn.recv(&mut buf).await?;
    assert_eq!(&buf[..n], &channel_data[..], "second frame is the padded ChannelData");

    conn.send_to(b"ping", server_addr).await?;
    let echo = server
        .await
        .map_err(|err| Error::Other(err.to_string()))??;
    assert_eq!(&echo, b"ping");

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn test_control_conn_close_unblocks_recv() -> Result<()> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let local_addr = socket.local_addr()?;
    let conn = Arc::new(ControlConn::new(Arc::new(socket)));
    assert_eq!(conn.local_addr()?, local_addr);

    let reader = Arc::clone(&conn);
    let reading = tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        reader.recv_from(&mut buf).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close().await?;
    assert!(conn.is_closed());

    let result = tokio::time::timeout(Duration::from_secs(1), reading)
        .await
        .map_err(|_| Error::Other("recv_from was not unblocked".to_owned()))?
        .map_err(|err| Error::Other(err.to_string()))?;
    assert!(matches!(result, Err(util::Error::ErrUseClosedNetworkConn)));

    let mut buf = vec![0u8; 1500];
    assert!(conn.recv(&mut buf).await.is_err());
    assert!(conn.send_to(b"late", local_addr).await.is_err());
    assert!(matches!(
        conn.close().await,
        Err(util::Error::ErrAlreadyClosed)
    ));

    Ok(())
}

#[tokio::test]
async fn test_control_conn_connected_routes_to_server() -> Result<()> {
    let server = UdpSocket::bind("127.0.0.1:0").await?;
    let server_addr = server.local_addr()?;

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(server_addr).await?;
    let client_addr = socket.local_addr()?;
    let conn = ControlConn::connected(Arc::new(socket), server_addr);
    assert_eq!(conn.remote_addr(), Some(server_addr));

    // the target is ignored, the connection only reaches the server
    let elsewhere = SocketAddr::from(([127, 0, 0, 1], 9));
    conn.send_to(b"ping", elsewhere).await?;

    let mut buf = vec![0u8; 64];
    let (n, from) = server.recv_from(&mut buf).await?;
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, client_addr);

    server.send_to(b"pong", client_addr).await?;
    let (n, from) = conn.recv_from(&mut buf).await?;
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, server_addr);

    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_dial_dtls_sends_client_hello() -> Result<()> {
    // never answers, the handshake stays pending
    let server = UdpSocket::bind("127.0.0.1:0").await?;
    let server_addr = server.local_addr()?;

    let net = Arc::new(Net::new(None));
    let dialing =
        tokio::spawn(async move { dial_dtls(&net, server_addr, "127.0.0.1", true).await });

    let mut buf = vec![0u8; 1500];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
        .await
        .map_err(|_| Error::Other("no DTLS record received".to_owned()))??;
    assert!(n > 13, "a DTLS record header is 13 bytes");
    // handshake content type, DTLS 1.x record version
    assert_eq!(buf[0], 22);
    assert_eq!(buf[1], 0xfe);

    dialing.abort();
    Ok(())
}
