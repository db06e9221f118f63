use std::net::IpAddr;

use util::Conn;

use super::*;

fn loopback_config() -> AgentConfig {
    let ip_filter: IpFilterFn = Box::new(|ip: IpAddr| ip.is_loopback());
    AgentConfig {
        multicast_dns_mode: MulticastDnsMode::Disabled,
        network_types: vec![NetworkType::Udp4],
        candidate_types: vec![CandidateType::Host],
        include_loopback: true,
        ip_filter: Arc::new(Some(ip_filter)),
        check_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn gathered_agent(config: AgentConfig) -> Result<Arc<Agent>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let a = Arc::new(Agent::new(config).await?);
    a.on_candidate(Box::new(|_: Option<Arc<Candidate>>| Box::pin(async move {})));
    a.gather_candidates().await?;
    Ok(a)
}

/// Hands every local candidate of `from` to `to`, as a signaling channel would.
async fn exchange_candidates(from: &Agent, to: &Agent) -> Result<()> {
    for c in from.get_local_candidates().await? {
        to.add_remote_candidate(unmarshal_candidate(&c.marshal())?)
            .await?;
    }
    Ok(())
}

/// Connects `a_agent` as controlling and `b_agent` as controlled.
async fn connect_pair(
    a_agent: &Arc<Agent>,
    b_agent: &Arc<Agent>,
) -> Result<(Arc<AgentConn>, Arc<AgentConn>)> {
    exchange_candidates(a_agent, b_agent).await?;
    exchange_candidates(b_agent, a_agent).await?;

    let (a_ufrag, a_pwd) = a_agent.get_local_user_credentials().await?;
    let (b_ufrag, b_pwd) = b_agent.get_local_user_credentials().await?;

    let (_a_cancel_tx, a_cancel_rx) = mpsc::channel(1);
    let (_b_cancel_tx, b_cancel_rx) = mpsc::channel(1);

    let b = Arc::clone(b_agent);
    let accepting =
        tokio::spawn(async move { b.accept(b_cancel_rx, a_ufrag, a_pwd).await });

    let a_conn = tokio::time::timeout(
        Duration::from_secs(5),
        a_agent.connect(a_cancel_rx, b_ufrag, b_pwd),
    )
    .await
    .map_err(|_| Error::Other("connect timed out".to_owned()))??;

    let b_conn = tokio::time::timeout(Duration::from_secs(5), accepting)
        .await
        .map_err(|_| Error::Other("accept timed out".to_owned()))?
        .map_err(|err| Error::Other(err.to_string()))??;

    Ok((a_conn, b_conn))
}

#[tokio::test]
async fn test_connectivity_on_loopback() -> Result<()> {
    let a_agent = gathered_agent(loopback_config()).await?;
    let b_agent = gathered_agent(loopback_config()).await?;

    let (a_conn, b_conn) = connect_pair(&a_agent, &b_agent).await?;

    assert_eq!(a_agent.get_connection_state().await, ConnectionState::Connected);
    assert_eq!(b_agent.get_connection_state().await, ConnectionState::Connected);

    let a_pair = a_agent
        .get_selected_candidate_pair()
        .ok_or(Error::ErrNoCandidatePairs)?;
    let b_pair = b_agent
        .get_selected_candidate_pair()
        .ok_or(Error::ErrNoCandidatePairs)?;
    assert_eq!(a_pair.local.addr(), b_pair.remote.addr());
    assert_eq!(a_pair.remote.addr(), b_pair.local.addr());

    assert_eq!(a_conn.local_addr()?, a_pair.local.addr());
    assert_eq!(a_conn.remote_addr(), Some(a_pair.remote.addr()));

    a_conn.send(b"hello").await?;
    let mut buf = vec![0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(1), b_conn.recv(&mut buf))
        .await
        .map_err(|_| Error::Other("recv timed out".to_owned()))??;
    assert_eq!(&buf[..n], b"hello");

    assert_eq!(a_agent.get_bytes_sent(), 5);
    assert_eq!(b_agent.get_bytes_received(), 5);

    a_agent.close().await?;
    b_agent.close().await?;

    assert!(a_conn.send(b"late").await.is_err());
    assert!(b_conn.recv(&mut buf).await.is_err());

    Ok(())
}

#[tokio::test]
async fn test_connectivity_lite() -> Result<()> {
    let a_agent = gathered_agent(loopback_config()).await?;
    let b_agent = gathered_agent(AgentConfig {
        lite: true,
        ..loopback_config()
    })
    .await?;

    let (_a_conn, _b_conn) = connect_pair(&a_agent, &b_agent).await?;

    let a_pair = a_agent
        .get_selected_candidate_pair()
        .ok_or(Error::ErrNoCandidatePairs)?;
    let b_pair = b_agent
        .get_selected_candidate_pair()
        .ok_or(Error::ErrNoCandidatePairs)?;
    assert_eq!(a_pair.local.addr(), b_pair.remote.addr());
    assert_eq!(a_pair.remote.addr(), b_pair.local.addr());

    a_agent.close().await?;
    b_agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_duplicate_remote_candidate_single_pair() -> Result<()> {
    let a_agent = gathered_agent(loopback_config()).await?;
    let b_agent = gathered_agent(loopback_config()).await?;

    exchange_candidates(&b_agent, &a_agent).await?;
    exchange_candidates(&b_agent, &a_agent).await?;

    let locals = a_agent.get_local_candidates().await?.len();
    let remotes = b_agent.get_local_candidates().await?.len();
    let pairs = a_agent.get_candidate_pairs_stats().await.len();
    assert_eq!(pairs, locals * remotes);
    assert_eq!(a_agent.get_remote_candidates_stats().await.len(), remotes);

    a_agent.close().await?;
    b_agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_accept_canceled_by_caller() -> Result<()> {
    let a_agent = gathered_agent(loopback_config()).await?;

    let (cancel_tx, cancel_rx) = mpsc::channel(1);
    let a = Arc::clone(&a_agent);
    let accepting = tokio::spawn(async move {
        a.accept(cancel_rx, "remoteUfrag".to_owned(), "remotePwd".to_owned())
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = cancel_tx.send(()).await;

    let result = accepting
        .await
        .map_err(|err| Error::Other(err.to_string()))?;
    assert!(matches!(result, Err(Error::ErrCanceledByCaller)));

    a_agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_unblocks_connect() -> Result<()> {
    let a_agent = gathered_agent(loopback_config()).await?;

    let (_cancel_tx, cancel_rx) = mpsc::channel(1);
    let a = Arc::clone(&a_agent);
    let connecting = tokio::spawn(async move {
        a.connect(cancel_rx, "remoteUfrag".to_owned(), "remotePwd".to_owned())
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    a_agent.close().await?;

    let result = tokio::time::timeout(Duration::from_secs(1), connecting)
        .await
        .map_err(|_| Error::Other("connect did not return".to_owned()))?
        .map_err(|err| Error::Other(err.to_string()))?;
    assert!(matches!(result, Err(Error::ErrClosed)));

    Ok(())
}

#[tokio::test]
async fn test_selected_pair_change_callback() -> Result<()> {
    let a_agent = gathered_agent(loopback_config()).await?;
    let b_agent = gathered_agent(loopback_config()).await?;

    let (pair_tx, mut pair_rx) = mpsc::unbounded_channel();
    a_agent.on_selected_candidate_pair_change(Box::new(
        move |local: &Arc<Candidate>, remote: &Arc<Candidate>| {
            let _ = pair_tx.send((local.addr(), remote.addr()));
            Box::pin(async move {})
        },
    ));

    let (_a_conn, _b_conn) = connect_pair(&a_agent, &b_agent).await?;

    let (local, remote) = tokio::time::timeout(Duration::from_secs(1), pair_rx.recv())
        .await
        .ok()
        .flatten()
        .ok_or(Error::ErrNoCandidatePairs)?;
    let selected = a_agent
        .get_selected_candidate_pair()
        .ok_or(Error::ErrNoCandidatePairs)?;
    assert_eq!(local, selected.local.addr());
    assert_eq!(remote, selected.remote.addr());

    a_agent.close().await?;
    b_agent.close().await?;
    Ok(())
}
