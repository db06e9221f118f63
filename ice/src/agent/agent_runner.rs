use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;

use super::agent_internal::*;
use super::agent_transport::AgentConn;
use super::*;

/// Resolves once the agent behind `closed_rx` has been closed.
pub(crate) async fn wait_closed(mut closed_rx: watch::Receiver<bool>) {
    let _ = closed_rx.wait_for(|closed| *closed).await;
}

/// Serializes every mutation of the agent state. Callers hand a closure to `run`, which executes
/// it with exclusive access and never while the agent is closed.
#[derive(Clone)]
pub(crate) struct AgentRunner {
    pub(crate) internal: Arc<Mutex<AgentInternal>>,
    pub(crate) agent_conn: Arc<AgentConn>,
    pub(crate) closed_rx: watch::Receiver<bool>,
}

impl AgentRunner {
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Runs `f` against the agent state. Fails with `ErrClosed` if the agent is or becomes closed
    /// before `f` gets its turn.
    pub(crate) async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut AgentInternal) -> R,
    {
        if self.is_closed() {
            return Err(Error::ErrClosed);
        }

        let mut ai = tokio::select! {
            ai = self.internal.lock() => ai,
            _ = wait_closed(self.closed_rx.clone()) => return Err(Error::ErrClosed),
        };

        if self.is_closed() {
            return Err(Error::ErrClosed);
        }

        Ok(f(&mut ai))
    }

    /// Registers a local candidate and starts reading from its socket. Candidates that are
    /// duplicates, or that arrive after close, are closed instead.
    pub(crate) async fn add_candidate(&self, c: Arc<Candidate>) -> Result<()> {
        let added = match self.run(|ai| ai.add_candidate(&c)).await {
            Ok(added) => added,
            Err(err) => {
                if let Err(close_err) = c.close().await {
                    log::warn!("Failed to close candidate {}: {}", c, close_err);
                }
                return Err(err);
            }
        };

        if added {
            self.start_candidate(c);
        } else {
            log::debug!("Ignoring duplicate local candidate {}", c);
            if let Err(err) = c.close().await {
                log::warn!("Failed to close duplicate candidate {}: {}", c, err);
            }
        }

        Ok(())
    }

    fn start_candidate(&self, c: Arc<Candidate>) {
        let runner = self.clone();
        tokio::spawn(async move {
            runner.recv_loop(c).await;
        });
    }

    async fn recv_loop(&self, c: Arc<Candidate>) {
        let conn = match &c.conn {
            Some(conn) => Arc::clone(conn),
            None => return,
        };

        let mut buf = vec![0u8; RECEIVE_MTU];
        loop {
            let (n, src_addr) = tokio::select! {
                result = conn.recv_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(err) => {
                        if !c.is_closed() {
                            log::warn!("{}: failed to read from candidate: {}", c, err);
                        }
                        return;
                    }
                },
                _ = wait_closed(c.closed_rx()) => return,
            };

            let is_app_data = match self
                .run(|ai| ai.handle_inbound_candidate_msg(&c, &buf[..n], src_addr))
                .await
            {
                Ok(is_app_data) => is_app_data,
                Err(_) => return,
            };

            if is_app_data {
                self.agent_conn.deliver(&buf[..n]).await;
            }
        }
    }

    /// Spawns the loop driving connectivity checks, keepalives and timeouts. A round runs every
    /// `task_loop_interval` or as soon as one is requested through `force_candidate_contact_rx`.
    pub(crate) fn start_task_loop(&self, mut force_candidate_contact_rx: mpsc::Receiver<()>) {
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = match runner.run(|ai| ai.task_loop_interval()).await {
                    Ok(interval) => interval,
                    Err(_) => break,
                };

                tokio::select! {
                    _ = sleep(interval) => {},
                    forced = force_candidate_contact_rx.recv() => {
                        if forced.is_none() {
                            break;
                        }
                    },
                    _ = wait_closed(runner.closed_rx.clone()) => break,
                }

                if runner.run(|ai| ai.contact()).await.is_err() {
                    break;
                }
            }
            log::trace!("task loop exited");
        });
    }
}
