//! Stdio inbound transport.
//!
//! Stdout carries protocol frames only; all diagnostics go to stderr via
//! tracing. The session ends at stdin EOF.

use crate::rpc;
use async_trait::async_trait;
use relay_core::RelayResult;
use relay_proxy::{Aggregator, InboundServer};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct StdioServer {
    aggregator: Arc<Aggregator>,
    outbound: mpsc::Sender<String>,
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StdioServer {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(64);
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            aggregator,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            done_tx,
            done_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl InboundServer for StdioServer {
    async fn start(&self) -> RelayResult<()> {
        let Some(mut outbound_rx) = self.outbound_rx.lock().await.take() else {
            return Ok(()); // already started
        };

        // Single writer task: responses and notifications share stdout.
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(frame) = outbound_rx.recv().await {
                let line = format!("{frame}\n");
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.flush().await.is_err() {
                    break;
                }
            }
        });

        let aggregator = self.aggregator.clone();
        let outbound = self.outbound.clone();
        let done_tx = self.done_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if let Some(response) = rpc::dispatch_raw(&aggregator, line).await {
                            if outbound.send(response.to_string()).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed, ending session");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            let _ = done_tx.send(true);
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(writer);
        tasks.push(reader);
        info!("stdio server started");
        Ok(())
    }

    async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let _ = self.done_tx.send(true);
    }

    async fn refresh_capabilities(&self) {
        let frame = rpc::tools_list_changed_notification().to_string();
        if self.outbound.send(frame).await.is_err() {
            warn!("tool list announcement dropped, writer gone");
        }
    }

    async fn wait(&self) {
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}
