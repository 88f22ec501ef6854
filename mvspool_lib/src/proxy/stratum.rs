// Copyright (C) 2024, 2025 MVSPool Developers (see AUTHORS)
//
// This file is part of MVSPool
//
// MVSPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// MVSPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// MVSPool. If not, see <https://www.gnu.org/licenses/>.

use super::messages::{ErrorReply, JsonRpcRequest, JsonRpcResponse};
use super::session::Session;
use super::{valid_login, ProxyServer};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

/// Buffer size for per-client broadcast channels.
const MSG_CHANNEL_SIZE: usize = 16;

struct ClientChannels {
    message_tx: mpsc::Sender<Arc<String>>,
    shutdown_tx: oneshot::Sender<()>,
}

enum Command {
    Add {
        id: String,
        response: oneshot::Sender<(mpsc::Receiver<Arc<String>>, oneshot::Receiver<()>)>,
    },
    Remove {
        id: String,
    },
    SendToAll {
        message: Arc<String>,
    },
    Count {
        response: oneshot::Sender<usize>,
    },
}

/// Handle to one tier's connection registry.
///
/// The registry is an actor so broadcast iteration never contends with
/// accept-path inserts; each client's socket writes stay on its own task,
/// keeping sends serialized per session.
#[derive(Clone)]
pub struct ConnectionsHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ConnectionsHandle {
    pub async fn add(&self, id: String) -> (mpsc::Receiver<Arc<String>>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Add { id, response: tx }).await;
        rx.await.expect("connections actor has been dropped")
    }

    pub async fn remove(&self, id: String) {
        let _ = self.cmd_tx.send(Command::Remove { id }).await;
    }

    /// Fire and forget broadcast to every registered session.
    pub async fn send_to_all(&self, message: Arc<String>) {
        let _ = self.cmd_tx.send(Command::SendToAll { message }).await;
    }

    pub async fn count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Count { response: tx }).await;
        rx.await.unwrap_or_default()
    }
}

#[derive(Default)]
struct Connections {
    clients: HashMap<String, ClientChannels>,
}

impl Connections {
    fn add(&mut self, id: String) -> (mpsc::Receiver<Arc<String>>, oneshot::Receiver<()>) {
        let (message_tx, message_rx) = mpsc::channel(MSG_CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.clients.insert(
            id,
            ClientChannels {
                message_tx,
                shutdown_tx,
            },
        );
        (message_rx, shutdown_rx)
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Add { id, response } => {
                    let _ = response.send(self.add(id));
                }
                Command::Remove { id } => {
                    self.clients.remove(&id);
                }
                Command::SendToAll { message } => {
                    for channels in self.clients.values() {
                        let _ = channels.message_tx.send(Arc::clone(&message)).await;
                    }
                }
                Command::Count { response } => {
                    let _ = response.send(self.clients.len());
                }
            }
        }
        // Dropping the clients map closes every shutdown channel.
        for (_, channels) in self.clients.drain() {
            let _ = channels.shutdown_tx.send(());
        }
    }
}

/// Starts the connections actor for one tier.
pub fn spawn_connections() -> ConnectionsHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    tokio::spawn(Connections::default().run(cmd_rx));
    ConnectionsHandle { cmd_tx }
}

/// Accept loop for one difficulty tier.
pub async fn listen_tier(
    server: Arc<ProxyServer>,
    tier_index: usize,
) -> Result<(), std::io::Error> {
    let tier_config = server.tiers[tier_index].config.clone();
    let listener = TcpListener::bind(&tier_config.listen).await?;
    info!(
        "stratum tier {} (diff {}) listening on {}",
        tier_index, tier_config.difficulty, tier_config.listen
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("new stratum connection from {}", addr);
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let session = Session::new(addr.ip().to_string(), tier_index);
                    if server.policy.is_banned(&session.ip) {
                        return;
                    }
                    let connections = server.tiers[tier_index].connections.clone();
                    let (message_rx, shutdown_rx) = connections.add(session.id.clone()).await;
                    let session_id = session.id.clone();
                    let (reader, writer) = stream.into_split();
                    let _ = handle_connection(
                        BufReader::new(reader),
                        writer,
                        server,
                        session,
                        message_rx,
                        shutdown_rx,
                    )
                    .await;
                    connections.remove(session_id).await;
                });
            }
            Err(e) => {
                warn!("stratum accept failed: {}", e);
            }
        }
    }
}

enum Flow {
    Continue,
    Close,
}

/// One persistent line-delimited JSON connection. Broadcast jobs arrive on
/// `message_rx`; the tier's idle timeout applies to reads.
async fn handle_connection<R, W>(
    reader: R,
    mut writer: W,
    server: Arc<ProxyServer>,
    mut session: Session,
    mut message_rx: mpsc::Receiver<Arc<String>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let max_line = server.config.proxy.limit_body_size;
    let timeout = server.tiers[session.tier].config.timeout;
    let mut framed = FramedRead::new(reader, LinesCodec::new_with_max_length(max_line));

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                break;
            }
            Some(message) = message_rx.recv() => {
                // Push new work only once the miner has identified itself.
                if session.login.is_some() {
                    writer.write_all(format!("{message}\n").as_bytes()).await?;
                    writer.flush().await?;
                }
            }
            line = tokio::time::timeout(timeout, framed.next()) => {
                match line {
                    Err(_) => {
                        info!("socket timeout from {}@{}", session.id, session.ip);
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!("malformed stratum line from {}: {}", session.ip, e);
                        server.policy.apply_malformed_policy(&session.ip);
                        break;
                    }
                    Ok(Some(Ok(line))) => {
                        if line.is_empty() {
                            continue;
                        }
                        match process_line(&server, &mut session, &line, &mut writer).await? {
                            Flow::Continue => {}
                            Flow::Close => break,
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

async fn process_line<W>(
    server: &ProxyServer,
    session: &mut Session,
    line: &str,
    writer: &mut W,
) -> Result<Flow, Box<dyn std::error::Error + Send + Sync>>
where
    W: AsyncWriteExt + Unpin,
{
    let req: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            warn!("malformed stratum request from {}: {}", session.ip, e);
            server.policy.apply_malformed_policy(&session.ip);
            return Ok(Flow::Close);
        }
    };

    let response = match req.method.as_str() {
        "eth_submitLogin" => Some(handle_login(server, session, &req)),
        _ if session.login.is_none() => Some(JsonRpcResponse::error(
            req.id.clone(),
            ErrorReply::new(-1, "You are not authorized"),
        )),
        _ => server.handle_message(session, &req).await,
    };

    match response {
        Some(response) => {
            let encoded = serde_json::to_string(&response)?;
            writer.write_all(format!("{encoded}\n").as_bytes()).await?;
            writer.flush().await?;
            Ok(Flow::Continue)
        }
        // Dropped request (missing id); the connection is done.
        None => Ok(Flow::Close),
    }
}

fn handle_login(
    server: &ProxyServer,
    session: &mut Session,
    req: &JsonRpcRequest,
) -> JsonRpcResponse {
    let params = req.string_params().unwrap_or_default();
    let Some(login) = params.first() else {
        server.policy.apply_malformed_policy(&session.ip);
        return JsonRpcResponse::error(req.id.clone(), ErrorReply::new(-1, "Invalid login"));
    };
    if !valid_login(login) {
        server.policy.apply_malformed_policy(&session.ip);
        return JsonRpcResponse::error(req.id.clone(), ErrorReply::new(-1, "Invalid login"));
    }
    if !server.policy.apply_login_policy(login, &session.ip) {
        return JsonRpcResponse::error(req.id.clone(), ErrorReply::new(-1, "You are blacklisted"));
    }

    session.login = Some(login.clone());
    session.worker = req.worker.clone().unwrap_or_default();
    info!("stratum miner connected {}@{}", login, session.ip);
    JsonRpcResponse::result(req.id.clone(), json!(true))
}

/// Watches the template cell and pushes fresh work to every tier's sessions.
/// One wake-up per new job: the refresher only swaps on header change.
pub async fn start_broadcaster(server: Arc<ProxyServer>) {
    let mut template_rx = server.subscribe_templates();
    while template_rx.changed().await.is_ok() {
        let template = match template_rx.borrow_and_update().clone() {
            Some(template) => template,
            None => continue,
        };
        for tier in &server.tiers {
            let work = json!({
                "id": 0,
                "jsonrpc": "2.0",
                "result": [
                    template.header.clone(),
                    template.seed.clone(),
                    tier.target_hex.clone(),
                    crate::util::to_hex(template.height),
                ],
            });
            tier.connections.send_to_all(Arc::new(work.to_string())).await;
        }
        debug!("broadcast height {} to stratum sessions", template.height);
    }
}
