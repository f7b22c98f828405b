use crate::broadcast::types::WSEvent;
use crate::config::broadcast::WebsocketConfig;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const ORDER_HISTORY_CAP: usize = 50;

/// Last-known stateful events replayed to late subscribers.
#[derive(Default)]
struct EventCache {
    config: Option<WSEvent>,
    status: Option<WSEvent>,
    grid_levels: Option<WSEvent>,
    market: Option<WSEvent>,
    orders: VecDeque<WSEvent>,
    alerts: VecDeque<WSEvent>,
}

impl EventCache {
    fn remember(&mut self, event: &WSEvent) {
        match event {
            WSEvent::Config(_) => self.config = Some(event.clone()),
            WSEvent::Status(_) => self.status = Some(event.clone()),
            WSEvent::GridLevels(_) => self.grid_levels = Some(event.clone()),
            WSEvent::MarketUpdate(_) => self.market = Some(event.clone()),
            WSEvent::OrderUpdate(_) => push_capped(&mut self.orders, event.clone()),
            WSEvent::RiskAlert(_) => push_capped(&mut self.alerts, event.clone()),
            WSEvent::Error(_) => {}
        }
    }

    fn replay(&self) -> Vec<WSEvent> {
        [&self.config, &self.status, &self.grid_levels, &self.market]
            .into_iter()
            .flatten()
            .cloned()
            .chain(self.alerts.iter().cloned())
            .chain(self.orders.iter().cloned())
            .collect()
    }
}

fn push_capped(queue: &mut VecDeque<WSEvent>, event: WSEvent) {
    if queue.len() >= ORDER_HISTORY_CAP {
        queue.pop_front();
    }
    queue.push_back(event);
}

/// Fan-out of engine events to the WebSocket server and in-process subscribers.
#[derive(Clone)]
pub struct StatusBroadcaster {
    sender: broadcast::Sender<WSEvent>,
    cache: Arc<Mutex<EventCache>>,
}

impl StatusBroadcaster {
    pub fn new(config: Option<WebsocketConfig>) -> Self {
        let (sender, _) = broadcast::channel(100);
        let cache = Arc::new(Mutex::new(EventCache::default()));

        if let Some(conf) = config {
            let sender = sender.clone();
            let cache = cache.clone();
            tokio::spawn(async move {
                if let Err(e) = run_server(conf.host, conf.port, sender, cache).await {
                    error!("WebSocket Server failed: {}", e);
                }
            });
        }

        Self { sender, cache }
    }

    pub fn send(&self, event: WSEvent) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remember(&event);
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WSEvent> {
        self.sender.subscribe()
    }

    /// Cached events in replay order.
    pub fn snapshot(&self) -> Vec<WSEvent> {
        self.cache
            .lock()
            .map(|cache| cache.replay())
            .unwrap_or_default()
    }
}

async fn run_server(
    host: String,
    port: u16,
    sender: broadcast::Sender<WSEvent>,
    cache: Arc<Mutex<EventCache>>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket Status Server listening on: ws://{}", addr);

    while let Ok((stream, peer_addr)) = listener.accept().await {
        let rx = sender.subscribe();
        let initial = cache.lock().map(|c| c.replay()).unwrap_or_default();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, rx, initial).await {
                warn!("Error handling connection from {}: {}", peer_addr, e);
            }
        });
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut rx: broadcast::Receiver<WSEvent>,
    initial: Vec<WSEvent>,
) -> anyhow::Result<()> {
    info!("New WebSocket connection: {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    for event in initial {
        ws_sender
            .send(Message::Text(serde_json::to_string(&event)?))
            .await?;
    }

    // Clients only listen; incoming frames are drained to detect disconnects.
    loop {
        tokio::select! {
            msg_res = rx.recv() => {
                match msg_res {
                    Ok(event) => {
                        ws_sender.send(Message::Text(serde_json::to_string(&event)?)).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!("Client {} lagged by {} messages", peer_addr, count);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            client_msg = ws_receiver.next() => {
                match client_msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client {} disconnected", peer_addr);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
