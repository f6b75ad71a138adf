//! UDP transport (C2).
//!
//! Binds a single socket, tracks the last-RX peer and the NAT-safe TX host,
//! and hands decoded telegrams off to a channel so the receive loop never
//! blocks on downstream processing. Grounded on `uwb_hub.rs::start_uwb_hub`
//! (bind-or-warn-and-return, never crash) and its `process_packet` shape.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::codec::{self, Telegram};
use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone)]
pub struct PeerState {
    /// host:port of the last received frame.
    pub peer_rx: Option<SocketAddr>,
    /// destination for outbound frames; seeded from config, updated by RX.
    pub peer_tx: SocketAddr,
}

/// Owns the socket and peer-tracking state. `send_raw`/`read_status` are
/// the only writers and both are only ever called from the scheduler (C3)
/// so pacing is always honored.
pub struct Transport {
    socket: Option<Arc<UdpSocket>>,
    peers: RwLock<PeerState>,
    gateway_host: String,
    configured_port: u16,
}

impl Transport {
    pub fn new(config: &Config) -> BridgeResult<Self> {
        let configured_addr: SocketAddr =
            format!("{}:{}", config.gateway_host, config.gateway_port)
                .parse()
                .map_err(|_| BridgeError::ValidationError("invalid gateway_host/port".into()))?;
        Ok(Self {
            socket: None,
            peers: RwLock::new(PeerState {
                peer_rx: None,
                peer_tx: configured_addr,
            }),
            gateway_host: config.gateway_host.clone(),
            configured_port: config.gateway_port,
        })
    }

    /// Binds the local UDP port. On failure this logs and leaves the
    /// transport unready rather than panicking — matching the teacher's
    /// posture of never crashing the process over device I/O.
    pub async fn bind(&mut self, local_port: u16) {
        match UdpSocket::bind(("0.0.0.0", local_port)).await {
            Ok(sock) => {
                self.socket = Some(Arc::new(sock));
            }
            Err(e) => {
                warn!("transport: bind on port {local_port} failed: {e} — UDP not ready");
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.socket.is_some()
    }

    /// Runs the receive loop, decoding frames and forwarding them on `tx`.
    /// Never returns an error — I/O and decode failures are logged and the
    /// loop continues.
    pub async fn run_receive_loop(&self, tx: mpsc::Sender<(Telegram, SocketAddr)>) {
        let Some(socket) = self.socket.clone() else {
            warn!("transport: receive loop not started — socket unbound");
            return;
        };
        let mut buf = [0u8; 1024];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("transport: recv_from failed: {e}");
                    continue;
                }
            };
            self.note_rx_peer(from).await;

            match codec::decode(&buf[..len]) {
                Ok(telegram) => {
                    if tx.send((telegram, from)).await.is_err() {
                        debug!("transport: receive channel closed, stopping loop");
                        return;
                    }
                }
                Err(_) => {
                    debug!("transport: dropped malformed frame from {from}");
                }
            }
        }
    }

    /// Updates `peer_tx` from an observed RX host, applying the NAT guard:
    /// a host equal to the configured gateway's own address space is never
    /// adopted (it would mean we're seeing the container's own NAT host
    /// rather than the real device), and only the *host* is adopted —
    /// the configured port is kept since gateways often emit from a
    /// random source port.
    async fn note_rx_peer(&self, from: SocketAddr) {
        let mut peers = self.peers.write().await;
        peers.peer_rx = Some(from);

        if from.ip().to_string() == self.gateway_host {
            // looks NATed / self — matches existing peer_tx, nothing to adopt
            return;
        }
        peers.peer_tx = SocketAddr::new(from.ip(), self.configured_port);
    }

    pub async fn peer_tx(&self) -> SocketAddr {
        self.peers.read().await.peer_tx
    }

    /// Sends a raw datagram to the current `peer_tx`. Best-effort: errors
    /// are logged, never surfaced, consistent with spec's UDP error model.
    pub async fn send_raw(&self, bytes: &[u8]) -> BridgeResult<()> {
        let socket = self.socket.as_ref().ok_or(BridgeError::TransportNotReady)?;
        let dest = self.peer_tx().await;
        if let Err(e) = socket.send_to(bytes, dest).await {
            warn!("transport: send to {dest} failed: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            gateway_host: "10.0.0.5".into(),
            gateway_port: 6000,
            local_udp_port: 0,
            mqtt: crate::config::MqttConfig {
                host: "localhost".into(),
                port: 1883,
                username: None,
                password: None,
                prefix: "buspro/".into(),
            },
            auth: crate::config::AuthConfig {
                mode: crate::config::AuthMode::None,
                token: None,
                username: None,
                password: None,
                user_auth: false,
            },
            debug: false,
            debug_telegram: false,
            ingress: false,
            state_path: "state.json".into(),
            http_bind: "0.0.0.0:0".into(),
        }
    }

    #[tokio::test]
    async fn nat_guarded_host_is_not_adopted() {
        let config = test_config();
        let transport = Transport::new(&config).unwrap();
        let nat_addr: SocketAddr = "10.0.0.5:55555".parse().unwrap();
        transport.note_rx_peer(nat_addr).await;
        let peer_tx = transport.peer_tx().await;
        assert_eq!(peer_tx.port(), 6000);
        assert_eq!(peer_tx.ip().to_string(), "10.0.0.5");
    }

    #[tokio::test]
    async fn real_peer_host_is_adopted_keeping_configured_port() {
        let config = test_config();
        let transport = Transport::new(&config).unwrap();
        let real_addr: SocketAddr = "192.168.1.50:44123".parse().unwrap();
        transport.note_rx_peer(real_addr).await;
        let peer_tx = transport.peer_tx().await;
        assert_eq!(peer_tx.ip().to_string(), "192.168.1.50");
        assert_eq!(peer_tx.port(), 6000);
    }
}
