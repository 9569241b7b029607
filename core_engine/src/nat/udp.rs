use async_trait::async_trait;
use mesh_dialog::{PingTarget, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{NatError, NatPinger, NatResult, NatSettings};

/// Largest gap between two pings
const MAX_SPACING: Duration = Duration::from_secs(2);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Ping,
    Pong,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct PingPacket {
    session_id: SessionId,
    kind: PacketKind,
}

/// Sessions being punched, with the peer address once a packet arrived.
type Seen = watch::Sender<HashMap<SessionId, Option<SocketAddr>>>;

/// Punches over a single UDP socket shared by all sessions.
///
/// A background task answers every `Ping` with a `Pong`, and records where
/// pings came from for sessions with a punch in progress. A punch succeeds
/// once the peer's packet for that session has been seen.
pub struct UdpNatPinger {
    socket: Arc<UdpSocket>,
    advertised: SocketAddr,
    settings: NatSettings,
    seen: Arc<Seen>,
    receiver: JoinHandle<()>,
}

impl UdpNatPinger {
    /// Bind the punch socket. `advertise_ip` replaces an unspecified bind IP
    /// in the advertised target.
    pub async fn bind(settings: NatSettings, advertise_ip: Option<IpAddr>) -> NatResult<Self> {
        let socket = Arc::new(UdpSocket::bind(&settings.bind_address).await?);
        let local = socket.local_addr()?;
        let advertised = if local.ip().is_unspecified() {
            SocketAddr::new(
                advertise_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                local.port(),
            )
        } else {
            local
        };

        let (seen, _) = watch::channel(HashMap::new());
        let seen = Arc::new(seen);
        let receiver = tokio::spawn(receive_loop(Arc::clone(&socket), Arc::clone(&seen)));

        info!(local = %local, advertised = %advertised, "NAT pinger listening");
        Ok(Self {
            socket,
            advertised,
            settings,
            seen,
            receiver,
        })
    }

    async fn send(&self, to: SocketAddr, session_id: &SessionId, kind: PacketKind) -> NatResult<()> {
        let packet = bincode::serialize(&PingPacket {
            session_id: session_id.clone(),
            kind,
        })?;
        self.socket.send_to(&packet, to).await?;
        Ok(())
    }

    /// Bounded number of pings with doubling spacing.
    async fn send_pings(&self, session_id: &SessionId, to: SocketAddr) {
        let mut spacing = self.settings.initial_spacing;
        for attempt in 1..=self.settings.max_attempts {
            trace!(session_id = %session_id, peer = %to, attempt, "Sending ping");
            if let Err(e) = self.send(to, session_id, PacketKind::Ping).await {
                warn!(session_id = %session_id, peer = %to, attempt, "Ping failed: {}", e);
            }
            tokio::time::sleep(spacing).await;
            spacing = (spacing * 2).min(MAX_SPACING);
        }
        debug!(session_id = %session_id, peer = %to, "Ping attempts exhausted");
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, seen: Arc<Seen>) {
    let mut buf = vec![0u8; 1500];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors surface here on some platforms; keep listening
                debug!("Punch socket receive error: {}", e);
                continue;
            }
        };

        let packet: PingPacket = match bincode::deserialize(&buf[..len]) {
            Ok(packet) => packet,
            Err(_) => {
                trace!(peer = %from, len, "Ignoring non-ping datagram");
                continue;
            }
        };

        if packet.kind == PacketKind::Ping {
            if let Ok(pong) = bincode::serialize(&PingPacket {
                session_id: packet.session_id.clone(),
                kind: PacketKind::Pong,
            }) {
                let _ = socket.send_to(&pong, from).await;
            }
        }

        seen.send_if_modified(|seen| match seen.get_mut(&packet.session_id) {
            Some(peer) if peer.is_none() => {
                *peer = Some(from);
                true
            }
            _ => false,
        });
    }
}

#[async_trait]
impl NatPinger for UdpNatPinger {
    fn local_target(&self) -> Option<PingTarget> {
        Some(PingTarget {
            address: self.advertised,
        })
    }

    async fn punch(&self, session_id: &SessionId, target: PingTarget) -> NatResult<SocketAddr> {
        self.seen.send_modify(|seen| {
            seen.insert(session_id.clone(), None);
        });
        let mut rx = self.seen.subscribe();
        let pings = self.send_pings(session_id, target.address);
        tokio::pin!(pings);
        let mut pinging = true;

        let outcome = tokio::time::timeout(self.settings.timeout, async {
            loop {
                tokio::select! {
                    seen = rx.wait_for(|seen| matches!(seen.get(session_id), Some(Some(_)))) => {
                        return seen.ok().and_then(|seen| seen.get(session_id).copied().flatten());
                    }
                    _ = &mut pings, if pinging => pinging = false,
                }
            }
        })
        .await;

        self.seen
            .send_if_modified(|seen| seen.remove(session_id).is_some());

        match outcome {
            Ok(Some(peer)) => {
                info!(session_id = %session_id, peer = %peer, "NAT hole punched");
                Ok(peer)
            }
            Ok(None) => Err(NatError::NatTraversalFailed("pinger stopped".into())),
            Err(_) => Err(NatError::NatTraversalFailed(format!(
                "no reply from {} within {:?}",
                target.address, self.settings.timeout
            ))),
        }
    }
}

impl Drop for UdpNatPinger {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(timeout_ms: u64) -> NatSettings {
        NatSettings {
            bind_address: "127.0.0.1:0".into(),
            timeout: Duration::from_millis(timeout_ms),
            max_attempts: 5,
            initial_spacing: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn both_sides_punch_through() {
        let a = UdpNatPinger::bind(settings(2_000), None).await.unwrap();
        let b = UdpNatPinger::bind(settings(2_000), None).await.unwrap();
        let session = SessionId::from("s-1");

        let a_target = a.local_target().unwrap();
        let b_target = b.local_target().unwrap();
        let (from_b, from_a) = tokio::join!(a.punch(&session, b_target), b.punch(&session, a_target));

        assert_eq!(from_b.unwrap(), b_target.address);
        assert_eq!(from_a.unwrap(), a_target.address);
    }

    #[tokio::test]
    async fn silent_peer_fails_traversal() {
        let pinger = UdpNatPinger::bind(settings(100), None).await.unwrap();
        // Bound but never answers
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = PingTarget {
            address: silent.local_addr().unwrap(),
        };

        let err = pinger
            .punch(&SessionId::from("s-1"), target)
            .await
            .unwrap_err();
        assert!(matches!(err, NatError::NatTraversalFailed(_)));
    }

    #[tokio::test]
    async fn unspecified_bind_advertises_given_ip() {
        let mut settings = settings(100);
        settings.bind_address = "0.0.0.0:0".into();
        let pinger = UdpNatPinger::bind(settings, Some("192.0.2.7".parse().unwrap()))
            .await
            .unwrap();

        let target = pinger.local_target().unwrap();
        assert_eq!(target.address.ip(), "192.0.2.7".parse::<IpAddr>().unwrap());
        assert_ne!(target.address.port(), 0);
    }
}
