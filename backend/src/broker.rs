//! Broker client — auto-reconnecting MQTT transport for inbound frames.
//! Explicit `{disconnected, connecting, connected, draining}` state machine
//! with linear backoff, per SPEC_FULL.md §2/§9 (the teacher's UWB hub is a
//! raw UDP listener with no broker concept; this module is grounded directly
//! on `rumqttc`'s own connection-loop shape, since nothing in the retrieved
//! pack exercises it).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

pub struct IncomingFrame {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct BrokerClient {
    client: AsyncClient,
    state: std::sync::Mutex<ConnectionState>,
    draining: AtomicBool,
}

impl BrokerClient {
    /// Connects and spawns the background poll loop. Returns the client
    /// handle (for subscribe/unsubscribe) and a channel of incoming frames.
    pub fn connect(
        client_id: &str,
        host: &str,
        port: u16,
        user: Option<&str>,
        password: Option<&str>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<IncomingFrame>) {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(password)) = (user, password) {
            options.set_credentials(user, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 256);
        let (tx, rx) = mpsc::unbounded_channel();

        let hub = Arc::new(Self {
            client,
            state: std::sync::Mutex::new(ConnectionState::Connecting),
            draining: AtomicBool::new(false),
        });

        let poll_hub = hub.clone();
        tokio::spawn(poll_hub.poll_loop(eventloop, tx));

        (hub, rx)
    }

    async fn poll_loop(self: Arc<Self>, mut eventloop: rumqttc::EventLoop, tx: mpsc::UnboundedSender<IncomingFrame>) {
        let mut backoff = Duration::from_secs(5);
        loop {
            if self.draining.load(Ordering::Relaxed) {
                *self.state.lock().unwrap() = ConnectionState::Draining;
                return;
            }

            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    *self.state.lock().unwrap() = ConnectionState::Connected;
                    backoff = Duration::from_secs(5);
                    info!("broker connected");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let frame = IncomingFrame {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, backoff_secs = backoff.as_secs(), "broker connection error, reconnecting");
                    *self.state.lock().unwrap() = ConnectionState::Disconnected;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff + Duration::from_secs(5)).min(Duration::from_secs(10));
                    *self.state.lock().unwrap() = ConnectionState::Connecting;
                }
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub async fn subscribe(&self, topic: &str) {
        if let Err(err) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
            warn!(topic, error = %err, "subscribe failed");
        }
    }

    pub async fn unsubscribe(&self, topic: &str) {
        if let Err(err) = self.client.unsubscribe(topic).await {
            warn!(topic, error = %err, "unsubscribe failed");
        }
    }

    /// Cooperative shutdown: marks the poll loop draining so it exits on its
    /// next iteration, then disconnects the underlying client.
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::Relaxed);
        let _ = self.client.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ramps_linearly_and_caps_at_ten_seconds() {
        let mut backoff = Duration::from_secs(5);
        let mut seen = vec![backoff];
        for _ in 0..4 {
            backoff = (backoff + Duration::from_secs(5)).min(Duration::from_secs(10));
            seen.push(backoff);
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
    }
}
