use crate::config::Config;
use crate::pipeline::MessagePipeline;
use crate::state::{BridgeStats, ConnectionState};
use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// After this many consecutive failed attempts the retry log escalates from
/// warn to error so an operator is alerted. Retries themselves never stop.
const ESCALATE_AFTER_ATTEMPTS: u32 = 8;

/// Exponential reconnect delay: 1s doubling up to 60s, reset on a successful
/// connection.
#[derive(Debug)]
pub struct Backoff {
    attempts: u32,
}

impl Backoff {
    const BASE: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    pub fn next(&mut self) -> Duration {
        let exp = self.attempts.min(6);
        self.attempts = self.attempts.saturating_add(1);
        Self::BASE.saturating_mul(1u32 << exp).min(Self::MAX)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

fn mqtt_options(config: &Config) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    if let Some(ca_path) = &config.mqtt_ca_cert {
        let ca = std::fs::read(ca_path)
            .with_context(|| format!("read CA certificate {}", ca_path.display()))?;
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }
    Ok(options)
}

/// Build one broker session: a fresh client plus exactly one subscription for
/// the configured topic. Every reconnect goes through here again, so drops
/// can never accumulate duplicate subscriptions.
async fn connect_session(config: &Config, qos: QoS) -> Result<(AsyncClient, EventLoop)> {
    let options = mqtt_options(config)?;
    let (client, eventloop) = AsyncClient::new(options, 32);
    // Queued until the session is up; delivered right after CONNACK.
    client
        .subscribe(config.mqtt_topic.clone(), qos)
        .await
        .context("queue subscribe request")?;
    Ok((client, eventloop))
}

/// Broker connection loop. Each iteration builds a fresh session via
/// `connect_session`, then polls the event loop until the connection drops.
/// A failure before the first successful connection is fatal; afterwards the
/// loop retries forever with backoff.
pub async fn run_listener(
    config: Config,
    pipeline: MessagePipeline,
    stats: Arc<BridgeStats>,
) -> Result<()> {
    let qos = qos_from_level(config.mqtt_qos);
    let mut backoff = Backoff::new();
    let mut ever_connected = false;

    loop {
        stats.broker.set(ConnectionState::Connecting);
        let (_client, mut eventloop) = match connect_session(&config, qos).await {
            Ok(session) => session,
            Err(err) => {
                stats.broker.set(ConnectionState::Failed);
                if !ever_connected {
                    return Err(err).context("initial MQTT session setup failed");
                }
                retry_delay(&mut backoff, &format!("{err:#}")).await;
                continue;
            }
        };

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    tracing::info!(
                        host = %config.mqtt_host,
                        port = config.mqtt_port,
                        topic = %config.mqtt_topic,
                        code = ?ack.code,
                        "connected to MQTT broker; subscription active"
                    );
                    stats.broker.set(ConnectionState::Connected);
                    ever_connected = true;
                    backoff.reset();
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    pipeline.handle_message(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    stats.broker.set(ConnectionState::Disconnected);
                    if !ever_connected {
                        return Err(err).context("initial MQTT connect failed");
                    }
                    retry_delay(&mut backoff, &err.to_string()).await;
                    break;
                }
            }
        }
    }
}

async fn retry_delay(backoff: &mut Backoff, error: &str) {
    let delay = backoff.next();
    if backoff.attempts() > ESCALATE_AFTER_ATTEMPTS {
        tracing::error!(
            error,
            attempts = backoff.attempts(),
            delay_secs = delay.as_secs(),
            "MQTT connection still down; reconnecting"
        );
    } else {
        tracing::warn!(
            error,
            delay_secs = delay.as_secs(),
            "MQTT connection dropped; reconnecting"
        );
    }
    sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::{connect_session, qos_from_level, Backoff};
    use crate::config::Config;
    use rumqttc::{Event, Incoming, QoS};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut backoff = Backoff::new();
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }

    #[test]
    fn qos_levels_map_to_protocol_levels() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    fn loopback_config(port: u16) -> Config {
        Config {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: port,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: "bridge-test".to_string(),
            mqtt_topic: "sensors/all/room1".to_string(),
            mqtt_qos: 1,
            mqtt_ca_cert: None,
            mqtt_keepalive_secs: 30,
            influx_url: "http://127.0.0.1:9".to_string(),
            influx_token: "token".to_string(),
            influx_org: "org".to_string(),
            influx_bucket: "bucket".to_string(),
            write_timeout_ms: 100,
            device_id: "ESP32".to_string(),
        }
    }

    /// Minimal MQTT 3.1.1 broker side for one connection: acks CONNECT,
    /// counts and acks SUBSCRIBE, answers pings. Every packet the client
    /// sends here fits a single-byte remaining length.
    async fn serve_connection(mut socket: TcpStream, subscriptions: Arc<AtomicUsize>) {
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);
            while pending.len() >= 2 {
                if pending[1] & 0x80 != 0 {
                    return;
                }
                let total = 2 + pending[1] as usize;
                if pending.len() < total {
                    break;
                }
                let reply = match pending[0] >> 4 {
                    // CONNECT -> CONNACK (accepted)
                    1 => Some(vec![0x20, 0x02, 0x00, 0x00]),
                    // SUBSCRIBE -> SUBACK echoing the packet id, granted QoS 1
                    8 => {
                        subscriptions.fetch_add(1, Ordering::SeqCst);
                        Some(vec![0x90, 0x03, pending[2], pending[3], 0x01])
                    }
                    // PINGREQ -> PINGRESP
                    12 => Some(vec![0xd0, 0x00]),
                    _ => None,
                };
                if let Some(reply) = reply {
                    if socket.write_all(&reply).await.is_err() {
                        return;
                    }
                }
                pending.drain(..total);
            }
        }
    }

    #[tokio::test]
    async fn reconnects_keep_exactly_one_subscription_per_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let subscriptions = Arc::new(AtomicUsize::new(0));

        let broker_subs = subscriptions.clone();
        let broker = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(socket, broker_subs.clone()));
            }
        });

        let config = loopback_config(port);
        for _ in 0..3 {
            let (client, mut eventloop) = connect_session(&config, QoS::AtLeastOnce)
                .await
                .expect("session");
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Incoming::SubAck(_))) => break,
                        Ok(_) => {}
                        Err(err) => panic!("connection failed before suback: {err}"),
                    }
                }
            })
            .await
            .expect("suback in time");
            // Drop the session, simulating a broken connection.
            let _ = client.disconnect().await;
            drop(eventloop);
        }

        assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
        broker.abort();
    }
}
