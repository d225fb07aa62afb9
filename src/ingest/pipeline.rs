//! MQTT ingestion pipeline.
//!
//! Each pipeline owns one MQTT client, its connection, and a dedicated receive
//! thread driving a [`Dispatcher`]. The connection is established lazily by
//! the receive loop: `start` never fails because the broker is unreachable.
//! Connection errors are logged and retried with [`Backoff`]; the topic set is
//! re-subscribed on every `ConnAck`.
//!
//! Until a `ConnAck` arrives the loop waits longer than the connect timeout,
//! so a slow handshake is never cut short by the stop-flag poll. Once
//! connected it polls in short slices.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rumqttc::{
    Client, Connection, Event, MqttOptions, Packet, QoS, RecvTimeoutError, SubscribeFilter,
};

use crate::core::config::{BrokerConfig, ReconnectConfig};
use crate::core::errors::{Result, TwinError};
use crate::ingest::backoff::{Backoff, sleep_unless_stopped};
use crate::ingest::dispatch::{Dispatcher, PipelineCounters, PipelineStats};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// How long one `recv_timeout` waits before re-checking the stop flag once connected.
const RECV_POLL: Duration = Duration::from_millis(200);

/// Slack over the connect timeout while the handshake is in progress.
const CONNECT_GRACE: Duration = Duration::from_secs(1);

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub client_id_prefix: String,
    pub channel_capacity: usize,
    pub reconnect: ReconnectConfig,
}

impl BrokerEndpoint {
    /// Endpoint with the lab defaults for everything but the address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let defaults = BrokerConfig::default();
        Self {
            host: host.into(),
            port,
            ..Self::from_config(&defaults)
        }
    }

    #[must_use]
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            keep_alive: Duration::from_secs(cfg.keep_alive_secs),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs.max(1)),
            client_id_prefix: cfg.client_id_prefix.clone(),
            channel_capacity: cfg.channel_capacity.max(1),
            reconnect: cfg.reconnect.clone(),
        }
    }

    /// `host:port`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Unique client id for one connection owner.
    #[must_use]
    pub fn client_id(&self, role: &str) -> String {
        let seq = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{role}-{}-{seq}",
            self.client_id_prefix,
            std::process::id()
        )
    }

    pub(crate) fn mqtt_options(&self, role: &str) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id(role), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options
    }

    /// Apply the connect timeout to a fresh connection's event loop.
    pub(crate) fn configure_connection(&self, connection: &mut Connection) {
        let mut network = connection.eventloop.network_options();
        network.set_connection_timeout(self.connect_timeout.as_secs());
        connection.eventloop.set_network_options(network);
    }

    /// How long the receive loop waits for the handshake to finish.
    #[must_use]
    pub fn connect_wait(&self) -> Duration {
        self.connect_timeout + CONNECT_GRACE
    }
}

/// Entry point for starting pipelines.
pub struct IngestionPipeline;

impl IngestionPipeline {
    /// Subscribe to `topics` on `broker` and feed every message to `dispatcher`.
    ///
    /// Returns once the receive thread is running. Only a failure to spawn
    /// the thread is an error.
    pub fn start(
        broker: &BrokerEndpoint,
        topics: Vec<String>,
        dispatcher: Dispatcher,
        logger: ActivityLoggerHandle,
    ) -> Result<PipelineHandle> {
        let name = dispatcher.pipeline().to_string();
        let (client, mut connection) =
            Client::new(broker.mqtt_options(&name), broker.channel_capacity);
        broker.configure_connection(&mut connection);
        let stop = Arc::new(AtomicBool::new(false));
        let counters = dispatcher.counters();

        let worker = ReceiveLoop {
            client: client.clone(),
            connection,
            topics,
            dispatcher,
            backoff: Backoff::from_config(&broker.reconnect),
            connect_wait: broker.connect_wait(),
            broker: broker.label(),
            logger,
            stop: Arc::clone(&stop),
        };
        let join = thread::Builder::new()
            .name(format!("slt-ingest-{name}"))
            .spawn(move || worker.run())
            .map_err(|e| TwinError::Runtime {
                details: format!("failed to spawn {name} receive thread: {e}"),
            })?;

        eprintln!(
            "[SLT-INGEST] {name}: receive loop started for {}",
            broker.label()
        );
        Ok(PipelineHandle {
            name,
            client,
            stop,
            counters,
            join: Some(join),
        })
    }
}

/// Control handle for a running pipeline.
pub struct PipelineHandle {
    name: String,
    client: Client,
    stop: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    join: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Stop receiving. The observer call in flight completes; no new message
    /// is dispatched afterwards. Idempotent.
    ///
    /// A handshake in progress is allowed to finish or time out first, so
    /// this can block for up to the connect timeout.
    pub fn stop(&mut self) -> PipelineStats {
        self.stop.store(true, Ordering::SeqCst);
        // The event loop may already be gone; nothing to disconnect then.
        let _ = self.client.try_disconnect();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                eprintln!("[SLT-INGEST] {}: receive thread panicked", self.name);
            }
        }
        self.stats()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.stop();
        }
    }
}

struct ReceiveLoop {
    client: Client,
    connection: Connection,
    topics: Vec<String>,
    dispatcher: Dispatcher,
    backoff: Backoff,
    connect_wait: Duration,
    broker: String,
    logger: ActivityLoggerHandle,
    stop: Arc<AtomicBool>,
}

impl ReceiveLoop {
    fn run(mut self) {
        let mut connected = false;
        let mut connected_once = false;
        while !self.stop.load(Ordering::SeqCst) {
            let wait = if connected {
                RECV_POLL
            } else {
                self.connect_wait
            };
            match self.connection.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) if connected => {}
                Err(RecvTimeoutError::Timeout) => {
                    let message = format!("no CONNACK within {} ms", wait.as_millis());
                    if !self.retry_after(&message) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    if connected_once {
                        self.dispatcher.counters().record_reconnect();
                    }
                    connected = true;
                    connected_once = true;
                    self.backoff.reset();
                    self.on_connected();
                }
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    self.dispatcher
                        .handle_message(&publish.topic, &publish.payload);
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    connected = false;
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if !self.retry_after(&err.to_string()) {
                        break;
                    }
                }
            }
        }
        eprintln!(
            "[SLT-INGEST] {}: receive loop stopped ({} readings accepted)",
            self.dispatcher.pipeline(),
            self.dispatcher.stats().accepted
        );
    }

    /// Log a connection failure and sleep out the backoff. `false` when the
    /// pipeline was stopped during the wait.
    fn retry_after(&mut self, message: &str) -> bool {
        let delay = self.backoff.next_delay();
        eprintln!(
            "[SLT-INGEST] {}: broker {} unavailable ({message}), retrying in {} ms",
            self.dispatcher.pipeline(),
            self.broker,
            delay.as_millis()
        );
        self.logger.send(ActivityEvent::BrokerError {
            pipeline: self.dispatcher.pipeline().to_string(),
            broker: self.broker.clone(),
            message: message.to_string(),
            retry_in_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        sleep_unless_stopped(delay, &self.stop)
    }

    fn on_connected(&mut self) {
        let pipeline = self.dispatcher.pipeline().to_string();
        if !self.topics.is_empty() {
            let filters = self
                .topics
                .iter()
                .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));
            if let Err(err) = self.client.try_subscribe_many(filters) {
                let err = TwinError::from(err);
                eprintln!("[SLT-INGEST] {pipeline}: subscribe failed: {err}");
                self.logger.send(ActivityEvent::BrokerError {
                    pipeline: pipeline.clone(),
                    broker: self.broker.clone(),
                    message: err.to_string(),
                    retry_in_ms: 0,
                });
                return;
            }
        }
        eprintln!(
            "[SLT-INGEST] {pipeline}: connected to {}, subscribed to {} topics",
            self.broker,
            self.topics.len()
        );
        self.logger.send(ActivityEvent::BrokerConnected {
            pipeline,
            broker: self.broker.clone(),
            topics: self.topics.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    /// A local port with nothing listening on it.
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn client_ids_are_unique() {
        let endpoint = BrokerEndpoint::new("localhost", 1883);
        let a = endpoint.client_id("sensors");
        let b = endpoint.client_id("sensors");
        assert_ne!(a, b);
        assert!(a.starts_with("smartlab-twin-sensors-"));
    }

    #[test]
    fn endpoint_uses_configured_keep_alive() {
        let endpoint = BrokerEndpoint::from_config(&BrokerConfig::default());
        assert_eq!(endpoint.keep_alive, Duration::from_secs(60));
        assert_eq!(endpoint.label(), "xrdevmqtt.edu.metropolia.fi:1883");
        let options = endpoint.mqtt_options("sensors");
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn handshake_wait_outlasts_connect_timeout() {
        let mut endpoint = BrokerEndpoint::new("127.0.0.1", 1883);
        endpoint.connect_timeout = Duration::from_secs(2);
        assert!(endpoint.connect_wait() > endpoint.connect_timeout);
        assert!(endpoint.connect_wait() > RECV_POLL);

        let (_client, mut connection) = Client::new(endpoint.mqtt_options("sensors"), 1);
        endpoint.configure_connection(&mut connection);
        assert_eq!(connection.eventloop.network_options().connection_timeout(), 2);
    }

    #[test]
    fn unreachable_broker_does_not_fail_start_and_stops_promptly() {
        let endpoint = BrokerEndpoint::new("127.0.0.1", closed_port());
        let dispatcher = Dispatcher::new("sensors", ActivityLoggerHandle::disabled());
        let mut handle = IngestionPipeline::start(
            &endpoint,
            vec!["KNX/13/0/0<Livingroom.Sensors.CO2-ppm>".to_string()],
            dispatcher,
            ActivityLoggerHandle::disabled(),
        )
        .expect("start must not fail for an unreachable broker");
        assert_eq!(handle.name(), "sensors");

        thread::sleep(Duration::from_millis(300));
        let started = Instant::now();
        let stats = handle.stop();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(stats.accepted, 0);
        assert!(!handle.is_running());
        // Second stop is a no-op.
        handle.stop();
    }
}
