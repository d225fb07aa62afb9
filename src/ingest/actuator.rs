//! One-shot actuator control: publish a command, or peek at a topic's
//! current payload.
//!
//! Each call opens its own short-lived MQTT connection, separate from the
//! long-running ingestion pipelines.

#![allow(missing_docs)]

use std::time::{Duration, Instant};

use rumqttc::{Client, Connection, Event, Outgoing, Packet, QoS, RecvTimeoutError};

use crate::core::errors::{Result, TwinError};
use crate::ingest::pipeline::BrokerEndpoint;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// Upper bound for reaching the broker before giving up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long [`peek_payload`] listens by default.
pub const DEFAULT_PEEK_WAIT: Duration = Duration::from_secs(1);

/// Publish `payload` to `topic` once: connect, publish, flush, disconnect.
pub fn publish_command(
    broker: &BrokerEndpoint,
    topic: &str,
    payload: &str,
    logger: &ActivityLoggerHandle,
) -> Result<()> {
    let result = publish_inner(broker, topic, payload);
    logger.send(ActivityEvent::ActuatorCommand {
        topic: topic.to_string(),
        payload: payload.to_string(),
        ok: result.is_ok(),
        message: result.as_ref().err().map(ToString::to_string),
    });
    match &result {
        Ok(()) => eprintln!("[SLT-ACTUATE] published {payload:?} to {topic}"),
        Err(err) => eprintln!("[SLT-ACTUATE] publish to {topic} failed: {err}"),
    }
    result
}

fn publish_inner(broker: &BrokerEndpoint, topic: &str, payload: &str) -> Result<()> {
    let (client, mut connection) = Client::new(broker.mqtt_options("actuate"), 10);
    client
        .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
        .map_err(|e| broker_error(broker, &e.to_string()))?;

    let deadline = Instant::now() + CONNECT_TIMEOUT;
    let mut published = false;
    loop {
        let event = next_event(broker, &mut connection, deadline)?;
        match event {
            Some(Event::Outgoing(Outgoing::Publish(_))) if !published => {
                published = true;
                client
                    .try_disconnect()
                    .map_err(|e| broker_error(broker, &e.to_string()))?;
            }
            Some(Event::Outgoing(Outgoing::Disconnect)) if published => return Ok(()),
            Some(_) => {}
            None if published => return Ok(()),
            None => {
                return Err(broker_error(
                    broker,
                    "timed out before the command was sent",
                ));
            }
        }
    }
}

/// Subscribe to `topic` and return the first payload seen within `wait` of
/// connecting, or `None` when nothing arrives (non-retained topics are
/// usually silent).
pub fn peek_payload(
    broker: &BrokerEndpoint,
    topic: &str,
    wait: Duration,
) -> Result<Option<String>> {
    let (client, mut connection) = Client::new(broker.mqtt_options("peek"), 10);
    let mut deadline = Instant::now() + CONNECT_TIMEOUT;
    let mut connected = false;

    let payload = loop {
        match next_event(broker, &mut connection, deadline)? {
            Some(Event::Incoming(Packet::ConnAck(_))) if !connected => {
                connected = true;
                deadline = Instant::now() + wait;
                client
                    .try_subscribe(topic, QoS::AtMostOnce)
                    .map_err(|e| broker_error(broker, &e.to_string()))?;
            }
            Some(Event::Incoming(Packet::Publish(publish))) if publish.topic == topic => {
                break Some(String::from_utf8_lossy(&publish.payload).into_owned());
            }
            Some(_) => {}
            None if connected => break None,
            None => return Err(broker_error(broker, "timed out waiting for connection")),
        }
    };

    let _ = client.try_disconnect();
    Ok(payload)
}

/// Next event before `deadline`; `None` once the deadline passes.
fn next_event(
    broker: &BrokerEndpoint,
    connection: &mut Connection,
    deadline: Instant,
) -> Result<Option<Event>> {
    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
        return Ok(None);
    };
    match connection.recv_timeout(remaining) {
        Ok(Ok(event)) => Ok(Some(event)),
        Ok(Err(err)) => Err(broker_error(broker, &err.to_string())),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => {
            Err(broker_error(broker, "connection closed unexpectedly"))
        }
    }
}

fn broker_error(broker: &BrokerEndpoint, details: &str) -> TwinError {
    TwinError::Broker {
        broker: broker.label(),
        details: details.to_string(),
    }
}
