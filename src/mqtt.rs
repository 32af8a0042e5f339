use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use std::time::Duration;

use crate::config::Config;
use crate::meter::Meter;
use crate::sensor::Sensor;
use crate::service::{PathUpdate, ServiceTree};

// Room for every subscription plus a full service export between polls.
const REQUEST_CAPACITY: usize = 64;

/// Outgoing side of the broker connection.
pub trait Outbox {
    fn subscribe(&self, topic: &str) -> Result<()>;
    fn publish_retained(&self, topic: &str, payload: String) -> Result<()>;
}

// The bridge thread is also the one driving the event loop, so requests must
// never block on a full channel.
impl Outbox for Client {
    fn subscribe(&self, topic: &str) -> Result<()> {
        self.try_subscribe(topic, QoS::AtMostOnce)
            .with_context(|| format!("Failed to subscribe to {}", topic))
    }

    fn publish_retained(&self, topic: &str, payload: String) -> Result<()> {
        self.try_publish(topic, QoS::AtMostOnce, true, payload.into_bytes())
            .with_context(|| format!("Failed to queue publish to {}", topic))
    }
}

/// Decides what each broker event means for the meter and what goes back out.
pub struct Router {
    topic_prefix: String,
    export_prefix: Option<String>,
}

impl Router {
    pub fn new(topic_prefix: &str, export_prefix: Option<&str>) -> Self {
        Self {
            topic_prefix: topic_prefix.to_string(),
            export_prefix: export_prefix.map(str::to_string),
        }
    }

    /// Subscribe and export the whole service on every ConnAck, feed sensor
    /// publishes into the meter. Only a malformed payload is an error.
    pub fn handle_event(
        &self,
        outbox: &impl Outbox,
        meter: &mut Meter<ServiceTree>,
        event: Event,
    ) -> Result<()> {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("Connected, subscribing to {} sensors", Sensor::ALL.len());
                for topic in subscriptions(&self.topic_prefix) {
                    match outbox.subscribe(&topic) {
                        Ok(()) => debug!("Subscribed to {}", topic),
                        Err(e) => warn!("{:#}", e),
                    }
                }
                let snapshot = meter.sink().snapshot();
                self.export(outbox, meter.sink().name(), &snapshot)?;
                meter.sink_mut().drain_changed();
            }
            Event::Incoming(Packet::Publish(publish)) => {
                if handle_message(meter, &self.topic_prefix, &publish.topic, &publish.payload)? {
                    let changed = meter.sink_mut().drain_changed();
                    self.export(outbox, meter.sink().name(), &changed)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn export(&self, outbox: &impl Outbox, service: &str, updates: &[PathUpdate]) -> Result<()> {
        let Some(prefix) = &self.export_prefix else {
            return Ok(());
        };
        for (topic, payload) in export_messages(prefix, service, updates)? {
            if let Err(e) = outbox.publish_retained(&topic, payload) {
                warn!("{:#}", e);
            }
        }
        Ok(())
    }
}

/// Feeds sensor state topics from the broker into a meter and, when an
/// export prefix is configured, republishes changed service paths.
pub struct Bridge {
    client: Client,
    connection: Connection,
    router: Router,
    reconnect_delay: Duration,
}

impl Bridge {
    pub fn connect(config: &Config) -> Self {
        let mut opts = MqttOptions::new(&config.mqtt_client_id, &config.host, config.mqtt_port);
        opts.set_keep_alive(Duration::from_secs(60));

        let (client, connection) = Client::new(opts, REQUEST_CAPACITY);
        info!("Connecting to {}:{}", config.host, config.mqtt_port);

        Self {
            client,
            connection,
            router: Router::new(&config.topic_prefix, config.export_prefix.as_deref()),
            reconnect_delay: Duration::from_secs(config.reconnect_secs),
        }
    }

    /// Drive the connection until a payload cannot be parsed. Connection
    /// errors are retried; rumqttc reconnects on the next poll.
    pub fn run(self, meter: &mut Meter<ServiceTree>) -> Result<()> {
        let Bridge {
            client,
            mut connection,
            router,
            reconnect_delay,
        } = self;

        for event in connection.iter() {
            match event {
                Ok(event) => router.handle_event(&client, meter, event)?,
                Err(e) => {
                    error!("MQTT connection error: {}", e);
                    std::thread::sleep(reconnect_delay);
                }
            }
        }
        Ok(())
    }
}

/// State topics of every known sensor.
pub fn subscriptions(topic_prefix: &str) -> Vec<String> {
    Sensor::ALL.iter().map(|s| s.topic(topic_prefix)).collect()
}

/// Route one inbound message to the meter. Returns whether it was a sensor
/// topic; a malformed payload is returned as an error.
pub fn handle_message(
    meter: &mut Meter<ServiceTree>,
    topic_prefix: &str,
    topic: &str,
    payload: &[u8],
) -> Result<bool> {
    let Some(sensor) = Sensor::from_topic(topic_prefix, topic) else {
        debug!("Ignoring message on {}", topic);
        return Ok(false);
    };
    meter
        .update(sensor, payload)
        .with_context(|| format!("Failed to apply message on {}", topic))?;
    debug!("{} now {:?}", sensor, meter.reading(sensor));
    Ok(true)
}

/// Topic and JSON body for each path update, e.g.
/// `venus/com.victronenergy.grid.mqtt_40/Ac/Power`.
pub fn export_messages(
    export_prefix: &str,
    service: &str,
    updates: &[PathUpdate],
) -> Result<Vec<(String, String)>> {
    let prefix = export_prefix.trim_end_matches('/');
    updates
        .iter()
        .map(|update| {
            let payload = serde_json::to_string(update)
                .with_context(|| format!("Failed to serialize {}", update.path))?;
            Ok((format!("{}/{}{}", prefix, service, update.path), payload))
        })
        .collect()
}
