use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use rumqttc::{MqttOptions, QoS};
use serde_derive::Serialize;

use crate::config;
use crate::presence::{LastSeen, PatientLocationRecord, PresenceState};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("could not encode location message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Destination for location messages.
#[async_trait]
pub trait LocationPublisher: Send + Sync {
    async fn publish_location(&self, record: &PatientLocationRecord) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct LocationMqttMessage<'a> {
    id: &'a str,
    name: &'a str,
    device: &'a str,
    state: PresenceState,
    last_seen: LastSeen,
    retained: bool,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "locator-rs".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "locator".to_string()),
            },
            eventloop,
        )
    }

    /// Drives the connection. Runs until the task is aborted; rumqttc
    /// reconnects on the next poll after an error.
    pub async fn event_loop(eventloop: &mut rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    debug!("Connection acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn topic_for(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(name)
        )
    }

    /// Publishes one location message. Waits while the client's request queue
    /// is full, so a burst larger than the queue is delivered rather than dropped.
    pub async fn announce_location(
        &self,
        record: &PatientLocationRecord,
    ) -> Result<(), PublishError> {
        debug!("Announcing {} ({}) on MQTT", record.name, record.state);
        let message = LocationMqttMessage {
            id: &record.id,
            name: &record.name,
            device: &record.device_identifier,
            state: record.state,
            last_seen: record.last_seen,
            retained: false,
        };
        let payload = serde_json::to_string(&message)?;
        self.client
            .publish(self.topic_for(&record.name), QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

#[async_trait]
impl LocationPublisher for MqttClient {
    async fn publish_location(&self, record: &PatientLocationRecord) -> Result<(), PublishError> {
        self.announce_location(record).await
    }
}

/// Publishes only the records that differ from what was last published for
/// the same patient, so repeated identical ticks produce no traffic.
pub struct LocationAnnouncer<P = MqttClient> {
    publisher: P,
    published: HashMap<String, (PresenceState, LastSeen)>,
}

impl<P: LocationPublisher> LocationAnnouncer<P> {
    pub fn new(publisher: P) -> Self {
        LocationAnnouncer {
            publisher,
            published: HashMap::new(),
        }
    }

    /// Returns how many records were published. A record that fails stays
    /// unpublished and is tried again on the next call.
    pub async fn announce(&mut self, records: &[PatientLocationRecord]) -> usize {
        let changed: Vec<_> = changed_records(&self.published, records).collect();
        let attempted = changed.len();
        let mut sent = 0;
        let mut last_error = None;

        for record in changed {
            match self.publisher.publish_location(record).await {
                Ok(()) => {
                    self.published
                        .insert(record.id.clone(), (record.state, record.last_seen));
                    sent += 1;
                }
                Err(err) => last_error = Some(err),
            }
        }

        if let Some(err) = last_error {
            warn!(
                "{} of {} location announcement(s) failed: {}",
                attempted - sent,
                attempted,
                err
            );
        }
        sent
    }
}

fn changed_records<'a>(
    published: &HashMap<String, (PresenceState, LastSeen)>,
    records: &'a [PatientLocationRecord],
) -> impl Iterator<Item = &'a PatientLocationRecord> {
    records
        .iter()
        .filter(move |r| published.get(&r.id) != Some(&(r.state, r.last_seen)))
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as TimeDelta, TimeZone, Utc};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn record(id: &str, state: PresenceState) -> PatientLocationRecord {
        PatientLocationRecord {
            id: id.to_string(),
            name: format!("Patient {id}"),
            device_identifier: String::new(),
            state,
            last_seen: LastSeen::Unknown,
        }
    }

    #[test]
    fn test_sanitize_name() {
        let name = "Mary O'Neil 2";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "mary_o_neil_2");
    }

    #[test]
    fn test_changed_records() {
        let mut published = HashMap::new();
        published.insert("p1".to_string(), (PresenceState::InRange, LastSeen::Unknown));
        published.insert("p2".to_string(), (PresenceState::InRange, LastSeen::Unknown));

        let records = vec![
            record("p1", PresenceState::InRange),
            record("p2", PresenceState::Unknown),
            record("p3", PresenceState::OutOfRange),
        ];
        let ids: Vec<&str> = changed_records(&published, &records)
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["p2", "p3"]);
    }

    #[test]
    fn test_location_message_shape() {
        let rec = record("p1", PresenceState::OutOfRange);
        let message = LocationMqttMessage {
            id: &rec.id,
            name: &rec.name,
            device: &rec.device_identifier,
            state: rec.state,
            last_seen: rec.last_seen,
            retained: false,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"id":"p1","name":"Patient p1","device":"","state":"OUT_OF_RANGE","last_seen":"Unknown","retained":false}"#
        );
    }

    /// Bounded queue drained by another task, like the client's request
    /// channel drained by the event loop.
    struct QueuedPublisher {
        tx: mpsc::Sender<String>,
        fail_ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LocationPublisher for QueuedPublisher {
        async fn publish_location(
            &self,
            record: &PatientLocationRecord,
        ) -> Result<(), PublishError> {
            if self.fail_ids.lock().unwrap().contains(&record.id) {
                let err = serde_json::from_str::<u8>("x").unwrap_err();
                return Err(PublishError::Encode(err));
            }
            self.tx.send(record.id.clone()).await.unwrap();
            Ok(())
        }
    }

    fn in_range(id: usize, tick: i64) -> PatientLocationRecord {
        let base = Utc.with_ymd_and_hms(2025, 4, 6, 13, 0, 0).unwrap();
        PatientLocationRecord {
            last_seen: LastSeen::At(base + TimeDelta::seconds(2 * tick)),
            ..record(&format!("p{id}"), PresenceState::InRange)
        }
    }

    #[tokio::test]
    async fn test_announce_more_records_than_queue_capacity() {
        let (tx, mut rx) = mpsc::channel(10);
        let drain = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(id) = rx.recv().await {
                seen.push(id);
            }
            seen
        });
        let mut announcer = LocationAnnouncer::new(QueuedPublisher {
            tx,
            fail_ids: Mutex::new(Vec::new()),
        });

        for tick in 0..3 {
            let records: Vec<_> = (0..15).map(|id| in_range(id, tick)).collect();
            assert_eq!(announcer.announce(&records).await, 15);
            // unchanged tick publishes nothing
            assert_eq!(announcer.announce(&records).await, 0);
        }

        drop(announcer);
        let seen = drain.await.unwrap();
        assert_eq!(seen.len(), 45);
        assert!(seen.iter().filter(|id| id.as_str() == "p14").count() == 3);
    }

    #[tokio::test]
    async fn test_failed_record_is_retried() {
        let (tx, mut rx) = mpsc::channel(16);
        let publisher = QueuedPublisher {
            tx,
            fail_ids: Mutex::new(vec!["p1".to_string()]),
        };
        let mut announcer = LocationAnnouncer::new(publisher);
        let records = vec![in_range(0, 0), in_range(1, 0)];

        assert_eq!(announcer.announce(&records).await, 1);
        assert_eq!(rx.recv().await.as_deref(), Some("p0"));

        announcer.publisher.fail_ids.lock().unwrap().clear();
        assert_eq!(announcer.announce(&records).await, 1);
        assert_eq!(rx.recv().await.as_deref(), Some("p1"));
    }
}
