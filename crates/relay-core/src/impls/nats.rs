//! NATS JetStream transports.
//!
//! The source is a durable pull consumer with explicit acks; the sink
//! publishes with headers and waits for the stream's ack.

use std::time::Duration;

use async_nats::jetstream::{self, AckKind, consumer::pull, stream::Config as StreamConfig};
use async_nats::{ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use crate::domain::{Headers, OutboundMessage, RelayError};
use crate::ports::{MessageSink, MessageSource, SourceDelivery};

/// Connection to a NATS server with JetStream enabled.
#[derive(Clone)]
pub struct NatsClient {
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to `urls` (comma separated).
    pub async fn connect(
        urls: &str,
        timeout: Duration,
        token: Option<String>,
    ) -> Result<Self, RelayError> {
        info!(urls, timeout = ?timeout, "connecting to NATS");

        let mut options = ConnectOptions::new().connection_timeout(timeout);
        if let Some(token) = token {
            options = options.token(token);
        }
        let client = options
            .connect(urls)
            .await
            .map_err(|e| RelayError::SourceRead(format!("connect to {urls}: {e}")))?;

        info!("connected to NATS");
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }

    /// Create the stream holding `subject` unless it already exists.
    pub async fn ensure_stream(&self, stream_name: &str, subject: &str) -> Result<(), RelayError> {
        match self.jetstream.get_stream(stream_name).await {
            Ok(_) => {
                debug!(stream = stream_name, "stream already exists");
            }
            Err(_) => {
                self.jetstream
                    .create_stream(StreamConfig {
                        name: stream_name.to_string(),
                        subjects: vec![subject.to_string()],
                        description: Some("Envelopes awaiting delayed delivery".to_string()),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        RelayError::SourceRead(format!("create stream {stream_name}: {e}"))
                    })?;
                info!(stream = stream_name, subject, "created stream");
            }
        }
        Ok(())
    }

    /// Open the durable consumer `durable` on `stream_name`, filtered to `subject`.
    pub async fn source(
        &self,
        stream_name: &str,
        subject: &str,
        durable: &str,
    ) -> Result<NatsSource, RelayError> {
        let consumer = self
            .jetstream
            .create_consumer_on_stream(
                pull::Config {
                    name: Some(durable.to_string()),
                    durable_name: Some(durable.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
                stream_name,
            )
            .await
            .map_err(|e| RelayError::SourceRead(format!("create consumer {durable}: {e}")))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| RelayError::SourceRead(format!("open message stream: {e}")))?;

        info!(stream = stream_name, consumer = durable, subject, "consumer ready");
        Ok(NatsSource { messages })
    }

    pub fn sink(&self) -> NatsSink {
        NatsSink {
            jetstream: self.jetstream.clone(),
        }
    }
}

pub struct NatsSource {
    messages: pull::Stream,
}

#[async_trait]
impl MessageSource for NatsSource {
    async fn next(&mut self) -> Option<Result<Box<dyn SourceDelivery>, RelayError>> {
        let item = self.messages.next().await?;
        Some(
            item.map(|message| Box::new(NatsDelivery::new(message)) as Box<dyn SourceDelivery>)
                .map_err(|e| RelayError::SourceRead(e.to_string())),
        )
    }
}

struct NatsDelivery {
    message: jetstream::Message,
    headers: Headers,
    subject: String,
}

impl NatsDelivery {
    fn new(message: jetstream::Message) -> Self {
        let headers = message
            .headers
            .as_ref()
            .map(from_header_map)
            .unwrap_or_default();
        let subject = message.subject.to_string();
        Self {
            message,
            headers,
            subject,
        }
    }

    async fn settle(&self, kind: AckKind) -> Result<(), RelayError> {
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| RelayError::Acknowledge(e.to_string()))
    }
}

#[async_trait]
impl SourceDelivery for NatsDelivery {
    fn value(&self) -> &[u8] {
        &self.message.payload
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    async fn ack(self: Box<Self>) -> Result<(), RelayError> {
        self.settle(AckKind::Ack).await
    }

    async fn nak(self: Box<Self>) -> Result<(), RelayError> {
        self.settle(AckKind::Nak(None)).await
    }

    async fn term(self: Box<Self>) -> Result<(), RelayError> {
        self.settle(AckKind::Term).await
    }
}

pub struct NatsSink {
    jetstream: jetstream::Context,
}

#[async_trait]
impl MessageSink for NatsSink {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), RelayError> {
        let ack = self
            .jetstream
            .publish_with_headers(
                message.topic.clone(),
                to_header_map(&message.headers),
                message.payload.clone(),
            )
            .await
            .map_err(|e| RelayError::forward(&message.topic, e))?;

        ack.await
            .map_err(|e| RelayError::forward(&message.topic, e))?;

        debug!(topic = %message.topic, bytes = message.payload.len(), "published");
        Ok(())
    }
}

/// Multi-valued headers keep their last value.
fn from_header_map(map: &HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, values)| {
            values
                .last()
                .map(|value| (name.to_string(), value.as_str().to_string()))
        })
        .collect()
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}
