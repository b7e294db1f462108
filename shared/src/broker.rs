//! AMQP topology and publishing.
//!
//! `Broker` owns one connection and a control channel used for declarations,
//! QoS and consuming. Publishing goes through `AmqpPublisher`, which has its
//! own channel behind a mutex so concurrent callers are serialized.

use async_trait::async_trait;
use futures::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consumer::{Acknowledger, Delivery, DeliveryStream};
use crate::error::BrokerError;
use crate::Event;

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<(), BrokerError>;
}

pub fn dead_letter_exchange(exchange: &str) -> String {
    format!("{}.dlx", exchange)
}

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dlq", queue)
}

/// Validates the connection URL without dialing.
pub fn parse_url(url: &str) -> Result<AMQPUri, BrokerError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(BrokerError::Config("broker url is empty".to_string()));
    }
    let uri = AMQPUri::from_str(url)
        .map_err(|e| BrokerError::Config(format!("invalid broker url: {}", e)))?;
    if uri.authority.host.is_empty() {
        return Err(BrokerError::Config("broker url has no host".to_string()));
    }
    Ok(uri)
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ),
        _ => false,
    }
}

fn declare_error(entity: &'static str, name: &str, err: lapin::Error) -> BrokerError {
    if is_precondition_failed(&err) {
        BrokerError::Topology {
            entity,
            name: name.to_string(),
            source: err,
        }
    } else {
        BrokerError::Channel(err)
    }
}

pub struct Broker {
    connection: Connection,
    channel: Channel,
}

impl Broker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let uri = parse_url(url)?;
        let host = format!("{}:{}", uri.authority.host, uri.authority.port);

        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(BrokerError::Connect)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::Connect)?;

        info!("Connected to broker at {}", host);
        Ok(Self { connection, channel })
    }

    pub async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.channel
            .exchange_declare(name, ExchangeKind::Topic, options, FieldTable::default())
            .await
            .map_err(|e| declare_error("exchange", name, e))?;
        info!("Exchange declared: {}", name);
        Ok(())
    }

    pub async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.declare_queue_with_args(name, FieldTable::default()).await
    }

    /// Declares `name` so that deliveries rejected without requeue are routed
    /// through `<exchange>.dlx` into `<name>.dlq`.
    pub async fn declare_queue_with_dead_letter(&self, name: &str, exchange: &str) -> Result<(), BrokerError> {
        let dlx = dead_letter_exchange(exchange);
        let dlq = dead_letter_queue(name);

        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.channel
            .exchange_declare(&dlx, ExchangeKind::Direct, options, FieldTable::default())
            .await
            .map_err(|e| declare_error("exchange", &dlx, e))?;
        self.declare_queue(&dlq).await?;
        self.bind(&dlq, name, &dlx).await?;

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(name)),
        );
        self.declare_queue_with_args(name, args).await
    }

    async fn declare_queue_with_args(&self, name: &str, args: FieldTable) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            ..Default::default()
        };
        self.channel
            .queue_declare(name, options, args)
            .await
            .map_err(|e| declare_error("queue", name, e))?;
        info!("Queue declared: {}", name);
        Ok(())
    }

    pub async fn bind(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| declare_error("binding", queue, e))?;
        info!("Queue {} bound to exchange {} with routing key {}", queue, exchange, routing_key);
        Ok(())
    }

    pub async fn set_qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        debug!("Prefetch set to {}", prefetch);
        Ok(())
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;
        info!("Consuming from {} as {}", queue, consumer_tag);

        Ok(consumer
            .map(|delivery| delivery.map(from_lapin).map_err(BrokerError::from))
            .boxed())
    }

    /// Stops the broker from handing out new deliveries to `consumer_tag`.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    pub async fn publisher(&self, exchange: &str) -> Result<AmqpPublisher, BrokerError> {
        let channel = self.connection.create_channel().await?;
        Ok(AmqpPublisher {
            channel: Mutex::new(Some(channel)),
            exchange: exchange.to_string(),
        })
    }

    /// Closes the channel, then the connection. Both are attempted; every
    /// failure is reported.
    pub async fn close(self) -> Result<(), BrokerError> {
        let mut failures = Vec::new();

        if let Err(e) = self.channel.close(REPLY_SUCCESS, "shutdown").await {
            warn!("Channel close failed: {}", e);
            failures.push(format!("channel: {}", e));
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "shutdown").await {
            warn!("Connection close failed: {}", e);
            failures.push(format!("connection: {}", e));
        }

        if failures.is_empty() {
            info!("Broker connection closed");
            Ok(())
        } else {
            Err(BrokerError::Close(failures))
        }
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(BrokerError::from)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.0
            .nack(options)
            .await
            .map(|_| ())
            .map_err(BrokerError::from)
    }
}

fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    Delivery::new(
        delivery.data,
        message_id,
        delivery.redelivered,
        Box::new(LapinAcker(delivery.acker)),
    )
}

pub struct AmqpPublisher {
    channel: Mutex<Option<Channel>>,
    exchange: String,
}

impl AmqpPublisher {
    pub async fn close(&self) -> Result<(), BrokerError> {
        let Some(channel) = self.channel.lock().await.take() else {
            return Ok(());
        };
        channel.close(REPLY_SUCCESS, "shutdown").await?;
        debug!("Publisher channel closed");
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    async fn publish(&self, event: &Event) -> Result<(), BrokerError> {
        let body = event.to_bytes()?;
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(PERSISTENT)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()));

        let guard = self.channel.lock().await;
        let channel = guard.as_ref().ok_or(BrokerError::Closed)?;
        channel
            .basic_publish(
                &self.exchange,
                &event.event_type,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        debug!(
            exchange = %self.exchange,
            routing_key = %event.event_type,
            bytes = body.len(),
            "Event published"
        );
        Ok(())
    }
}
