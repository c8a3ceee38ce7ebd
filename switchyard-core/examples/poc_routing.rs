//! Walks the engine through the classic proof-of-concept topology: one
//! exchange of each kind, three queues, and a publish/consume round trip per
//! exchange.
//!
//! ```bash
//! cargo run --example poc_routing
//! ```

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use switchyard::{broker::Broker, config::BrokerConfig, message::Headers, topology::ExchangeKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: BrokerConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let args = Cli::parse();
    let broker = Broker::new(args.options);

    // The PoC topology.
    broker
        .declare_exchange("poc.direct.exchange", ExchangeKind::Direct, true)
        .await?;
    broker
        .declare_exchange("poc.fanout.exchange", ExchangeKind::Fanout, true)
        .await?;
    broker
        .declare_exchange("poc.topic.exchange", ExchangeKind::Topic, true)
        .await?;

    for queue in ["poc.queue.one", "poc.queue.two", "poc.queue.three"] {
        broker.declare_queue(queue, true).await?;
    }

    broker
        .bind("poc.queue.one", "poc.direct.exchange", "poc.key.one")
        .await?;
    broker
        .bind("poc.queue.two", "poc.direct.exchange", "poc.key.two")
        .await?;
    broker
        .bind("poc.queue.one", "poc.fanout.exchange", "")
        .await?;
    broker
        .bind("poc.queue.two", "poc.fanout.exchange", "")
        .await?;
    broker
        .bind("poc.queue.three", "poc.topic.exchange", "poc.topic.#")
        .await?;

    // Direct: only the queue bound under the exact key receives the message.
    let mut headers = Headers::default();
    headers.insert("source".into(), "poc".into());
    broker
        .publish(
            "poc.direct.exchange",
            "poc.key.one",
            "direct message",
            headers,
            false,
        )
        .await?;

    // Fanout: every bound queue receives a copy, whatever the key.
    broker
        .publish(
            "poc.fanout.exchange",
            "ignored",
            "fanout message",
            Headers::default(),
            false,
        )
        .await?;

    // Topic: the `poc.topic.#` binding matches any key under that prefix.
    broker
        .publish(
            "poc.topic.exchange",
            "poc.topic.test.sub",
            "topic message",
            Headers::default(),
            false,
        )
        .await?;

    for queue in ["poc.queue.one", "poc.queue.two", "poc.queue.three"] {
        let consumer = broker.consume(queue, Some(1)).await?;
        while let Ok(delivery) = consumer.try_next() {
            info!(
                queue,
                tag = delivery.tag,
                payload = %String::from_utf8_lossy(&delivery.payload),
                "received"
            );
            broker.ack(delivery.tag).await?;
        }
    }

    Ok(())
}
