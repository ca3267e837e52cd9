//! Order flow demo
//!
//! One process plays two services over a real broker:
//! - the **order service** publishes `OrderCreated`
//! - the **inventory service** consumes it and publishes one `StockUpdated`
//!   per line item, correlated with the order
//!
//! # Running
//!
//! ```bash
//! docker run -d -p 9092:9092 redpandadata/redpanda redpanda start --smp 1 --overprovisioned
//! SERVICE_NAME=order-flow KAFKA_FROM_BEGINNING=true RUST_LOG=info cargo run -p order-flow
//! ```
//!
//! Without `KAFKA_TRANSACTIONAL_ID` the demo uses `<SERVICE_NAME>-tx`, since
//! the stock batches are only accepted by a transactional producer. Metrics
//! are served at `http://localhost:9090/metrics`.
//!
//! Stop with Ctrl+C; consumers drain and leave their group before exit.

use anyhow::Context;
use commerce_events_core::config::BackboneConfig;
use commerce_events_core::factory::EventFactory;
use commerce_events_core::payload::{
    OrderCreated, OrderLineItem, ServiceStarted, ServiceStopped, ShippingAddress, StockUpdated,
};
use commerce_events_core::{EventEnvelope, EventType};
use commerce_events_redpanda::{RedpandaConsumer, RedpandaProducer};
use commerce_events_runtime::metrics::MetricsServer;
use commerce_events_runtime::{EventConsumer, EventPublisher};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stock every product starts with in this demo.
const STARTING_STOCK: i64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let started = Instant::now();

    let mut config = BackboneConfig::from_env().context("Invalid backbone configuration")?;
    // StockUpdated batches hold several records and need a transactional producer
    if config.transactional_id.is_none() {
        config.transactional_id = Some(format!("{}-tx", config.service.service_name));
    }
    info!(
        service = %config.service.service_name,
        brokers = %config.brokers,
        group_id = %config.group_id,
        "Starting order flow demo"
    );

    let mut metrics = MetricsServer::new("0.0.0.0:9090".parse()?);
    metrics.start()?;

    let factory = Arc::new(EventFactory::new(config.service.clone()));
    let publisher = Arc::new(EventPublisher::from_config(
        Arc::new(RedpandaProducer::from_config(&config)),
        &config,
    ));
    publisher.connect().await?;

    let instance_id = format!("{}-{}", config.service.service_name, std::process::id());
    let announcement = factory.service_started(
        &instance_id,
        ServiceStarted {
            service_id: instance_id.clone(),
            service_name: config.service.service_name.clone(),
            version: config.service.version.clone(),
            host: None,
        },
        None,
    )?;
    publisher.publish(&announcement, None).await?;

    let consumer = EventConsumer::from_config(Arc::new(RedpandaConsumer::from_config(&config)), &config)
        .dead_letter_publisher(Arc::clone(&publisher))
        .build();
    register_inventory_handlers(&consumer, &factory, &publisher);
    consumer
        .connect(&config.topics().event_topics(), config.from_beginning)
        .await?;

    let order = factory.order_created("order-42", sample_order(), None)?;
    let receipt = publisher.publish(&order, None).await?;
    info!(
        event_id = %order.event_id,
        topic = %receipt.topic,
        partition = receipt.partition,
        offset = receipt.offset,
        "Order placed"
    );

    info!("Running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    consumer.disconnect().await?;

    let farewell = factory.service_stopped(
        &instance_id,
        ServiceStopped {
            service_id: instance_id.clone(),
            service_name: config.service.service_name.clone(),
            reason: "shutdown".to_string(),
            uptime_seconds: started.elapsed().as_secs(),
        },
        None,
    )?;
    if let Err(e) = publisher.publish(&farewell, None).await {
        warn!(error = %e, "Failed to announce shutdown");
    }
    publisher.disconnect().await?;

    if let Some(rendered) = metrics.render() {
        tracing::debug!(metrics = %rendered, "Final metrics");
    }
    info!("Shutdown complete");
    Ok(())
}

fn register_inventory_handlers(
    consumer: &EventConsumer,
    factory: &Arc<EventFactory>,
    publisher: &Arc<EventPublisher>,
) {
    let factory = Arc::clone(factory);
    let publisher = Arc::clone(publisher);
    consumer.on(EventType::OrderCreated, move |event: EventEnvelope| {
        let factory = Arc::clone(&factory);
        let publisher = Arc::clone(&publisher);
        async move {
            let order: OrderCreated = event.payload_as()?;
            info!(
                order_number = %order.order_number,
                items = order.items.len(),
                total = order.total_amount,
                "Reserving stock"
            );

            let updates = order
                .items
                .iter()
                .map(|item| {
                    factory.caused_by(
                        &event,
                        &item.product_id,
                        StockUpdated {
                            product_id: item.product_id.clone(),
                            previous_stock: STARTING_STOCK,
                            new_stock: STARTING_STOCK - i64::from(item.quantity),
                            reason: "order".to_string(),
                        },
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            publisher.publish_batch(&updates, None).await?;
            Ok::<(), anyhow::Error>(())
        }
    });

    consumer.on(EventType::StockUpdated, |event: EventEnvelope| async move {
        let update: StockUpdated = event.payload_as()?;
        info!(
            product_id = %update.product_id,
            new_stock = update.new_stock,
            correlation_id = %event.correlation_id,
            "Stock level changed"
        );
        Ok::<(), anyhow::Error>(())
    });
}

fn sample_order() -> OrderCreated {
    let items = vec![
        OrderLineItem {
            product_id: "prod-keyboard".to_string(),
            product_name: "Mechanical keyboard".to_string(),
            quantity: 1,
            unit_price: 12000,
            total_price: 12000,
        },
        OrderLineItem {
            product_id: "prod-cable".to_string(),
            product_name: "USB-C cable".to_string(),
            quantity: 2,
            unit_price: 1500,
            total_price: 3000,
        },
    ];
    OrderCreated {
        order_id: "order-42".to_string(),
        order_number: "ORD-20250101-0042".to_string(),
        user_id: "user-7".to_string(),
        subtotal: 15000,
        shipping_fee: 0,
        discount_amount: 0,
        total_amount: 15000,
        items,
        shipping_address: ShippingAddress {
            recipient: "Jordan Lee".to_string(),
            phone: "010-0000-0000".to_string(),
            postal_code: "04524".to_string(),
            address: "1 Market Street".to_string(),
            address_detail: Some("Unit 3".to_string()),
        },
        payment_method: "card".to_string(),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
