//! ipsee-monitor: join a namespace and log its traffic
//!
//! Binds a member, connects to every live peer, and logs each event until
//! interrupted. Optionally sends one message once connected.
//!
//! ## Configuration
//! - IPSEE_NAMESPACE: Namespace to join (or `namespace` in the config file)
//! - IPSEE_SEND_EVENT: Optional message type to send after subscribing
//! - IPSEE_SEND_BODY: JSON body for that message (default `{}`)
//! - IPSEE__BUS__UID / IPSEE__BUS__PATH: Member options (see `Config::load`)
//! - IPSEE_LOG: Log filter (default `info`)

use futures::StreamExt;
use serde_json::Value;
use tracing::{error, info, warn};

use ipsee::{Bus, BusEvent, Config};

const NAMESPACE_ENV_VAR: &str = "IPSEE_NAMESPACE";
const SEND_EVENT_ENV_VAR: &str = "IPSEE_SEND_EVENT";
const SEND_BODY_ENV_VAR: &str = "IPSEE_SEND_BODY";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ipsee::utils::bootstrap::init_tracing();

    let config_path = ipsee::utils::bootstrap::parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let namespace = std::env::var(NAMESPACE_ENV_VAR)
        .ok()
        .or(config.namespace)
        .ok_or("ipsee-monitor requires IPSEE_NAMESPACE")?;

    let bus = Bus::new(&namespace, config.bus)?;
    let events = bus.event_stream();
    let logger = tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            match &event {
                BusEvent::Error(e) => warn!(error = %e, "Bus error"),
                BusEvent::Message(msg) => {
                    let body = msg.body_json();
                    info!(
                        event = %msg.event,
                        from = ?msg.from_uid(),
                        body = %body,
                        "Message"
                    )
                }
                BusEvent::Close => {
                    info!("{}", event);
                    break;
                }
                _ => info!("{}", event),
            }
        }
    });

    bus.ready().await?;
    info!(
        namespace = %bus.namespace(),
        uid = %bus.uid(),
        address = %bus.address().display(),
        "Monitor listening"
    );

    let report = bus.subscribe_all().await?;
    info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        "Joined namespace"
    );

    if let Ok(event) = std::env::var(SEND_EVENT_ENV_VAR) {
        let body: Value = match std::env::var(SEND_BODY_ENV_VAR) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => Value::Object(Default::default()),
        };
        let queued = bus.send(&event, body).await?;
        info!(event = %event, peers = queued, "Sent message");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    bus.close().await?;
    let _ = logger.await;

    Ok(())
}
