//! ipsee - local publish/subscribe bus over Unix domain sockets.
//!
//! Cooperating processes on one host join a namespace, each as a [`Bus`]
//! member listening on `{path}/{namespace}-{uid}.sock`. Members connect to
//! one another by uid or by discovery, and exchange typed JSON messages
//! that are delivered to local handlers as named events.
//!
//! ```no_run
//! use ipsee::{Bus, BusEvent, BusOptions};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), ipsee::BusError> {
//! let bus = Bus::bind("orders", BusOptions::default().with_uid(2u32)).await?;
//! bus.on("ping", |event| {
//!     if let BusEvent::Message(msg) = event {
//!         println!("ping from {:?}: {:?}", msg.from_uid(), msg.body);
//!     }
//! });
//! bus.subscribe(1u32).await?;
//! bus.send("pong", json!({"n": 1})).await?;
//! bus.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod bus;
pub mod config;
pub mod discovery;
pub mod envelope;
pub mod lifecycle;
pub mod router;
pub mod transport;
pub mod utils;

pub use address::{AddressError, Uid};
pub use bus::{
    Bus, BusError, BusEvent, BusState, DiscoveryReport, HandlerId, Message, Result,
};
pub use config::{BusOptions, Config};
pub use transport::{Direction, PeerId, PeerInfo, TransportError};
