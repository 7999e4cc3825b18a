//! Multi-process publish/subscribe fabric.
//!
//! Endpoints host local subscribers and exchange messages through a
//! central broker over authenticated connections. Topics are hierarchical:
//! subscribing to `("a", "b")` also receives any publication whose topic
//! begins with `("a", "b")`.
//!
//! [`PubSub`] is the in-process dispatcher, [`NetPubSub`] the
//! broker-connected endpoint, [`Broker`] the relay process. The
//! `fanout-broker` binary runs a broker and writes its address and key to
//! a file other processes load with [`read_broker_file`].

pub mod auth;
pub mod broker;
pub mod error;
pub mod net;
pub mod payload;
pub mod pubsub;
pub mod topic;
pub mod transport;
pub mod wire;

pub use auth::AuthKey;
pub use broker::{Broker, BrokerConfig, StopHandle};
pub use error::{Error, Result};
pub use net::NetPubSub;
pub use payload::{Message, Payload};
pub use pubsub::{subscriber, PubSub, Subscriber, SubscriberFn};
pub use topic::{Topic, LOCAL_SUFFIX};
pub use transport::{read_broker_file, write_broker_file, BrokerAddr};
