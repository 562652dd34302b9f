#![forbid(unsafe_code)]

//! Reliable NATS JetStream consumption
//!
//! `kiwano` binds raw NATS subscriptions to JetStream consumers. Every
//! frame received by a binding goes through a [`MessageManager`] first,
//! which filters out in-band status frames (heartbeats, flow control,
//! expired pull requests) and surfaces protocol violations, so that only
//! application data reaches [`JetstreamSubscription::next_message`] or
//! the handler of a [`PushSubscription`].
//!
//! [`MessageManager`]: crate::jetstream::MessageManager
//! [`JetstreamSubscription::next_message`]: crate::jetstream::JetstreamSubscription::next_message
//! [`PushSubscription`]: crate::jetstream::PushSubscription

pub use kiwano_proto as proto;

mod client;
mod subscription;

pub mod core {
    //! NATS Core client handle and raw subscriptions

    pub use crate::client::{
        Client, ClientBuilder, ClientClosedError, ClientCommand, ClientCommands, ClientPublish,
        ClientRequest, ResponseError, ResponseFut, TryCommandError,
    };
    pub use crate::subscription::Subscription;
}

pub mod jetstream {
    //! JetStream consumption: bindings, message managers and the control plane codec

    pub use crate::client::jetstream::*;
}
