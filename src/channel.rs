// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the channels the queue works on. The broker connection
//! itself belongs to the caller; [`connect`] is only a convenience to open one.
//!
//! [`ChannelManager`] owns the single outbound channel shared by every
//! publish. It is created lazily on first use, declares the main queue once,
//! and is memoized for the lifetime of the queue object. Listen sessions get
//! a fresh channel each.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    errors::AmqpError,
    queue::QueueDefinition,
};
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error};

/// Parameters of a broker connection opened through [`connect`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub uri: String,
    pub name: String,
}

/// Opens a connection to the broker.
///
/// The connection is named after `cfg.name` so it can be told apart in the
/// broker's management tools.
pub async fn connect(cfg: &ConnectionConfig) -> Result<Arc<Connection>, AmqpError> {
    debug!("creating amqp connection...");
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(cfg.name.clone()));

    match Connection::connect(&cfg.uri, options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(Arc::new(conn))
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }
}

/// Lifecycle of the channels used by one queue object.
pub struct ChannelManager {
    connection: Arc<dyn BrokerConnection>,
    main_queue: QueueDefinition,
    publish_channel: OnceCell<Arc<dyn BrokerChannel>>,
}

impl ChannelManager {
    pub fn new(connection: Arc<dyn BrokerConnection>, main_queue: QueueDefinition) -> Self {
        ChannelManager {
            connection,
            main_queue,
            publish_channel: OnceCell::new(),
        }
    }

    pub fn main_queue(&self) -> &QueueDefinition {
        &self.main_queue
    }

    /// Returns the shared publish channel, creating it and declaring the main
    /// queue on first use.
    ///
    /// Concurrent first calls wait on the same initialization. A failed
    /// initialization is not memoized.
    pub async fn publish_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self
            .publish_channel
            .get_or_try_init(|| async {
                debug!("creating publish channel...");
                self.prepared_channel().await
            })
            .await?;

        Ok(channel.clone())
    }

    /// Opens a dedicated channel with the main queue declared.
    pub async fn listen_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating listen channel...");
        self.prepared_channel().await
    }

    async fn prepared_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.connection.create_channel().await?;

        if let Err(err) = self.prepare_queue(channel.as_ref()).await {
            release(channel.as_ref()).await;
            return Err(err);
        }

        Ok(channel)
    }

    /// Declares the main queue on `channel` with the configured durability.
    pub async fn prepare_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        channel.declare_queue(&self.main_queue).await
    }
}

/// Best-effort close of a channel that is no longer usable.
pub(crate) async fn release(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), "channel was already unusable");
    }
}
