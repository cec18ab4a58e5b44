// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shared Connection Management
//!
//! A `ConnectionManager` owns the single broker connection shared by every dispatcher and
//! publisher built from it. The connection is opened on first use and replaced when it is
//! found closed. Creation is double-checked under a lock so concurrent first uses open
//! one connection, not one each.
//!
//! Connection failures are returned to the caller as is. There is no retry loop here.

use crate::{
    channel::{AmqpConnection, ChannelOf, Connector, LapinConnector},
    config::ConnectionParameters,
    errors::AmqpError,
};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Lazily opened connection shared by all components using the same parameters.
pub struct ConnectionManager<C: Connector = LapinConnector> {
    connector: C,
    params: ConnectionParameters,
    connection: RwLock<Option<Arc<C::Connection>>>,
    connecting: Mutex<()>,
}

impl ConnectionManager<LapinConnector> {
    /// A manager connecting through lapin.
    pub fn new(params: ConnectionParameters) -> Arc<Self> {
        ConnectionManager::with_connector(LapinConnector, params)
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn with_connector(connector: C, params: ConnectionParameters) -> Arc<Self> {
        Arc::new(ConnectionManager {
            connector,
            params,
            connection: RwLock::new(None),
            connecting: Mutex::new(()),
        })
    }

    pub fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    /// Returns the open shared connection, connecting first when there is none or the
    /// current one is closed.
    pub async fn get_connection(&self) -> Result<Arc<C::Connection>, AmqpError> {
        if let Some(conn) = self.open_connection().await {
            return Ok(conn);
        }

        let _guard = self.connecting.lock().await;

        if let Some(conn) = self.open_connection().await {
            return Ok(conn);
        }

        if self.connection.read().await.is_some() {
            warn!("rabbitmq connection is closed, reconnecting");
        }

        info!(
            host = self.params.host,
            port = self.params.port,
            vhost = self.params.vhost,
            "establishing connection with rabbitmq"
        );

        let conn = Arc::new(self.connector.connect(&self.params).await?);
        *self.connection.write().await = Some(conn.clone());

        Ok(conn)
    }

    /// Opens a channel on the shared connection.
    pub async fn create_channel(&self) -> Result<ChannelOf<C>, AmqpError> {
        self.get_connection().await?.create_channel().await
    }

    /// Closes the shared connection. The next `get_connection` opens a new one.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let _guard = self.connecting.lock().await;

        let Some(conn) = self.connection.write().await.take() else {
            return Ok(());
        };

        debug!("closing rabbitmq connection");

        if conn.is_open() {
            conn.close().await?;
        }

        Ok(())
    }

    async fn open_connection(&self) -> Option<Arc<C::Connection>> {
        self.connection
            .read()
            .await
            .as_ref()
            .filter(|conn| conn.is_open())
            .cloned()
    }
}
