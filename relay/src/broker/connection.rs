// Lazily opened broker connection

use super::transport::{get_transport, Channel};
use super::url::ConnectionInfo;
use crate::errors::BrokerError;
use std::fmt;
use tracing::debug;

/// Connection to a broker.
///
/// Creating a connection only resolves its parameters; the transport is looked
/// up and a channel opened on first use.
pub struct Connection {
    info: ConnectionInfo,
    channel: Option<Box<dyn Channel>>,
}

impl Connection {
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            channel: None,
        }
    }

    /// Resolved connection parameters
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn transport_name(&self) -> &str {
        &self.info.transport
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Open the channel if it is not open yet
    pub fn ensure_connection(&mut self) -> Result<(), BrokerError> {
        self.channel().map(|_| ())
    }

    /// The open channel, connecting first when needed
    pub fn channel(&mut self) -> Result<&mut (dyn Channel + 'static), BrokerError> {
        if self.channel.is_none() {
            let transport = get_transport(&self.info.transport)?;
            let channel = transport.open(&self.info)?;
            debug!(broker = %self.info.as_uri(), "Broker connection established");
            self.channel = Some(channel);
        }
        match self.channel.as_deref_mut() {
            Some(channel) => Ok(channel),
            None => Err(BrokerError::Connection("channel unavailable".to_string())),
        }
    }

    /// Close the channel; the connection can be reopened later
    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
            debug!(broker = %self.info.as_uri(), "Broker connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("broker", &self.info.as_uri())
            .field("connected", &self.is_connected())
            .finish()
    }
}
