//! Errors surfaced to callers of the panel handle

use crate::mqtt::connection::ConnectionError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PanelError {
    /// The dispatcher task has stopped and takes no more commands
    #[error("dispatcher is not running")]
    DispatcherGone,

    /// The broker did not acknowledge the connect in time
    #[error("connect was not acknowledged within {0:?}")]
    ConnectTimeout(Duration),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<tokio::sync::oneshot::error::RecvError> for PanelError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        PanelError::DispatcherGone
    }
}
