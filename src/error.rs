//! The top-level error type: every subsystem's error rolled into one enum
//! so `main` has a single place to format a failure and pick an exit code.

use std::io;

use thiserror::Error;

use crate::cli::CliError;
use crate::client::ClientError;
use crate::daemon::DaemonError;
use crate::forwarder::ForwarderError;
use crate::icmp_endpoint::EndpointError;
use crate::privs::PrivError;
use crate::resolve::ResolveError;
use crate::server::ServerError;
use crate::tun::TunError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Cli(#[from] CliError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Tun(#[from] TunError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Privs(#[from] PrivError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error("installing the signal handler failed: {0}")]
    Signal(#[source] io::Error),
    #[error("event loop poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("tun device io failed: {0}")]
    TunIo(#[source] io::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

impl From<ForwarderError<ClientError>> for AppError {
    fn from(err: ForwarderError<ClientError>) -> AppError {
        match err {
            ForwarderError::Poll(e) => AppError::Poll(e),
            ForwarderError::Tun(e) => AppError::TunIo(e),
            ForwarderError::Handler(e) => AppError::Client(e),
        }
    }
}

impl From<ForwarderError<ServerError>> for AppError {
    fn from(err: ForwarderError<ServerError>) -> AppError {
        match err {
            ForwarderError::Poll(e) => AppError::Poll(e),
            ForwarderError::Tun(e) => AppError::TunIo(e),
            ForwarderError::Handler(e) => AppError::Server(e),
        }
    }
}
