//! OS signal dispatching.
//!
//! # Responsibilities
//! - Translate process signals into typed server events
//! - SIGTERM / SIGINT: set the shutdown flag, observed by the supervisor
//! - SIGUSR1: dump ring and server parameters at full verbosity
//!
//! # Design Decisions
//! - One dedicated task waits on the signal streams; the rest of the
//!   server never touches signal handling
//! - SIGPIPE stays at its default disposition (ignored by the runtime),
//!   so writes to closed sockets fail with an error instead of killing
//!   the process
//! - SIGSEGV cannot be routed through the async signal registry; the
//!   default fatal disposition stands

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::server::Shared;

/// Spawn the signal dispatcher task. Aborted and joined by the server
/// after the supervisor loop exits.
pub fn spawn(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Cannot install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Cannot install SIGINT handler");
                return;
            }
        };
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Cannot install SIGUSR1 handler");
                return;
            }
        };

        loop {
            tokio::select! {
                received = term.recv() => {
                    if received.is_none() {
                        break;
                    }
                    tracing::info!("Received termination signal");
                    shared.shutdown.request();
                }
                received = int.recv() => {
                    if received.is_none() {
                        break;
                    }
                    tracing::info!("Received interrupt signal");
                    shared.shutdown.request();
                }
                received = usr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    // Explicit request for details, log them all
                    shared.ring.log_parameters();
                    shared.log_parameters();
                }
            }
        }
    })
}
