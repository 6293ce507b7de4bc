//! Connection resilience manager.
//!
//! Owns the single broker connection handle on behalf of an adapter and
//! keeps it alive: bounded exponential-backoff retry on connect, automatic
//! reconnect when the transport signals a fault, and hard suppression of
//! both once disposed. Reconnect attempts are serialized; concurrent
//! triggers collapse into the attempt already running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, info, warn};

use crate::error::{BrokerError, ConnectivityError};
use crate::retry::RetryPolicy;

/// Why the transport declared the connection unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFault {
    /// The broker closed the connection.
    Shutdown,
    /// The broker blocked the connection (e.g. resource pressure).
    Blocked,
    /// A client callback raised inside the transport.
    CallbackException,
}

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

pub type FaultListener = Box<dyn Fn(ConnectionFault) + Send + Sync>;

/// The connection handle contract the resilience manager needs from a
/// transport: liveness, fault signaling, teardown. Nothing else.
pub trait ManagedConnection: Send + Sync + 'static {
    /// True only while the underlying session is actually open.
    fn is_open(&self) -> bool;

    /// Register a listener invoked (from the transport's own threads) when
    /// the connection faults.
    fn on_fault(&self, listener: FaultListener);

    fn close(&self);
}

impl<T: ManagedConnection + ?Sized> ManagedConnection for Arc<T> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn on_fault(&self, listener: FaultListener) {
        (**self).on_fault(listener);
    }

    fn close(&self) {
        (**self).close();
    }
}

type ConnectFn<C> = Box<dyn Fn() -> Result<C, BrokerError> + Send + Sync>;

/// Keeps one broker connection alive across failures.
///
/// The manager is the **only** mutator of connection state; adapters borrow
/// the handle through [`connection`](Self::connection) and never replace it
/// themselves.
pub struct ResilientConnection<C: ManagedConnection + Clone> {
    connect: ConnectFn<C>,
    retry: RetryPolicy,
    current: Mutex<Option<C>>,
    /// Serializes connect/reconnect attempts.
    gate: Mutex<()>,
    state: Mutex<ConnectionState>,
    disposed: AtomicBool,
    weak: Weak<Self>,
}

impl<C: ManagedConnection + Clone> ResilientConnection<C> {
    pub fn new(
        retry: RetryPolicy,
        connect: impl Fn() -> Result<C, BrokerError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            connect: Box::new(connect),
            retry,
            current: Mutex::new(None),
            gate: Mutex::new(()),
            state: Mutex::new(ConnectionState::Disconnected),
            disposed: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    /// Establish the connection if it is not already live.
    ///
    /// Transient failures are retried with exponential backoff up to the
    /// policy's attempt bound; exhaustion surfaces to the caller. Callers
    /// racing an in-flight attempt block on the gate and return as soon as
    /// they observe the connection the winner established.
    pub fn try_connect(&self) -> Result<(), ConnectivityError> {
        if self.is_disposed() {
            return Err(ConnectivityError::Fatal(BrokerError::other(
                "connection manager disposed",
            )));
        }

        let _gate = self.gate.lock().unwrap();
        if self.is_connected() {
            return Ok(());
        }

        *self.state.lock().unwrap() = ConnectionState::Connecting;

        match self.retry.run(|| (self.connect)()) {
            Ok(connection) => {
                let weak = self.weak.clone();
                connection.on_fault(Box::new(move |fault| {
                    if let Some(manager) = weak.upgrade() {
                        manager.handle_fault(fault);
                    }
                }));

                *self.current.lock().unwrap() = Some(connection);
                *self.state.lock().unwrap() = ConnectionState::Connected;
                info!("broker connection established");
                Ok(())
            }
            Err(err) => {
                *self.state.lock().unwrap() = ConnectionState::Disconnected;
                error!(%err, "broker connection could not be established");
                Err(err)
            }
        }
    }

    /// True only while the underlying session is open.
    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Borrow the current handle, if any. The handle may have gone stale;
    /// callers that need liveness check [`is_connected`](Self::is_connected)
    /// or call [`try_connect`](Self::try_connect) first.
    pub fn connection(&self) -> Option<C> {
        self.current.lock().unwrap().clone()
    }

    /// Close the connection and suppress all future auto-reconnects.
    /// Idempotent; background fault callbacks arriving afterwards are
    /// ignored instead of resurrecting the connection.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = self.current.lock().unwrap().take() {
            connection.close();
        }
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
    }

    fn handle_fault(&self, fault: ConnectionFault) {
        if self.is_disposed() {
            return;
        }

        *self.state.lock().unwrap() = ConnectionState::Faulted;
        warn!(?fault, "broker connection faulted; attempting to reconnect");

        // Reconnect off the transport's callback thread; the gate serializes
        // it against any attempt already in flight.
        let weak = self.weak.clone();
        std::thread::Builder::new()
            .name("omnibus-reconnect".to_string())
            .spawn(move || {
                if let Some(manager) = weak.upgrade() {
                    let _ = manager.try_connect();
                }
            })
            .expect("failed to spawn reconnect thread");
    }
}

impl<C: ManagedConnection + Clone> std::fmt::Debug for ResilientConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientConnection")
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
