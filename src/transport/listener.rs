//! Port-keyed listener registry
//!
//! One registry exists per transport protocol. Application code registers
//! handlers while the receive loop reads the table for every inbound segment,
//! so the table is copy-on-write: registration publishes a new map and
//! readers always see a complete snapshot.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, trace};

/// Future returned by a listener invocation
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback invoked for every segment addressed to a registered port
pub type Handler<T> = Arc<dyn Fn(T) -> BoxFuture + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler<T, F, Fut>(f: F) -> Handler<T>
where
    T: 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |value: T| -> BoxFuture { Box::pin(f(value)) })
}

type Table<T> = HashMap<u16, Handler<T>>;

/// Mapping from port number to handler. Cloning shares the same table.
pub struct ListenerRegistry<T> {
    table: Arc<ArcSwap<Table<T>>>,
}

impl<T> ListenerRegistry<T> {
    pub fn new() -> Self {
        ListenerRegistry {
            table: Arc::new(ArcSwap::from_pointee(HashMap::new())),
        }
    }

    /// Register `handler` for `port`, replacing any previous handler
    pub fn register(&self, port: u16, handler: Handler<T>) {
        let previous = self.table.rcu(|table| {
            let mut next = Table::<T>::clone(table);
            next.insert(port, handler.clone());
            next
        });
        if previous.contains_key(&port) {
            debug!("Replaced listener on port {}", port);
        }
    }

    pub fn lookup(&self, port: u16) -> Option<Handler<T>> {
        self.table.load().get(&port).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }

    /// Drop every registered handler
    pub fn clear(&self) {
        self.table.store(Arc::new(HashMap::new()));
    }

    /// Read-only view handed to protocol engines
    pub fn lookup_handle(&self) -> ListenerLookup<T> {
        ListenerLookup {
            table: Arc::clone(&self.table),
        }
    }
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ListenerRegistry<T> {
    fn clone(&self) -> Self {
        ListenerRegistry {
            table: Arc::clone(&self.table),
        }
    }
}

impl<T> fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.load();
        let mut ports: Vec<_> = table.keys().copied().collect();
        ports.sort_unstable();
        f.debug_struct("ListenerRegistry")
            .field("ports", &ports)
            .finish()
    }
}

/// Lookup function bound to one registry.
///
/// Sees registrations made after it was created.
pub struct ListenerLookup<T> {
    table: Arc<ArcSwap<Table<T>>>,
}

impl<T> ListenerLookup<T> {
    pub fn lookup(&self, port: u16) -> Option<Handler<T>> {
        self.table.load().get(&port).cloned()
    }

    /// Invoke the listener on `port` with `value`.
    ///
    /// Returns `false` when nothing listens on `port`; the value is dropped.
    pub async fn deliver(&self, port: u16, value: T) -> bool {
        match self.lookup(port) {
            Some(handler) => {
                handler(value).await;
                true
            }
            None => {
                trace!("No listener on port {}, discarding", port);
                false
            }
        }
    }
}

impl<T> Clone for ListenerLookup<T> {
    fn clone(&self) -> Self {
        ListenerLookup {
            table: Arc::clone(&self.table),
        }
    }
}
