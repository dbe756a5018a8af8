use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::LinesError;

/// Builds one pooled connection. Called `capacity` times at pool
/// construction; a failure there is fatal to startup.
pub type ConnectionFactory = Box<dyn Fn() -> Result<Connection, LinesError> + Send + Sync>;

/// Fixed-capacity FIFO pool of SQLite connections.
///
/// Connections are handed out through [`Lease`] values that return the
/// connection on drop, whatever the exit path. Once [`drain`] has been
/// called every new acquisition fails fast while outstanding leases are
/// allowed to finish and return their connection.
///
/// [`drain`]: ConnectionPool::drain
pub struct ConnectionPool {
    core: Arc<PoolCore>,
}

struct PoolCore {
    idle: Mutex<VecDeque<Connection>>,
    capacity: usize,
    draining: AtomicBool,
    /// Signaled on every return; the drain waiter re-checks the idle count.
    returned: Notify,
}

/// Scoped handle to one pooled connection.
pub struct Lease {
    conn: Option<Connection>,
    core: Arc<PoolCore>,
}

impl ConnectionPool {
    pub fn new(capacity: usize, factory: ConnectionFactory) -> Result<Self, LinesError> {
        let mut idle = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push_back(factory()?);
        }
        Ok(ConnectionPool {
            core: Arc::new(PoolCore {
                idle: Mutex::new(idle),
                capacity,
                draining: AtomicBool::new(false),
                returned: Notify::new(),
            }),
        })
    }

    /// Acquire a connection, retrying up to `attempts` times with `wait`
    /// between attempts while the pool is empty.
    pub async fn acquire(&self, attempts: u32, wait: Duration) -> Result<Lease, LinesError> {
        let mut remaining = attempts;
        while remaining > 0 {
            remaining -= 1;
            match self.try_pop()? {
                Some(conn) => {
                    return Ok(Lease {
                        conn: Some(conn),
                        core: Arc::clone(&self.core),
                    })
                }
                None => tokio::time::sleep(wait).await,
            }
        }
        Err(LinesError::InsufficientResources { attempts })
    }

    fn try_pop(&self) -> Result<Option<Connection>, LinesError> {
        if self.core.draining.load(Ordering::Acquire) {
            return Err(LinesError::Draining);
        }
        let mut idle = self.core.idle.lock().unwrap();
        Ok(idle.pop_front())
    }

    /// Number of idle connections currently in the pool.
    pub fn idle_count(&self) -> usize {
        self.core.idle.lock().unwrap().len()
    }

    /// Reject new acquisitions, then wait until every outstanding lease has
    /// returned its connection.
    pub async fn drain(&self) {
        self.core.draining.store(true, Ordering::Release);
        debug!(
            idle = self.idle_count(),
            capacity = self.core.capacity,
            "pool draining"
        );
        loop {
            let returned = self.core.returned.notified();
            if self.idle_count() == self.core.capacity {
                break;
            }
            returned.await;
        }
        debug!("pool drained");
    }
}

impl Lease {
    fn connection(&self) -> &Connection {
        // Present from construction until drop.
        self.conn.as_ref().unwrap()
    }
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.core.idle.lock().unwrap();
            idle.push_back(conn);
            drop(idle);
            self.core.returned.notify_waiters();
        }
    }
}
