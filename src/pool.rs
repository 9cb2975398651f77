//! C4: bounded per-node connection pool (spec §4.4).

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::instrument;

use crate::conn::{ConnectConfig, Connection};
use crate::error::{Error, Result};

pub const DEFAULT_POOL_SIZE: usize = 2;
pub const MIN_POOL_SIZE: usize = 1;
pub const MAX_POOL_SIZE: usize = 64;

struct Idle {
    conn: Connection,
    permit: OwnedSemaphorePermit,
}

/// One node's slice of connections. `max_size` both bounds how many sockets
/// the node ever holds open and gates how many callers can wait for one.
pub struct Pool {
    config: ConnectConfig,
    idle: Mutex<VecDeque<Idle>>,
    semaphore: Arc<Semaphore>,
}

impl Pool {
    pub fn new(config: ConnectConfig, size: usize) -> Arc<Self> {
        let size = size.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE);
        Arc::new(Self {
            config,
            idle: Mutex::new(VecDeque::with_capacity(size)),
            semaphore: Arc::new(Semaphore::new(size)),
        })
    }

    /// Leases a ready connection, reusing an idle one when one is available
    /// and still healthy, otherwise waiting for pool capacity (`tokio::sync::
    /// Semaphore` grants permits in FIFO order, spec §4.4) until `deadline`
    /// and dialing a fresh connection.
    #[instrument(skip(self))]
    pub async fn acquire(self: &Arc<Self>, deadline: Instant) -> Result<Leased> {
        loop {
            let candidate = self.idle.lock().expect("pool idle queue poisoned").pop_front();
            match candidate {
                Some(Idle { conn, permit }) if conn.is_ready() => {
                    return Ok(Leased {
                        pool: Arc::clone(self),
                        conn: ManuallyDrop::new(conn),
                        permit: Some(permit),
                    });
                }
                // Draining/closed: drop it here, its permit frees a slot.
                Some(Idle { .. }) => continue,
                None => break,
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let permit = tokio::time::timeout(remaining, Arc::clone(&self.semaphore).acquire_owned())
            .await
            .map_err(|_| Error::NoCapacity)?
            .expect("pool semaphore is never closed");

        let conn = Connection::connect(self.config.clone()).await?;
        Ok(Leased {
            pool: Arc::clone(self),
            conn: ManuallyDrop::new(conn),
            permit: Some(permit),
        })
    }

    fn check_in(self: &Arc<Self>, conn: Connection, permit: OwnedSemaphorePermit) {
        if conn.is_broken() {
            return; // dropping `permit` here frees the slot for a fresh dial
        }
        self.idle
            .lock()
            .expect("pool idle queue poisoned")
            .push_back(Idle { conn, permit });
    }

    #[cfg(test)]
    fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// An exclusively-leased connection. Returned to the pool's idle queue on
/// drop unless it is broken, mirroring the check-in behavior of a checked
/// out database connection handle.
pub struct Leased {
    pool: Arc<Pool>,
    conn: ManuallyDrop<Connection>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Deref for Leased {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for Leased {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for Leased {
    fn drop(&mut self) {
        // SAFETY: conn is never read again after this take.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        if let Some(permit) = self.permit.take() {
            self.pool.check_in(conn, permit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_clamped_to_configured_bounds() {
        let config = ConnectConfig::default();
        let too_small = Pool::new(config.clone(), 0);
        assert_eq!(too_small.available_permits(), MIN_POOL_SIZE);

        let too_large = Pool::new(config, 1_000);
        assert_eq!(too_large.available_permits(), MAX_POOL_SIZE);
    }

    /// E3: with every permit already held and none released within the
    /// deadline, `acquire` returns `NoCapacity` without ever dialing out.
    #[tokio::test]
    async fn acquire_times_out_when_pool_has_no_capacity() {
        let pool = Pool::new(ConnectConfig::default(), 1);
        let held_permit = Arc::clone(&pool.semaphore).acquire_owned().await.unwrap();

        let start = Instant::now();
        let deadline = start + Duration::from_millis(50);
        let result = pool.acquire(deadline).await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::NoCapacity)));
        assert!(elapsed < Duration::from_millis(500), "did not honor the deadline: {elapsed:?}");
        drop(held_permit);
    }
}
