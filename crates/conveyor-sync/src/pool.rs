//! Bounded asynchronous resource pool.
//!
//! Lends at most `max` resources (broker channels, connections) to concurrent
//! users. Idle resources are recycled oldest-first and saturated callers queue
//! up in arrival order, so allocation is fair. Resources are created lazily
//! through a [`Manager`] and destroyed only in a bulk [`Pool::drain_all`].

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

/// Creates and destroys pooled resources.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Resource: Send + 'static;
    type Error: Send + 'static;
    /// What the destroyer reports back for each resource torn down in a drain.
    type DrainResponse: Send + 'static;

    async fn create(&self) -> Result<Self::Resource, Self::Error>;

    async fn destroy(&self, resource: Self::Resource)
        -> Result<Self::DrainResponse, Self::Error>;
}

struct PoolState<R> {
    /// Idle resources, oldest first.
    idle: VecDeque<R>,
    /// Callers suspended because the pool is saturated, oldest first.
    waiters: VecDeque<oneshot::Sender<R>>,
    /// Resources in existence: idle + checked out.
    owned: usize,
    checked_out: usize,
}

/// Snapshot of pool occupancy, mainly for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub owned: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub waiters: usize,
}

pub struct Pool<M: Manager> {
    manager: M,
    max: usize,
    state: Mutex<PoolState<M::Resource>>,
    /// Latched high when the in-use set empties; lowered again on acquire.
    empty_tx: watch::Sender<bool>,
    empty_rx: watch::Receiver<bool>,
}

impl<M: Manager> Pool<M> {
    pub fn new(manager: M, max: usize) -> Self {
        let (empty_tx, empty_rx) = watch::channel(true);
        Self {
            manager,
            max,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                owned: 0,
                checked_out: 0,
            }),
            empty_tx,
            empty_rx,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            owned: state.owned,
            idle: state.idle.len(),
            checked_out: state.checked_out,
            waiters: state.waiters.len(),
        }
    }

    /// Borrow a resource, suspending if all `max` are checked out.
    ///
    /// The returned guard gives the resource back when dropped, forwarding it
    /// directly to the longest-suspended waiter if one exists.
    pub async fn acquire(&self) -> Result<PoolGuard<'_, M>, M::Error> {
        enum Plan<R> {
            Ready(R),
            Create,
            Wait(oneshot::Receiver<R>),
        }

        let plan = {
            let mut state = self.state.lock();
            let _ = self.empty_tx.send(false);

            if let Some(resource) = state.idle.pop_front() {
                state.checked_out += 1;
                Plan::Ready(resource)
            } else if state.owned < self.max {
                // Reserve the slot before creating so concurrent acquires
                // cannot overshoot `max` while we are connecting.
                state.owned += 1;
                state.checked_out += 1;
                Plan::Create
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Plan::Wait(rx)
            }
        };

        match plan {
            Plan::Ready(resource) => Ok(self.guard(resource)),
            Plan::Create => match self.manager.create().await {
                Ok(resource) => Ok(self.guard(resource)),
                Err(err) => {
                    let mut state = self.state.lock();
                    state.owned -= 1;
                    state.checked_out -= 1;
                    Err(err)
                }
            },
            // The pool must outlive suspended waiters; dropping it
            // mid-acquire is a caller bug on par with releasing a foreign
            // resource.
            Plan::Wait(receiver) => {
                let resource = receiver
                    .await
                    .expect("pool dropped while an acquire was suspended");
                Ok(self.guard(resource))
            }
        }
    }

    /// Wait for every checked-out resource to come home, then destroy all
    /// idle resources and return the destroyer's responses.
    ///
    /// Acquiring concurrently with a drain is a caller error; the pool makes
    /// no attempt to arbitrate between the two.
    pub async fn drain_all(&self) -> Result<Vec<M::DrainResponse>, M::Error> {
        let mut empty = self.empty_rx.clone();
        loop {
            if self.state.lock().checked_out == 0 {
                break;
            }
            if empty.changed().await.is_err() {
                break;
            }
        }

        let idle: Vec<M::Resource> = {
            let mut state = self.state.lock();
            state.owned -= state.idle.len();
            state.idle.drain(..).collect()
        };

        tracing::debug!(count = idle.len(), "draining pool");
        let mut responses = Vec::with_capacity(idle.len());
        for resource in idle {
            responses.push(self.manager.destroy(resource).await?);
        }
        Ok(responses)
    }

    fn guard(&self, resource: M::Resource) -> PoolGuard<'_, M> {
        PoolGuard {
            pool: self,
            resource: Some(resource),
        }
    }

    fn release(&self, resource: M::Resource) {
        let mut state = self.state.lock();

        // Hand off directly to the head of the waiter queue; the resource
        // stays checked out under its new owner.
        let mut resource = resource;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(resource) {
                Ok(()) => return,
                // The waiter gave up (cancelled acquire); try the next one.
                Err(returned) => resource = returned,
            }
        }

        state.checked_out -= 1;
        state.idle.push_back(resource);
        if state.checked_out == 0 {
            let _ = self.empty_tx.send(true);
        }
    }
}

/// Exclusive handle on a pooled resource. Dropping it releases the resource
/// back to the pool, so a resource can never be returned twice or to the
/// wrong pool.
pub struct PoolGuard<'a, M: Manager> {
    pool: &'a Pool<M>,
    resource: Option<M::Resource>,
}

impl<M: Manager> Deref for PoolGuard<'_, M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource
            .as_ref()
            .expect("pool guard used after release")
    }
}

impl<M: Manager> DerefMut for PoolGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource
            .as_mut()
            .expect("pool guard used after release")
    }
}

impl<M: Manager> Drop for PoolGuard<'_, M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}
