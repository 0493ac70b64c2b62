//! Framework instance: event pools, active object registry, cooperative
//! scheduler and fatal-error handling.

use crate::{
    Active, ActiveRef, FrameworkError, FrameworkResult, PostError, Queue, ReadySet, Registry,
};
use alloc::{boxed::Box, format, string::String, vec::Vec};
use core::fmt;
use rkh_core::sync::{Arc, Mutex};
use rkh_core::{
    default_fatal_hook, Evt, Fatal, FatalHook, NoopHooks, PoolId, Priority, ReadyGroup,
    SchedulerHooks, Sender, Signal, MAX_PRIORITIES,
};
use rkh_mem::{EventPools, PoolError, PoolResult, PoolStats, Release, MAX_EVENT_POOLS};
use rkh_sm::DispatchStatus;

/// What a post does when the target queue is full.
///
/// In every case the reference the post took on the event is handed back,
/// so a dropped dynamic event returns to its pool.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the event, log a warning and report success
    #[default]
    Drop,
    /// Drop the event and report [`PostError::QueueFull`]
    Reject,
    /// Drop the event and raise a fatal error
    Fatal,
}

/// Called with the target object and the event just before each dispatch
pub type DispatchHook = fn(&dyn Active, &Evt);

/// Configuration of a framework instance.
#[derive(Debug, Clone)]
pub struct FrameworkConfig {
    pub name: &'static str,
    /// Priority slots, 0 ..= max_active - 1
    pub max_active: usize,
    pub max_event_pools: usize,
    pub overflow_policy: OverflowPolicy,
    pub fatal_hook: FatalHook,
    pub idle_callback: Option<fn()>,
    pub dispatch_hook: Option<DispatchHook>,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            name: "RKH",
            max_active: 16,
            max_event_pools: 3,
            overflow_policy: OverflowPolicy::Drop,
            fatal_hook: default_fatal_hook,
            idle_callback: None,
            dispatch_hook: None,
        }
    }
}

impl FrameworkConfig {
    /// Creates a new framework configuration builder.
    pub fn builder() -> FrameworkConfigBuilder {
        FrameworkConfigBuilder::default()
    }
}

/// Builder for ergonomic framework configuration construction.
#[derive(Debug, Clone, Default)]
pub struct FrameworkConfigBuilder {
    config: FrameworkConfig,
}

impl FrameworkConfigBuilder {
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    /// Sets the number of priority slots (at most 64).
    pub fn max_active(mut self, max: usize) -> Self {
        self.config.max_active = max;
        self
    }

    /// Sets the number of event pools (at most `MAX_EVENT_POOLS`).
    pub fn max_event_pools(mut self, max: usize) -> Self {
        self.config.max_event_pools = max;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.overflow_policy = policy;
        self
    }

    pub fn fatal_hook(mut self, hook: FatalHook) -> Self {
        self.config.fatal_hook = hook;
        self
    }

    /// Sets the function `run_until_idle` calls once every queue is empty.
    pub fn idle_callback(mut self, callback: fn()) -> Self {
        self.config.idle_callback = Some(callback);
        self
    }

    /// Sets the function [`Framework::dispatch`] calls before every dispatch.
    pub fn dispatch_hook(mut self, hook: DispatchHook) -> Self {
        self.config.dispatch_hook = Some(hook);
        self
    }

    pub fn build(self) -> FrameworkConfig {
        self.config
    }
}

/// One framework instance.
///
/// Pools are registered while the instance is exclusively owned; after
/// that every operation takes `&self`, so the instance can be shared
/// behind an `Arc` between threads and interrupt-like producers.
pub struct Framework {
    config: FrameworkConfig,
    pools: EventPools,
    registry: Mutex<Registry>,
    ready: Arc<ReadySet>,
}

impl Framework {
    /// Framework scheduled cooperatively through [`run_once`](Self::run_once)
    pub fn new(config: FrameworkConfig) -> FrameworkResult<Self> {
        Self::with_port(config, Arc::new(NoopHooks))
    }

    /// Framework whose queues also report to `port` (threaded ports block
    /// and wake active objects through it)
    pub fn with_port(
        config: FrameworkConfig,
        port: Arc<dyn SchedulerHooks>,
    ) -> FrameworkResult<Self> {
        if config.max_active > MAX_PRIORITIES {
            return Err(FrameworkError::TooManyActive(config.max_active));
        }
        if config.max_event_pools > MAX_EVENT_POOLS {
            return Err(PoolError::RegistryFull {
                capacity: MAX_EVENT_POOLS,
            }
            .into());
        }
        log::debug!(
            "framework `{}` up: {} priorities, {} event pools, {:?} on overflow",
            config.name,
            config.max_active,
            config.max_event_pools,
            config.overflow_policy
        );
        Ok(Self {
            pools: EventPools::with_capacity(config.max_event_pools),
            registry: Mutex::new(Registry::new(config.max_active)),
            ready: Arc::new(ReadySet::new(port)),
            config,
        })
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    /// Report a fatal defect through the configured hook
    pub fn fatal(&self, module: &'static str, message: impl Into<String>) {
        let fatal = Fatal::new(module, message);
        log::error!("{}: {}", self.config.name, fatal);
        (self.config.fatal_hook)(&fatal);
    }

    // ---- event pools ----------------------------------------------------

    /// Register an event pool over `storage`. Pools must be registered in
    /// non-decreasing block size.
    pub fn register_pool(&mut self, storage: Box<[u8]>, block_size: usize) -> PoolResult<PoolId> {
        self.pools.register(storage, block_size)
    }

    /// Register an event pool of `blocks` blocks of `block_size` bytes
    pub fn register_pool_blocks(&mut self, blocks: usize, block_size: usize) -> PoolResult<PoolId> {
        self.pools.register_blocks(blocks, block_size)
    }

    pub fn pools(&self) -> &EventPools {
        &self.pools
    }

    pub fn pool_stats(&self, id: PoolId) -> PoolResult<PoolStats> {
        self.pools.stats(id)
    }

    /// Allocate an event with room for `size` payload bytes. Running out of
    /// blocks is fatal.
    pub fn allocate(&self, size: usize, signal: Signal, sender: Option<Sender>) -> PoolResult<Evt> {
        self.pools
            .allocate(size, signal, sender)
            .inspect_err(|err| self.fatal("evtpool", format!("allocating {signal}: {err}")))
    }

    /// Allocate an event carrying a copy of `payload`
    pub fn allocate_with(
        &self,
        signal: Signal,
        payload: &[u8],
        sender: Option<Sender>,
    ) -> PoolResult<Evt> {
        self.pools
            .allocate_with(signal, payload, sender)
            .inspect_err(|err| self.fatal("evtpool", format!("allocating {signal}: {err}")))
    }

    pub fn reserve(&self, evt: &Evt) -> PoolResult<()> {
        self.pools.reserve(evt)
    }

    /// Drop one reference to `evt` (garbage collection)
    pub fn release(&self, evt: &Evt, sender: Option<Sender>) -> PoolResult<Release> {
        self.pools.release(evt, sender)
    }

    /// Copy the payload of `evt` into `buf`
    pub fn payload(&self, evt: &Evt, buf: &mut [u8]) -> PoolResult<usize> {
        self.pools.copy_payload(evt, buf)
    }

    pub fn with_payload<R>(&self, evt: &Evt, f: impl FnOnce(&[u8]) -> R) -> PoolResult<R> {
        self.pools.with_payload(evt, f)
    }

    // ---- active objects -------------------------------------------------

    /// Bind the object's queue to the scheduler, register it and take its
    /// initial transition. An object whose initial transition fails is
    /// terminated again before the fatal hook runs.
    pub fn activate(&self, active: ActiveRef) -> FrameworkResult<DispatchStatus> {
        let priority = active.priority();
        self.registry.lock().register(active.clone())?;
        active.queue().bind(priority, self.ready.clone());
        log::debug!("activated `{}` at priority {}", active.name(), priority);
        active.init().map_err(|source| {
            if let Err(err) = self.terminate(priority) {
                log::warn!("undoing activation of `{}`: {}", active.name(), err);
            }
            self.fatal("sma", format!("`{}` init failed: {source}", active.name()));
            FrameworkError::Dispatch {
                name: active.name(),
                source,
            }
        })
    }

    /// Unregister the object at `priority`, releasing every queued event
    pub fn terminate(&self, priority: Priority) -> FrameworkResult<ActiveRef> {
        let active = self.registry.lock().unregister(priority)?;
        let queue = active.queue();
        // unbound first: late posts can no longer flag the priority
        queue.unbind();
        while let Ok(evt) = queue.try_get() {
            self.gc(&evt);
        }
        queue.deplete();
        self.ready.notify_unready(priority);
        log::debug!("terminated `{}`", active.name());
        Ok(active)
    }

    pub fn active(&self, priority: Priority) -> Option<ActiveRef> {
        self.registry.lock().get(priority)
    }

    pub fn registered(&self) -> Vec<ActiveRef> {
        self.registry.lock().iter().cloned().collect()
    }

    /// Priorities with pending events
    pub fn ready(&self) -> ReadyGroup {
        self.ready.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn ready_set(&self) -> &ReadySet {
        &self.ready
    }

    fn lookup(&self, priority: Priority) -> Result<ActiveRef, PostError> {
        self.active(priority)
            .ok_or(PostError::NotRegistered(priority))
    }

    /// Post `evt` to the tail of the queue of the object at `priority`
    pub fn post_fifo(
        &self,
        priority: Priority,
        evt: &Evt,
        sender: Option<Sender>,
    ) -> Result<(), PostError> {
        let target = self.lookup(priority)?;
        self.post(target.as_ref(), evt, sender, false).map(drop)
    }

    /// Post `evt` to the head of the queue of the object at `priority`
    pub fn post_lifo(
        &self,
        priority: Priority,
        evt: &Evt,
        sender: Option<Sender>,
    ) -> Result<(), PostError> {
        let target = self.lookup(priority)?;
        self.post(target.as_ref(), evt, sender, true).map(drop)
    }

    /// Post to an object directly, registered or not
    pub fn post_to(
        &self,
        target: &dyn Active,
        evt: &Evt,
        sender: Option<Sender>,
    ) -> Result<(), PostError> {
        self.post(target, evt, sender, false).map(drop)
    }

    /// Returns whether the event was queued
    fn post(
        &self,
        target: &dyn Active,
        evt: &Evt,
        sender: Option<Sender>,
        lifo: bool,
    ) -> Result<bool, PostError> {
        // the reference and the insertion form one critical section, so a
        // concurrent release cannot reclaim the event in between
        let queued = critical_section::with(|cs| -> PoolResult<bool> {
            self.pools.reserve_in(cs, evt)?;
            let put = if lifo {
                target.queue().put_lifo_in(cs, *evt)
            } else {
                target.queue().put_fifo_in(cs, *evt)
            };
            match put {
                Ok(()) => Ok(true),
                Err(err) => {
                    log::debug!("posting {} to `{}`: {}", evt, target.name(), err);
                    self.pools.release_in(cs, evt, sender)?;
                    Ok(false)
                }
            }
        });
        match queued {
            Ok(true) => {
                match sender {
                    Some(sender) => log::trace!("{} -> `{}` from {}", evt, target.name(), sender),
                    None => log::trace!("{} -> `{}`", evt, target.name()),
                }
                Ok(true)
            }
            Ok(false) => self.overflow(target, evt).map(|()| false),
            Err(err) => Err(PostError::Pool(err)),
        }
    }

    fn overflow(&self, target: &dyn Active, evt: &Evt) -> Result<(), PostError> {
        let priority = target.priority();
        match self.config.overflow_policy {
            OverflowPolicy::Drop => {
                log::warn!("queue of `{}` full, {} dropped", target.name(), evt);
                Ok(())
            }
            OverflowPolicy::Reject => Err(PostError::QueueFull(priority)),
            OverflowPolicy::Fatal => {
                self.fatal("queue", format!("queue of `{}` full posting {}", target.name(), evt));
                Err(PostError::QueueFull(priority))
            }
        }
    }

    /// Park `evt` in an auxiliary queue, keeping a reference to it
    pub fn defer(&self, queue: &Queue<Evt>, evt: &Evt) -> Result<(), PostError> {
        critical_section::with(|cs| -> Result<(), PostError> {
            self.pools.reserve_in(cs, evt)?;
            if queue.put_fifo_in(cs, *evt).is_err() {
                self.pools.release_in(cs, evt, None)?;
                return Err(PostError::DeferredQueueFull);
            }
            Ok(())
        })
        .inspect(|()| log::trace!("{} deferred", evt))
    }

    /// Move the oldest deferred event to the front of the queue of the
    /// object at `priority`
    pub fn recall(&self, priority: Priority, queue: &Queue<Evt>) -> Result<Option<Evt>, PostError> {
        let Ok(evt) = queue.try_get() else {
            return Ok(None);
        };
        let target = match self.lookup(priority) {
            Ok(target) => target,
            Err(err) => {
                self.gc(&evt);
                return Err(err);
            }
        };
        if !self.post(target.as_ref(), &evt, Some(Sender(target.name())), true)? {
            // dropped by the overflow policy, nobody holds it any more
            self.gc(&evt);
            return Ok(None);
        }

        if evt.is_dynamic() {
            // one reference for the deferred queue, one for the object's queue
            let held = self.pools.ref_count(&evt)?;
            if held <= 1 {
                self.fatal("sma", format!("recalled {evt} held {held} references"));
                return Err(PostError::RecallUnderflow(held));
            }
            self.pools.release(&evt, None)?;
        }
        log::trace!("{} recalled by `{}`", evt, target.name());
        Ok(Some(evt))
    }

    /// Drop the framework's reference to a dispatched event
    fn gc(&self, evt: &Evt) {
        if let Err(err) = self.pools.release(evt, None) {
            self.fatal("evtpool", format!("garbage collecting {evt}: {err}"));
        }
    }

    /// Take the next event of the object at `priority`, blocking through the
    /// port when its queue is empty
    pub fn get(&self, priority: Priority) -> Option<Evt> {
        self.active(priority)?.queue().get()
    }

    /// Dispatch `evt` to `active` and release it afterwards
    pub fn dispatch(&self, active: &dyn Active, evt: &Evt) -> FrameworkResult<DispatchStatus> {
        if let Some(hook) = self.config.dispatch_hook {
            hook(active, evt);
        }
        let result = active.dispatch(evt);
        self.gc(evt);
        result.map_err(|source| {
            self.fatal("sm", format!("`{}` dispatching {evt}: {source}", active.name()));
            FrameworkError::Dispatch {
                name: active.name(),
                source,
            }
        })
    }

    /// Dispatch one event of the most urgent ready object. Returns whether
    /// anything was dispatched.
    pub fn run_once(&self) -> FrameworkResult<bool> {
        while let Some(priority) = self.ready.highest() {
            // checking and clearing share one critical section with the
            // posts that set the flag, so a fresh post is never lost
            let next = critical_section::with(|cs| {
                let active = self.active(priority);
                let evt = active
                    .as_ref()
                    .and_then(|active| active.queue().try_get_in(cs).ok());
                if evt.is_none() {
                    self.ready.notify_unready(priority);
                }
                active.zip(evt)
            });
            match next {
                Some((active, evt)) => {
                    self.dispatch(active.as_ref(), &evt)?;
                    return Ok(true);
                }
                None => log::debug!("priority {} flagged with nothing to run", priority),
            }
        }
        Ok(false)
    }

    /// Dispatch until every queue is empty, then call the idle callback.
    /// Returns the number of events dispatched.
    pub fn run_until_idle(&self) -> FrameworkResult<usize> {
        let mut dispatched = 0;
        while self.run_once()? {
            dispatched += 1;
        }
        if let Some(idle) = self.config.idle_callback {
            idle();
        }
        Ok(dispatched)
    }
}

impl fmt::Debug for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the registry lock is never held while entering a critical section
        let ready = self.ready.snapshot();
        f.debug_struct("Framework")
            .field("name", &self.config.name)
            .field("pools", &self.pools)
            .field("registry", &*self.registry.lock())
            .field("ready", &ready)
            .finish()
    }
}
