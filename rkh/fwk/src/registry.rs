//! Priority-indexed registration table and the ready set the cooperative
//! scheduler picks from.

use crate::{ActiveRef, RegistryError};
use core::cell::Cell;
use critical_section::Mutex;
use rkh_core::sync::Arc;
use rkh_core::{Priority, ReadyGroup, SchedulerHooks, MAX_PRIORITIES};

/// Active objects by priority, one per slot
pub struct Registry {
    slots: heapless::Vec<Option<ActiveRef>, MAX_PRIORITIES>,
}

impl Registry {
    /// Registry with `max_active` priority slots (0 ..= max_active - 1)
    pub fn new(max_active: usize) -> Self {
        let mut slots = heapless::Vec::new();
        for _ in 0..max_active.min(MAX_PRIORITIES) {
            // capacity is MAX_PRIORITIES, the loop never exceeds it
            let _ = slots.push(None);
        }
        Self { slots }
    }

    /// Number of priority slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, priority: Priority) -> Result<usize, RegistryError> {
        let index = priority.index();
        if index < self.slots.len() {
            Ok(index)
        } else {
            Err(RegistryError::PriorityOutOfRange {
                priority,
                max: self.slots.len(),
            })
        }
    }

    pub fn register(&mut self, active: ActiveRef) -> Result<(), RegistryError> {
        let priority = active.priority();
        let index = self.slot(priority)?;
        if self.slots[index].is_some() {
            return Err(RegistryError::PriorityTaken(priority));
        }
        log::debug!("registered `{}` at priority {}", active.name(), priority);
        self.slots[index] = Some(active);
        Ok(())
    }

    pub fn unregister(&mut self, priority: Priority) -> Result<ActiveRef, RegistryError> {
        let index = self.slot(priority)?;
        let active = self.slots[index]
            .take()
            .ok_or(RegistryError::NotRegistered(priority))?;
        log::debug!("unregistered `{}` from priority {}", active.name(), priority);
        Ok(active)
    }

    pub fn get(&self, priority: Priority) -> Option<ActiveRef> {
        self.slots.get(priority.index()).and_then(|slot| slot.clone())
    }

    pub fn is_registered(&self, priority: Priority) -> bool {
        self.slots
            .get(priority.index())
            .is_some_and(|slot| slot.is_some())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered objects, most urgent first
    pub fn iter(&self) -> impl Iterator<Item = &ActiveRef> + '_ {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|a| (a.priority(), a.name())))
            .finish()
    }
}

/// Priorities whose queue holds events, plus the port's own hooks.
///
/// Queues of registered objects report to this set; it records readiness
/// for the cooperative scheduler and forwards every call to the port.
pub struct ReadySet {
    ready: Mutex<Cell<ReadyGroup>>,
    port: Arc<dyn SchedulerHooks>,
}

impl ReadySet {
    pub fn new(port: Arc<dyn SchedulerHooks>) -> Self {
        Self {
            ready: Mutex::new(Cell::new(ReadyGroup::new())),
            port,
        }
    }

    /// Most urgent ready priority
    pub fn highest(&self) -> Option<Priority> {
        critical_section::with(|cs| self.ready.borrow(cs).get().highest())
    }

    pub fn is_ready(&self, priority: Priority) -> bool {
        critical_section::with(|cs| self.ready.borrow(cs).get().contains(priority))
    }

    pub fn snapshot(&self) -> ReadyGroup {
        critical_section::with(|cs| self.ready.borrow(cs).get())
    }

    fn update(&self, f: impl FnOnce(&mut ReadyGroup)) {
        critical_section::with(|cs| {
            let cell = self.ready.borrow(cs);
            let mut group = cell.get();
            f(&mut group);
            cell.set(group);
        });
    }
}

impl SchedulerHooks for ReadySet {
    fn notify_ready(&self, priority: Priority) {
        self.update(|group| group.insert(priority));
        self.port.notify_ready(priority);
    }

    fn notify_unready(&self, priority: Priority) {
        self.update(|group| group.remove(priority));
        self.port.notify_unready(priority);
    }

    fn block_until_ready(&self, priority: Priority) {
        self.port.block_until_ready(priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sma;
    use rkh_core::NoopHooks;
    use rkh_sm::StateChart;

    fn idle_sma(name: &'static str, prio: u8) -> ActiveRef {
        let mut b = StateChart::<()>::builder("idle");
        let s = b.basic("S", None);
        b.initial(s, None);
        let chart = Arc::new(b.build().unwrap());
        Sma::new(name, Priority::new(prio).unwrap(), chart, (), 4).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new(8);
        registry.register(idle_sma("a", 2)).unwrap();
        registry.register(idle_sma("b", 0)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.is_registered(Priority::new(2).unwrap()));
        let names: Vec<_> = registry.iter().map(|a| a.name()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn test_priority_collision_and_range() {
        let mut registry = Registry::new(4);
        registry.register(idle_sma("a", 1)).unwrap();
        assert_eq!(
            registry.register(idle_sma("b", 1)),
            Err(RegistryError::PriorityTaken(Priority::new(1).unwrap()))
        );
        assert_eq!(
            registry.register(idle_sma("c", 4)),
            Err(RegistryError::PriorityOutOfRange {
                priority: Priority::new(4).unwrap(),
                max: 4
            })
        );
    }

    #[test]
    fn test_unregister() {
        let mut registry = Registry::new(4);
        registry.register(idle_sma("a", 1)).unwrap();
        let prio = Priority::new(1).unwrap();
        assert_eq!(registry.unregister(prio).unwrap().name(), "a");
        assert!(registry.is_empty());
        assert!(matches!(
            registry.unregister(prio),
            Err(RegistryError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_ready_set_tracks_highest() {
        let set = ReadySet::new(Arc::new(NoopHooks));
        let low = Priority::new(9).unwrap();
        let high = Priority::new(2).unwrap();
        set.notify_ready(low);
        set.notify_ready(high);
        assert_eq!(set.highest(), Some(high));
        set.notify_unready(high);
        assert_eq!(set.highest(), Some(low));
        assert!(!set.is_ready(high));
    }
}
