//! Begin/end lifecycle event subscriptions.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::deferred::InstanceId;
use crate::error::Error;

/// Lifecycle events observable on a run loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    /// A fresh instance became current.
    Begin,
    /// An instance finished flushing and was torn down.
    End,
}

/// Token identifying one event subscription, used to unsubscribe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback invoked on lifecycle hooks and events with
/// `(instance, other_instance)`: `(current, previous)` for begins,
/// `(just_ended, next_current)` for ends.
pub type LifecycleHook = Rc<dyn Fn(InstanceId, Option<InstanceId>)>;

type SubscriberList = SmallVec<[(SubscriptionId, LifecycleHook); 2]>;

/// Subscriber table for the two lifecycle events.
#[derive(Default)]
pub(crate) struct EventTable {
    begin: SubscriberList,
    end: SubscriberList,
    next_id: u64,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, event: LoopEvent, hook: LifecycleHook) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.list_mut(event).push((id, hook));
        id
    }

    pub fn unsubscribe(&mut self, event: LoopEvent, id: SubscriptionId) -> Result<(), Error> {
        let list = self.list_mut(event);
        match list.iter().position(|(existing, _)| *existing == id) {
            Some(index) => {
                list.remove(index);
                Ok(())
            }
            None => Err(Error::UnknownSubscription(event)),
        }
    }

    /// Clone the current subscribers so callbacks can re-enter the table.
    pub fn snapshot(&self, event: LoopEvent) -> SmallVec<[LifecycleHook; 2]> {
        self.list(event).iter().map(|(_, hook)| hook.clone()).collect()
    }

    fn list(&self, event: LoopEvent) -> &SubscriberList {
        match event {
            LoopEvent::Begin => &self.begin,
            LoopEvent::End => &self.end,
        }
    }

    fn list_mut(&mut self, event: LoopEvent) -> &mut SubscriberList {
        match event {
            LoopEvent::Begin => &mut self.begin,
            LoopEvent::End => &mut self.end,
        }
    }
}
