//! A broadcast list that tolerates mutation while a broadcast is in flight.
//!
//! Observers are held as `Weak` references in an index-stable slot arena:
//! removing an observer mid-broadcast tombstones its slot instead of erasing
//! it, so live iterators never see their indices shift. Physical removal is
//! deferred to [`ObserverList::compact`], which runs when the last active
//! iterator is dropped. The list never owns its observers.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

pub struct ObserverList<T: ?Sized> {
    observers: RefCell<Vec<Option<Weak<T>>>>,
    notify_depth: Cell<usize>,
}

impl<T: ?Sized> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            observers: RefCell::new(Vec::new()),
            notify_depth: Cell::new(0),
        }
    }

    /// Register an observer. Re-adding one already present is a no-op.
    pub fn add_observer(&self, observer: &Rc<T>) {
        if self.has_observer(observer) {
            return;
        }
        self.observers.borrow_mut().push(Some(Rc::downgrade(observer)));
    }

    /// Unregister an observer; accepts one that was never added.
    pub fn remove_observer(&self, observer: &Rc<T>) {
        let mut observers = self.observers.borrow_mut();
        let Some(index) = observers
            .iter()
            .position(|slot| slot_is(slot, observer))
        else {
            return;
        };
        if self.notify_depth.get() > 0 {
            observers[index] = None;
        } else {
            observers.remove(index);
        }
    }

    pub fn has_observer(&self, observer: &Rc<T>) -> bool {
        self.observers
            .borrow()
            .iter()
            .any(|slot| slot_is(slot, observer))
    }

    pub fn clear(&self) {
        let mut observers = self.observers.borrow_mut();
        if self.notify_depth.get() > 0 {
            observers.iter_mut().for_each(|slot| *slot = None);
        } else {
            observers.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        !self
            .observers
            .borrow()
            .iter()
            .any(|slot| slot.as_ref().is_some_and(|w| w.strong_count() > 0))
    }

    /// Start a broadcast. The iterator yields strong references and skips
    /// slots tombstoned or dropped while the broadcast is running.
    pub fn iter(&self) -> Iter<'_, T> {
        self.notify_depth.set(self.notify_depth.get() + 1);
        Iter {
            list: self,
            index: 0,
        }
    }

    /// Broadcast helper: invoke `f` once per live observer.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for observer in self.iter() {
            f(&observer);
        }
    }

    fn compact(&self) {
        self.observers
            .borrow_mut()
            .retain(|slot| slot.as_ref().is_some_and(|w| w.strong_count() > 0));
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.observers.borrow().len()
    }
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_is<T: ?Sized>(slot: &Option<Weak<T>>, observer: &Rc<T>) -> bool {
    slot.as_ref()
        .and_then(Weak::upgrade)
        .is_some_and(|rc| Rc::ptr_eq(&rc, observer))
}

pub struct Iter<'a, T: ?Sized> {
    list: &'a ObserverList<T>,
    index: usize,
}

impl<T: ?Sized> Iterator for Iter<'_, T> {
    type Item = Rc<T>;

    fn next(&mut self) -> Option<Rc<T>> {
        loop {
            // Borrow only long enough to copy the slot out: the observer we
            // hand back is free to mutate the list.
            let slot = {
                let observers = self.list.observers.borrow();
                if self.index >= observers.len() {
                    return None;
                }
                observers[self.index].clone()
            };
            self.index += 1;
            if let Some(observer) = slot.and_then(|w| w.upgrade()) {
                return Some(observer);
            }
        }
    }
}

impl<T: ?Sized> Drop for Iter<'_, T> {
    fn drop(&mut self) {
        let depth = self.list.notify_depth.get() - 1;
        self.list.notify_depth.set(depth);
        if depth == 0 {
            self.list.compact();
        }
    }
}
