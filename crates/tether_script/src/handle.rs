//! Native handles backing shared-object wrappers.
//!
//! Every wrapper the prelude builds carries one [`ObjectHandle`] in a hidden
//! property. QuickJS finalizes the handle when the wrapper is collected, and
//! the last handle for an id queues that id for release. The queue is drained
//! on the JS thread between jobs, never from inside the collector.

use rquickjs::class::Trace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Live handle counts per object id, plus ids whose last handle is gone.
#[derive(Default)]
pub(crate) struct LiveObjects {
    counts: RefCell<HashMap<u64, usize>>,
    released: RefCell<Vec<u64>>,
}

impl LiveObjects {
    pub(crate) fn handle(self: &Rc<Self>, id: u64) -> ObjectHandle {
        *self.counts.borrow_mut().entry(id).or_insert(0) += 1;
        ObjectHandle {
            id,
            live: self.clone(),
        }
    }

    fn drop_handle(&self, id: u64) {
        let mut counts = self.counts.borrow_mut();
        let Some(count) = counts.get_mut(&id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            counts.remove(&id);
            self.released.borrow_mut().push(id);
        }
    }

    /// Ids that lost their last wrapper since the previous call.
    pub(crate) fn take_released(&self) -> Vec<u64> {
        std::mem::take(&mut *self.released.borrow_mut())
    }

    /// Number of ids that still have a live wrapper.
    pub(crate) fn tracked(&self) -> usize {
        self.counts.borrow().len()
    }
}

#[derive(Trace)]
#[rquickjs::class]
pub(crate) struct ObjectHandle {
    #[qjs(skip_trace)]
    id: u64,
    #[qjs(skip_trace)]
    live: Rc<LiveObjects>,
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        self.live.drop_handle(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_handle_queues_the_release() {
        let live = Rc::new(LiveObjects::default());
        let first = live.handle(7);
        let second = live.handle(7);
        assert_eq!(live.tracked(), 1);

        drop(first);
        assert!(live.take_released().is_empty());

        drop(second);
        assert_eq!(live.take_released(), vec![7]);
        assert_eq!(live.tracked(), 0);
        assert!(live.take_released().is_empty());
    }

    #[test]
    fn rewrapping_after_release_starts_a_new_count() {
        let live = Rc::new(LiveObjects::default());
        drop(live.handle(3));
        let again = live.handle(3);
        assert_eq!(live.take_released(), vec![3]);
        assert_eq!(live.tracked(), 1);
        drop(again);
        assert_eq!(live.take_released(), vec![3]);
    }
}
