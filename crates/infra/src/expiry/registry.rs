use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use payrecon_core::InvoiceId;

#[derive(Debug)]
struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Inner {
    next_generation: u64,
    slots: HashMap<InvoiceId, Slot>,
}

/// Arena of pending expiry timers, one per invoice.
///
/// Cloning shares the arena. Each armed timer gets a generation number so a
/// timer that fires can clear its own slot without clobbering a newer one
/// armed for the same invoice.
#[derive(Debug, Clone, Default)]
pub struct TimerRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reserve a generation for a timer about to be spawned.
    pub fn next_generation(&self) -> u64 {
        let mut inner = self.lock();
        inner.next_generation += 1;
        inner.next_generation
    }

    /// Store a timer handle, aborting any previous timer for the invoice.
    pub fn insert(&self, invoice_id: InvoiceId, generation: u64, handle: JoinHandle<()>) {
        let previous = self.lock().slots.insert(invoice_id, Slot { generation, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Abort and forget the invoice's timer. Returns whether one was armed.
    pub fn cancel(&self, invoice_id: &InvoiceId) -> bool {
        match self.lock().slots.remove(invoice_id) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget the slot if it still belongs to `generation`. Called by a timer
    /// once it has fired, so it does not abort itself.
    pub fn release(&self, invoice_id: &InvoiceId, generation: u64) {
        let mut inner = self.lock();
        if inner
            .slots
            .get(invoice_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            inner.slots.remove(invoice_id);
        }
    }

    pub fn is_armed(&self, invoice_id: &InvoiceId) -> bool {
        self.lock().slots.contains_key(invoice_id)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every timer (shutdown).
    pub fn clear(&self) {
        let slots: Vec<Slot> = self.lock().slots.drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> JoinHandle<()> {
        tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)))
    }

    #[tokio::test]
    async fn rearming_aborts_the_previous_timer() {
        let registry = TimerRegistry::new();
        let id: InvoiceId = "inv-1".parse().unwrap();

        let (alive, dropped) = tokio::sync::oneshot::channel::<()>();
        let first = tokio::spawn(async move {
            let _alive = alive;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        registry.insert(id.clone(), registry.next_generation(), first);
        registry.insert(id.clone(), registry.next_generation(), sleeper());

        // The aborted task drops its sender without sending.
        assert!(dropped.await.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn release_only_clears_matching_generation() {
        let registry = TimerRegistry::new();
        let id: InvoiceId = "inv-1".parse().unwrap();

        let old = registry.next_generation();
        let new = registry.next_generation();
        registry.insert(id.clone(), new, sleeper());

        registry.release(&id, old);
        assert!(registry.is_armed(&id));
        registry.release(&id, new);
        assert!(!registry.is_armed(&id));
    }

    #[tokio::test]
    async fn cancel_reports_whether_a_timer_existed() {
        let registry = TimerRegistry::new();
        let id: InvoiceId = "inv-1".parse().unwrap();

        assert!(!registry.cancel(&id));
        registry.insert(id.clone(), registry.next_generation(), sleeper());
        assert!(registry.cancel(&id));
        assert!(registry.is_empty());
    }
}
