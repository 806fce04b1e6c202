use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Slots {
    active: usize,
    peak: usize,
}

/// Counting permit pool bounding how many connections are served at once.
#[derive(Debug)]
pub struct AdmissionGate {
    slots: Mutex<Slots>,
    released: Condvar,
    capacity: usize,
}

/// One admitted connection. The slot goes back to the gate when this drops.
#[derive(Debug)]
pub struct Permit<'a> {
    gate: &'a AdmissionGate,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self { slots: Mutex::new(Slots::default()), released: Condvar::new(), capacity }
    }

    /// Blocks until a slot is free.
    pub fn acquire(&self) -> Permit<'_> {
        let mut slots = self.slots.lock();
        while slots.active >= self.capacity {
            self.released.wait(&mut slots);
        }
        self.admit(&mut slots)
    }

    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut slots = self.slots.lock();
        if slots.active >= self.capacity {
            return None;
        }
        Some(self.admit(&mut slots))
    }

    fn admit(&self, slots: &mut Slots) -> Permit<'_> {
        slots.active += 1;
        slots.peak = slots.peak.max(slots.active);
        Permit { gate: self }
    }

    fn release(&self) {
        let mut slots = self.slots.lock();
        assert!(slots.active > 0, "admission gate released more permits than it issued");
        slots.active -= 1;
        drop(slots);
        self.released.notify_one();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.slots.lock().active
    }

    pub fn available(&self) -> usize {
        self.capacity - self.active()
    }

    /// Highest number of permits ever held at the same time.
    pub fn peak(&self) -> usize {
        self.slots.lock().peak
    }
}

impl<'a> Drop for Permit<'a> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
