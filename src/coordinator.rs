//! Producer/consumer handoff of one device-ready CF set per spectral window.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{CfCacheError, CfResult};

/// A boolean flag one side raises and the other waits on.
#[derive(Debug, Default)]
pub struct Handoff {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Handoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: bool) {
        *self.flag.lock() = value;
    }

    pub fn get(&self) -> bool {
        *self.flag.lock()
    }

    pub fn notify(&self) {
        let _guard = self.flag.lock();
        self.cond.notify_all();
    }

    /// Block until the flag is raised or `stop` is set. Returns the flag.
    ///
    /// `stop` is checked under the flag's lock; whoever sets it must call
    /// [`Handoff::notify`] afterwards.
    pub fn wait(&self, stop: &AtomicBool) -> bool {
        let mut flag = self.flag.lock();
        loop {
            if *flag {
                return true;
            }
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            self.cond.wait(&mut flag);
        }
    }
}

/// What the producer hands over for one spectral window.
#[derive(Debug)]
pub enum CfPublication<H> {
    New(H),
    /// Same CF set as last time; the consumer keeps what it has.
    Unchanged,
}

/// CFReady / CFSent handoffs, the end-of-data latch and the single handle slot.
#[derive(Debug)]
pub struct ThreadCoordinator<H> {
    cf_ready: Handoff,
    cf_sent: Handoff,
    eod: AtomicBool,
    slot: Mutex<Option<CfPublication<H>>>,
    published: AtomicUsize,
    consumed: AtomicUsize,
}

impl<H> Default for ThreadCoordinator<H> {
    fn default() -> Self {
        Self {
            cf_ready: Handoff::new(),
            cf_sent: Handoff::new(),
            eod: AtomicBool::new(false),
            slot: Mutex::new(None),
            published: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
        }
    }
}

impl<H> ThreadCoordinator<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cf_ready(&self, value: bool) {
        self.cf_ready.set(value);
    }

    pub fn set_cf_sent(&self, value: bool) {
        self.cf_sent.set(value);
    }

    /// Latch end-of-data and wake every waiter. Cannot be undone.
    pub fn set_eod(&self) {
        if !self.eod.swap(true, Ordering::SeqCst) {
            debug!("end of data latched");
        }
        self.cf_ready.notify();
        self.cf_sent.notify();
    }

    pub fn is_eod(&self) -> bool {
        self.eod.load(Ordering::SeqCst)
    }

    pub fn is_cf_ready(&self) -> bool {
        self.cf_ready.get()
    }

    pub fn is_cf_sent(&self) -> bool {
        self.cf_sent.get()
    }

    /// True when CFReady was observed, false when end-of-data released the wait.
    pub fn wait_for_cf_ready_or_eod(&self) -> bool {
        self.cf_ready.wait(&self.eod)
    }

    /// True when CFSent was observed, false when end-of-data released the wait.
    pub fn wait_for_cf_sent(&self) -> bool {
        self.cf_sent.wait(&self.eod)
    }

    pub fn notify_cf_ready(&self) {
        self.cf_ready.notify();
    }

    pub fn notify_cf_sent(&self) {
        self.cf_sent.notify();
    }

    /// Move a CF set into the slot. The previous one must have been taken.
    pub fn publish(&self, publication: CfPublication<H>) -> CfResult<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(CfCacheError::ProtocolViolation(
                "previous CF set was never taken by the consumer".into(),
            ));
        }
        *slot = Some(publication);
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn take_publication(&self) -> Option<CfPublication<H>> {
        let taken = self.slot.lock().take();
        if taken.is_some() {
            self.consumed.fetch_add(1, Ordering::SeqCst);
        }
        taken
    }

    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn consumed_count(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }
}

/// Hooks the consumer loop calls around spectral-window changes.
pub trait SpwHooks<H> {
    /// Block for the next CF set. `None` means keep the current one.
    fn on_new_spectral_window(&self) -> CfResult<Option<H>>;

    /// The consumer no longer needs the producer to hold back.
    fn on_handle_consumed(&self);

    fn on_end_of_data(&self);
}

impl<H: Send> SpwHooks<H> for ThreadCoordinator<H> {
    fn on_new_spectral_window(&self) -> CfResult<Option<H>> {
        if !self.wait_for_cf_ready_or_eod() {
            return match self.take_publication() {
                Some(CfPublication::New(handle)) => Ok(Some(handle)),
                _ => Ok(None),
            };
        }
        self.set_cf_ready(false);
        match self.take_publication() {
            Some(CfPublication::New(handle)) => Ok(Some(handle)),
            Some(CfPublication::Unchanged) => Ok(None),
            None => Err(CfCacheError::ProtocolViolation(
                "CFReady was set but no CF set was published".into(),
            )),
        }
    }

    fn on_handle_consumed(&self) {
        if self.is_eod() {
            return;
        }
        self.set_cf_sent(true);
        self.notify_cf_sent();
    }

    fn on_end_of_data(&self) {
        if self.published_count() > self.consumed_count() {
            warn!("end of data with an unconsumed CF set in the slot");
        }
        self.set_eod();
        self.set_cf_sent(true);
        self.notify_cf_sent();
    }
}
