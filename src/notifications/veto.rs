//! Two-phase notificators
//!
//! A [`VetoNotificator`] guards a state change in two steps:
//!
//! 1. **vote**: every registered voter sees the proposed change and may veto it
//! 2. **notify**: observers are told about the change, but only after the owner
//!    actually applied it
//!
//! [`Observers`] is the notify-only half, used for purely informational events.
//!
//! Handlers run outside the internal lock, in registration order, on the
//! calling thread. A panicking voter counts as a veto; a panicking observer is
//! logged and the remaining observers still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned on registration, used to unregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Outcome of a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Veto(String),
}

impl Verdict {
    pub fn veto(reason: impl Into<String>) -> Self {
        Self::Veto(reason.into())
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Approve => None,
            Self::Veto(reason) => Some(reason),
        }
    }
}

pub type Voter<A> = Arc<dyn Fn(&A) -> Verdict + Send + Sync>;
pub type Observer<A> = Arc<dyn Fn(&A) + Send + Sync>;

// ── Observers ──────────────────────────────────────────────────

/// Ordered list of notification callbacks.
pub struct Observers<A> {
    name: &'static str,
    handlers: Mutex<Vec<(HandlerId, Observer<A>)>>,
}

impl<A: 'static> Observers<A> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, observer: F) -> HandlerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        self.lock().push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Invoke every observer in registration order.
    pub fn notify(&self, args: &A) {
        let snapshot: Vec<Observer<A>> = self.lock().iter().map(|(_, h)| h.clone()).collect();

        for observer in snapshot {
            if catch_unwind(AssertUnwindSafe(|| observer(args))).is_err() {
                error!(notificator = self.name, "Observer panicked; continuing");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(HandlerId, Observer<A>)>> {
        // Handlers never run under this lock, so a poisoned list is still consistent.
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── VetoNotificator ────────────────────────────────────────────

/// Voters that may veto a proposed change, plus observers of applied changes.
pub struct VetoNotificator<A> {
    name: &'static str,
    default_verdict: Verdict,
    voters: Mutex<Vec<(HandlerId, Voter<A>)>>,
    observers: Observers<A>,
}

impl<A: 'static> VetoNotificator<A> {
    /// Notificator approving every change nobody vetoes.
    pub fn new(name: &'static str) -> Self {
        Self::with_default(name, Verdict::Approve)
    }

    /// Notificator seeded with `default_verdict`, the outcome when no voter
    /// expresses an opinion (no voters registered).
    pub fn with_default(name: &'static str, default_verdict: Verdict) -> Self {
        Self {
            name,
            default_verdict,
            voters: Mutex::new(Vec::new()),
            observers: Observers::new(name),
        }
    }

    pub fn register_voter<F>(&self, voter: F) -> HandlerId
    where
        F: Fn(&A) -> Verdict + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        self.lock_voters().push((id, Arc::new(voter)));
        id
    }

    pub fn register_observer<F>(&self, observer: F) -> HandlerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    /// Remove a voter or observer.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let removed_voter = {
            let mut voters = self.lock_voters();
            let before = voters.len();
            voters.retain(|(voter_id, _)| *voter_id != id);
            voters.len() != before
        };
        removed_voter || self.observers.unsubscribe(id)
    }

    pub fn voter_count(&self) -> usize {
        self.lock_voters().len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Ask every voter, in registration order, whether the change may happen.
    ///
    /// Evaluation stops at the first veto. Any approving voter overrides a
    /// vetoing default.
    pub fn vote(&self, args: &A) -> Verdict {
        let snapshot: Vec<Voter<A>> = self.lock_voters().iter().map(|(_, v)| v.clone()).collect();

        let mut verdict = self.default_verdict.clone();
        for voter in snapshot {
            match catch_unwind(AssertUnwindSafe(|| voter(args))) {
                Ok(Verdict::Approve) => verdict = Verdict::Approve,
                Ok(veto @ Verdict::Veto(_)) => {
                    debug!(notificator = self.name, reason = ?veto.reason(), "Change vetoed");
                    return veto;
                }
                Err(_) => {
                    error!(notificator = self.name, "Voter panicked; treating as veto");
                    return Verdict::veto("voter failed");
                }
            }
        }
        verdict
    }

    /// Tell every observer that the change was applied.
    pub fn notify(&self, args: &A) {
        self.observers.notify(args);
    }

    fn lock_voters(&self) -> std::sync::MutexGuard<'_, Vec<(HandlerId, Voter<A>)>> {
        self.voters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn approves_without_voters() {
        let notificator: VetoNotificator<String> = VetoNotificator::new("test");
        assert!(notificator.vote(&"anything".to_string()).is_approved());
    }

    #[test]
    fn default_veto_applies_when_nobody_votes() {
        let notificator: VetoNotificator<u32> =
            VetoNotificator::with_default("test", Verdict::veto("closed"));
        assert_eq!(notificator.vote(&1), Verdict::veto("closed"));

        notificator.register_voter(|_| Verdict::Approve);
        assert!(notificator.vote(&1).is_approved());
    }

    #[test]
    fn first_veto_short_circuits() {
        let notificator: VetoNotificator<u32> = VetoNotificator::new("test");
        let later_calls = Arc::new(AtomicUsize::new(0));

        notificator.register_voter(|n| {
            if *n > 10 {
                Verdict::veto("too big")
            } else {
                Verdict::Approve
            }
        });
        let calls = later_calls.clone();
        notificator.register_voter(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Verdict::Approve
        });

        assert_eq!(notificator.vote(&42), Verdict::veto("too big"));
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);

        assert!(notificator.vote(&3).is_approved());
        assert_eq!(later_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_voter_is_an_implicit_veto() {
        let notificator: VetoNotificator<u32> = VetoNotificator::new("test");
        notificator.register_voter(|_| panic!("voter bug"));
        assert!(!notificator.vote(&1).is_approved());
    }

    #[test]
    fn observers_run_in_registration_order() {
        let notificator: VetoNotificator<u32> = VetoNotificator::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            notificator.register_observer(move |n| seen.lock().unwrap().push((tag, *n)));
        }
        notificator.notify(&7);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn panicking_observer_does_not_stop_the_others() {
        let observers: Observers<u32> = Observers::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        observers.subscribe(|_| panic!("observer bug"));
        let c = count.clone();
        observers.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        observers.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_removes_voters_and_observers() {
        let notificator: VetoNotificator<u32> = VetoNotificator::new("test");
        let voter = notificator.register_voter(|_| Verdict::veto("no"));
        let observer = notificator.register_observer(|_| {});

        assert!(notificator.unregister(voter));
        assert!(notificator.unregister(observer));
        assert!(!notificator.unregister(voter));
        assert_eq!(notificator.voter_count(), 0);
        assert_eq!(notificator.observer_count(), 0);
        assert!(notificator.vote(&1).is_approved());
    }

    #[test]
    fn handlers_may_register_while_firing() {
        let notificator = Arc::new(VetoNotificator::<u32>::new("test"));
        let inner = notificator.clone();
        notificator.register_observer(move |_| {
            inner.register_observer(|_| {});
        });

        notificator.notify(&1);
        assert_eq!(notificator.observer_count(), 2);
    }
}
