/// Connection state management
///
/// A small automaton shared by endpoints, connections and sessions. Each
/// `apply` is a compare-and-set: it either performs a legal transition and
/// reports it, or changes nothing. Concurrent closers therefore collapse into a
/// single winner.

use parking_lot::RwLock;
use std::fmt::Debug;

use crate::event::{ConnectionState, Transition};

/// States with a transition function
pub trait StateMachine: Copy + Eq + Debug + Send + Sync + 'static {
    /// Target state when asked to move to `to`, or None if the move is illegal
    fn next(self, to: Self) -> Option<Self>;
}

impl StateMachine for ConnectionState {
    fn next(self, to: Self) -> Option<Self> {
        // OPENING may move anywhere forward, the rest only toward CLOSED
        if to > self {
            Some(to)
        } else {
            None
        }
    }
}

/// Thread-safe state holder
#[derive(Debug)]
pub struct Automaton<S> {
    state: RwLock<S>,
}

impl<S: StateMachine> Automaton<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }

    pub fn state(&self) -> S {
        *self.state.read()
    }

    /// Try to move to `to`
    ///
    /// Returns the transition that happened, or None if it was illegal or a no-op
    pub fn apply(&self, to: S) -> Option<Transition<S>> {
        let mut state = self.state.write();
        let from = *state;
        match from.next(to) {
            Some(next) if next != from => {
                *state = next;
                Some(Transition::new(from, next))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_connection_transitions() {
        use ConnectionState::*;

        assert_eq!(Opening.next(Opened), Some(Opened));
        assert_eq!(Opening.next(Closed), Some(Closed));
        assert_eq!(Opening.next(Opening), None);
        assert_eq!(Opened.next(Closing), Some(Closing));
        assert_eq!(Opened.next(Opening), None);
        assert_eq!(Closing.next(Closed), Some(Closed));
        assert_eq!(Closing.next(Opened), None);
        assert_eq!(Closed.next(Closed), None);
    }

    #[test]
    fn test_apply_is_monotonic() {
        let automaton = Automaton::new(ConnectionState::Opening);
        assert_eq!(
            automaton.apply(ConnectionState::Opened),
            Some(Transition::new(ConnectionState::Opening, ConnectionState::Opened))
        );
        assert_eq!(automaton.apply(ConnectionState::Opening), None);
        assert!(automaton.apply(ConnectionState::Closing).is_some());
        assert_eq!(automaton.apply(ConnectionState::Opened), None);
        assert_eq!(automaton.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_concurrent_apply_has_one_winner() {
        let automaton = Arc::new(Automaton::new(ConnectionState::Opened));
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let automaton = automaton.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if automaton.apply(ConnectionState::Closing).is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
