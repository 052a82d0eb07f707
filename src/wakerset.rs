use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing a collection of wakers that are all waiting
/// on a single pending cache entry.
///
/// Wakers can be added to a wakerset; when added, a token associated with the
/// Waker is returned. This token should be held by the waiting future and can
/// be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset when the future is dropped.
///
/// These tokens cannot be cloned or otherwise duplicated; this helps to
/// ensure that their lifespans are correctly associated with a particular
/// future.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,

    // Tokens are an ever-increasing integer. We assume that WakerSets are
    // relatively short-lived and that there's no chance of running out of
    // these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set. When the future is re-polled, replace_waker
    /// should be used with this token.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self
            .next_token
            .checked_add(1)
            .unwrap_or(NonZeroUsize::MIN);

        self.wakers.insert(token.duplicate(), waker);
        token
    }

    /// Set the waker for an existing token. The waker is passed by reference
    /// and is only cloned if it would wake a different task than the one
    /// already stored. A token that is no longer in the set is re-inserted.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        match self.wakers.get_mut(token) {
            Some(stored) if stored.will_wake(waker) => {}
            Some(stored) => stored.clone_from(waker),
            None => {
                self.wakers.insert(token.duplicate(), waker.clone());
            }
        }
    }

    /// Discard a waker from this set. Used when a waiting future completes
    /// or is dropped.
    pub(crate) fn discard_waker(&mut self, token: Token) {
        self.wakers.remove(&token);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }

    /// Copies of every waker, leaving the set intact so waiters can re-poll
    /// with their existing tokens. Used when a fetch cycle is abandoned and
    /// its keys need a new driver.
    pub(crate) fn snapshot(&self) -> Vec<Waker> {
        self.wakers.values().cloned().collect()
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
