//! Singly linked list with iterative teardown.

use std::fmt;

struct Link<T> {
    value: T,
    next: Option<Box<Link<T>>>,
}

/// A singly linked list whose destructor never recurses.
///
/// Chains get long (one link per supplier) and are nested through the values they hold. A
/// derived `Drop` would recurse once per link, so the list detaches links one at a time
/// instead.
pub struct InterestChain<T> {
    head: Option<Box<Link<T>>>,
    len: usize,
}

impl<T> Default for InterestChain<T> {
    fn default() -> Self {
        Self { head: None, len: 0 }
    }
}

impl<T> InterestChain<T> {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a value.
    pub fn push_front(&mut self, value: T) {
        let next = self.head.take();
        self.head = Some(Box::new(Link { value, next }));
        self.len += 1;
    }

    /// Detach the first value.
    pub fn pop_front(&mut self) -> Option<T> {
        self.head.take().map(|mut link| {
            self.head = link.next.take();
            self.len -= 1;
            link.value
        })
    }

    /// Move every value of `other` to the front of this chain.
    pub fn splice(&mut self, mut other: InterestChain<T>) {
        while let Some(value) = other.pop_front() {
            self.push_front(value);
        }
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Iterate front to back.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head.as_deref(),
        }
    }
}

impl<T> Drop for InterestChain<T> {
    fn drop(&mut self) {
        let mut cursor = self.head.take();
        while let Some(mut link) = cursor {
            cursor = link.next.take();
        }
    }
}

impl<T> FromIterator<T> for InterestChain<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut chain = InterestChain::new();
        for value in iter {
            chain.push_front(value);
        }
        chain
    }
}

impl<T: fmt::Debug> fmt::Debug for InterestChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator returned by [`InterestChain::iter`].
pub struct Iter<'a, T> {
    next: Option<&'a Link<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        self.next.map(|link| {
            self.next = link.next.as_deref();
            &link.value
        })
    }
}
