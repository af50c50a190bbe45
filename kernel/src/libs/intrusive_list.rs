use core::marker::PhantomData;
use core::ptr::NonNull;

/// A node that carries its own list links.
///
/// Nodes live in memory owned by someone else (free blocks, slab headers), so
/// the list only ever sees raw pointers to them.
pub trait ListNode: Sized {
    fn next(&self) -> Option<NonNull<Self>>;
    fn prev(&self) -> Option<NonNull<Self>>;
    fn set_next(&mut self, next: Option<NonNull<Self>>);
    fn set_prev(&mut self, prev: Option<NonNull<Self>>);
}

/// Doubly linked, address-ordered intrusive list.
///
/// # Invariants
/// - nodes are kept in ascending address order
/// - `head.prev` is `None`
/// - an empty list has `head == None` and `count == 0`
#[repr(C)]
#[derive(Debug)]
pub struct IntrusiveList<T: ListNode> {
    head: Option<NonNull<T>>,
    count: usize,
}

unsafe impl<T: ListNode> Send for IntrusiveList<T> {}

impl<T: ListNode> Default for IntrusiveList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ListNode> IntrusiveList<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Lowest-addressed node.
    #[inline]
    pub fn head(&self) -> Option<NonNull<T>> {
        self.head
    }

    /// Link `node` in at its address-ordered position.
    ///
    /// # Safety
    /// `node` must be valid for reads and writes and must not be linked into
    /// any list. Every node already in the list must still be valid.
    pub unsafe fn insert_ordered(&mut self, mut node: NonNull<T>) {
        let mut prev: Option<NonNull<T>> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current.as_ptr() > node.as_ptr() {
                break;
            }
            debug_assert!(current != node, "node linked twice");
            prev = Some(current);
            cursor = current.as_ref().next();
        }

        node.as_mut().set_prev(prev);
        node.as_mut().set_next(cursor);
        if let Some(mut next) = cursor {
            next.as_mut().set_prev(Some(node));
        }
        match prev {
            Some(mut prev) => prev.as_mut().set_next(Some(node)),
            None => self.head = Some(node),
        }
        self.count += 1;
    }

    /// Unlink `node`.
    ///
    /// # Safety
    /// `node` must currently be linked into this list.
    pub unsafe fn remove(&mut self, mut node: NonNull<T>) {
        let prev = node.as_ref().prev();
        let next = node.as_ref().next();

        match prev {
            Some(mut prev_node) => prev_node.as_mut().set_next(next),
            None => {
                debug_assert!(self.head == Some(node), "node is not in this list");
                self.head = next;
            }
        }
        if let Some(mut next_node) = next {
            next_node.as_mut().set_prev(prev);
        }

        node.as_mut().set_next(None);
        node.as_mut().set_prev(None);
        self.count -= 1;
    }

    /// Unlink and return the lowest-addressed node.
    ///
    /// # Safety
    /// Every node in the list must still be valid.
    pub unsafe fn pop_front(&mut self) -> Option<NonNull<T>> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    /// Walk the nodes in address order.
    ///
    /// # Safety
    /// Every node in the list must stay valid, and the list must not be
    /// modified, while the iterator is alive.
    pub unsafe fn iter(&self) -> Iter<'_, T> {
        Iter {
            cursor: self.head,
            _list: PhantomData,
        }
    }

    /// Whether `node` is linked into this list.
    ///
    /// # Safety
    /// Same contract as [`IntrusiveList::iter`].
    pub unsafe fn contains(&self, node: NonNull<T>) -> bool {
        for current in self.iter() {
            if current == node {
                return true;
            }
            if current.as_ptr() > node.as_ptr() {
                return false;
            }
        }
        false
    }
}

pub struct Iter<'a, T: ListNode> {
    cursor: Option<NonNull<T>>,
    _list: PhantomData<&'a IntrusiveList<T>>,
}

impl<T: ListNode> Iterator for Iter<'_, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        self.cursor = unsafe { current.as_ref().next() };
        Some(current)
    }
}
