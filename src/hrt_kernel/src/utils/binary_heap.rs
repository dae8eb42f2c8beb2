//! Min-heap over a vector-like container, reporting element moves so that
//! elements can remember their own position
#[cfg(test)]
mod tests;

use alloc::vec::Vec;
#[cfg(test)]
use arrayvec::ArrayVec;
use core::ops;

/// Context type for [`BinaryHeap`]'s operations.
pub trait BinaryHeapCtx<Element> {
    /// Return `true` iff `x < y`.
    fn lt(&mut self, x: &Element, y: &Element) -> bool;

    /// Called when the element `e` lands at position `new_index`.
    fn on_move(&mut self, e: &mut Element, new_index: usize) {
        let _ = (e, new_index);
    }
}

impl<T: Ord> BinaryHeapCtx<T> for () {
    fn lt(&mut self, x: &T, y: &T) -> bool {
        *x < *y
    }
}

/// A growable, contiguous container.
pub trait VecLike: ops::Deref<Target = [<Self as VecLike>::Element]> + ops::DerefMut {
    type Element;
    fn pop(&mut self) -> Option<Self::Element>;
    /// Append `x`. Panics if the container is full.
    fn push(&mut self, x: Self::Element);
}

impl<T> VecLike for Vec<T> {
    type Element = T;
    fn pop(&mut self) -> Option<T> {
        Vec::pop(self)
    }
    fn push(&mut self, x: T) {
        Vec::push(self, x)
    }
}

/// Bounded storage for the heap tests.
#[cfg(test)]
impl<T, const N: usize> VecLike for ArrayVec<T, N> {
    type Element = T;
    fn pop(&mut self) -> Option<T> {
        ArrayVec::pop(self)
    }
    fn push(&mut self, x: T) {
        ArrayVec::push(self, x)
    }
}

/// Min-heap.
pub trait BinaryHeap: VecLike {
    /// Remove the least item from the heap and return it.
    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element>;

    /// Remove the item at position `i` and return it.
    fn heap_remove(
        &mut self,
        i: usize,
        ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element>;

    /// Push an item onto the heap and return its position.
    fn heap_push(&mut self, item: Self::Element, ctx: impl BinaryHeapCtx<Self::Element>) -> usize;
}

impl<T: VecLike> BinaryHeap for T {
    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element> {
        self.heap_remove(0, ctx)
    }

    fn heap_remove(
        &mut self,
        i: usize,
        mut ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element> {
        if i >= self.len() {
            return None;
        }

        let mut item = self.pop()?;
        let slice = &mut **self;
        if i < slice.len() {
            // The last item fills the vacancy at `i`
            core::mem::swap(&mut slice[i], &mut item);

            if i > 0 && ctx.lt(&slice[i], &slice[(i - 1) / 2]) {
                sift_up(slice, i, &mut ctx);
            } else {
                sift_down(slice, i, &mut ctx);
            }
        }
        Some(item)
    }

    fn heap_push(
        &mut self,
        item: Self::Element,
        mut ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> usize {
        self.push(item);
        let slice = &mut **self;
        let i = slice.len() - 1;
        sift_up(slice, i, &mut ctx)
    }
}

/// Move the element at `pos` towards the root while it's less than its
/// parent. Returns its final position.
fn sift_up<E>(this: &mut [E], mut pos: usize, ctx: &mut impl BinaryHeapCtx<E>) -> usize {
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if !ctx.lt(&this[pos], &this[parent]) {
            break;
        }
        this.swap(pos, parent);
        ctx.on_move(&mut this[pos], pos);
        pos = parent;
    }
    ctx.on_move(&mut this[pos], pos);
    pos
}

/// Move the element at `pos` towards the leaves while one of its children is
/// less than it.
fn sift_down<E>(this: &mut [E], mut pos: usize, ctx: &mut impl BinaryHeapCtx<E>) {
    let end = this.len();
    loop {
        let mut child = 2 * pos + 1;
        if child >= end {
            break;
        }
        let right = child + 1;
        if right < end && ctx.lt(&this[right], &this[child]) {
            child = right;
        }
        if !ctx.lt(&this[child], &this[pos]) {
            break;
        }
        this.swap(pos, child);
        ctx.on_move(&mut this[pos], pos);
        pos = child;
    }
    ctx.on_move(&mut this[pos], pos);
}
