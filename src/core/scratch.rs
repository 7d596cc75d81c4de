// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-worker scratch memory, split into a reduce zone and a thread zone.

use crate::error::Error;
use bytemuck::Pod;
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Alignment of scratch allocations, and granularity of their sizes.
pub const SCRATCH_ALIGN: usize = 64;

/// Sizes of the two zones of a worker's scratch memory, in bytes.
///
/// The reduce zone comes first and is shared with the other workers during
/// collectives. The thread zone follows it and is private to its owner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScratchLayout {
    /// Size of the reduce zone.
    pub reduce_size: usize,
    /// Size of the thread zone.
    pub thread_size: usize,
}

impl ScratchLayout {
    /// Creates a layout with sizes rounded up to a multiple of
    /// [`SCRATCH_ALIGN`].
    pub fn new(reduce_size: usize, thread_size: usize) -> Self {
        Self {
            reduce_size: round_up(reduce_size),
            thread_size: round_up(thread_size),
        }
    }

    /// Total size of the allocation.
    pub fn total_size(&self) -> usize {
        self.reduce_size + self.thread_size
    }

    /// Computes the layout to switch to when `request` is asked for, or
    /// [`None`] if the current allocation can stay.
    ///
    /// Each zone only grows, except that an all-zero request releases the
    /// whole allocation.
    pub(crate) fn grow_to(&self, request: ScratchLayout) -> Option<ScratchLayout> {
        if request.total_size() == 0 {
            return (self.total_size() != 0).then_some(request);
        }
        let grown = ScratchLayout {
            reduce_size: self.reduce_size.max(request.reduce_size),
            thread_size: self.thread_size.max(request.thread_size),
        };
        (grown != *self).then_some(grown)
    }
}

fn round_up(size: usize) -> usize {
    size.next_multiple_of(SCRATCH_ALIGN)
}

/// Marker type to obtain a well-aligned dangling pointer.
#[repr(align(64))]
struct Aligned;

/// One zeroed, contiguous and [`SCRATCH_ALIGN`]-aligned allocation.
///
/// The buffer only hands out raw zones: synchronizing accesses to them is the
/// responsibility of the collectives.
pub struct ScratchBuffer {
    ptr: NonNull<u8>,
    layout: ScratchLayout,
}

impl ScratchBuffer {
    /// Creates a buffer without any allocation.
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::<Aligned>::dangling().cast(),
            layout: ScratchLayout::default(),
        }
    }

    /// Allocates a zeroed buffer for the given layout.
    ///
    /// # Panics
    ///
    /// Panics if the total size overflows `isize`.
    pub fn allocate(layout: ScratchLayout) -> Self {
        let size = layout.total_size();
        if size == 0 {
            return Self::empty();
        }
        let alloc_layout = Layout::from_size_align(size, SCRATCH_ALIGN)
            .expect("scratch size overflows the address space");
        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(alloc_layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Self { ptr, layout },
            None => handle_alloc_error(alloc_layout),
        }
    }

    /// Sizes of the zones of this buffer.
    pub fn layout(&self) -> ScratchLayout {
        self.layout
    }

    /// Base address of the allocation.
    pub fn base_address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Returns the zone shared during collectives.
    pub fn reduce_zone(&self) -> Zone<'_> {
        Zone {
            ptr: self.ptr,
            len: self.layout.reduce_size,
            _phantom: PhantomData,
        }
    }

    /// Returns the zone private to the owning worker.
    pub fn thread_zone(&self) -> Zone<'_> {
        // SAFETY: The offset is within the allocation (or zero for an empty
        // buffer), so the resulting pointer is non-null.
        let ptr =
            unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(self.layout.reduce_size)) };
        Zone {
            ptr,
            len: self.layout.thread_size,
            _phantom: PhantomData,
        }
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        let size = self.layout.total_size();
        if size != 0 {
            // SAFETY: The pointer was obtained from `alloc_zeroed()` with this
            // exact layout, which was valid at that time.
            unsafe {
                dealloc(
                    self.ptr.as_ptr(),
                    Layout::from_size_align_unchecked(size, SCRATCH_ALIGN),
                )
            };
        }
    }
}

// SAFETY: A `ScratchBuffer` owns its allocation, like a `Box<[u8]>`.
unsafe impl Send for ScratchBuffer {}
// SAFETY: Shared references only expose raw zones, whose accesses are unsafe.
unsafe impl Sync for ScratchBuffer {}

/// A raw byte range within a [`ScratchBuffer`].
#[derive(Clone, Copy)]
pub struct Zone<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _phantom: PhantomData<&'a ScratchBuffer>,
}

impl<'a> Zone<'a> {
    /// Checks that this zone can hold `num_slots` consecutive slots of `count`
    /// values of type `T`, and returns a typed view of them.
    pub fn slots<T: Pod>(
        self,
        count: usize,
        num_slots: usize,
    ) -> Result<ValueSlots<'a, T>, Error> {
        if std::mem::align_of::<T>() > SCRATCH_ALIGN {
            return Err(Error::Misaligned {
                align: std::mem::align_of::<T>(),
                max: SCRATCH_ALIGN,
            });
        }
        let required = std::mem::size_of::<T>()
            .checked_mul(count)
            .and_then(|size| size.checked_mul(num_slots))
            .unwrap_or(usize::MAX);
        if required > self.len {
            return Err(Error::ScratchTooSmall {
                required,
                available: self.len,
            });
        }
        Ok(ValueSlots {
            zone: self,
            count,
            num_slots,
            _phantom: PhantomData,
        })
    }

    /// Returns the bytes of this zone.
    ///
    /// # Safety
    ///
    /// No other reference to these bytes may be live during the output
    /// lifetime.
    pub unsafe fn bytes_mut(&self) -> &'a mut [u8] {
        // SAFETY: The zone is within a live allocation, zero-initialized at
        // allocation time, and the caller guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// A length-checked view of consecutive slots of `count` values of type `T`
/// at the start of a [`Zone`].
///
/// Slot `i` starts at byte offset `i * count * size_of::<T>()`. The view
/// itself is freely copyable: the unsafe accessors state which accesses may
/// happen concurrently.
pub struct ValueSlots<'a, T> {
    zone: Zone<'a>,
    count: usize,
    num_slots: usize,
    _phantom: PhantomData<&'a [T]>,
}

impl<T> Clone for ValueSlots<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ValueSlots<'_, T> {}

impl<'a, T: Pod> ValueSlots<'a, T> {
    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        assert!(
            slot < self.num_slots,
            "slot {slot} is out of bounds for {} slots",
            self.num_slots
        );
        let offset = slot * self.count * std::mem::size_of::<T>();
        // SAFETY: The offset is within the zone, as checked by `Zone::slots()`.
        unsafe { self.zone.ptr.as_ptr().add(offset) }
    }

    /// Returns the values of the given slot.
    ///
    /// # Safety
    ///
    /// No thread may write to this slot during the output lifetime, and all
    /// previous writes to it must happen before this call.
    pub unsafe fn get(&self, slot: usize) -> &'a [T] {
        let len = self.count * std::mem::size_of::<T>();
        // SAFETY: The bytes are within the zone, initialized, and not mutated
        // during the output lifetime as guaranteed by the caller.
        let bytes = unsafe { std::slice::from_raw_parts(self.slot_ptr(slot), len) };
        bytemuck::cast_slice(bytes)
    }

    /// Returns the values of the given slot, for writing.
    ///
    /// # Safety
    ///
    /// No other thread may access this slot during the output lifetime, no
    /// other reference to it may be live, and all previous accesses to it must
    /// happen before this call.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, slot: usize) -> &'a mut [T] {
        let len = self.count * std::mem::size_of::<T>();
        // SAFETY: The bytes are within the zone, initialized, and exclusively
        // accessed during the output lifetime as guaranteed by the caller.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(slot), len) };
        bytemuck::cast_slice_mut(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout_rounding() {
        assert_eq!(ScratchLayout::new(0, 0), ScratchLayout::default());
        assert_eq!(
            ScratchLayout::new(1, 64),
            ScratchLayout {
                reduce_size: 64,
                thread_size: 64
            }
        );
        assert_eq!(ScratchLayout::new(65, 130).total_size(), 128 + 192);
    }

    #[test]
    fn test_layout_grow_to() {
        let current = ScratchLayout::new(128, 64);
        assert_eq!(current.grow_to(ScratchLayout::new(64, 64)), None);
        assert_eq!(current.grow_to(current), None);
        assert_eq!(
            current.grow_to(ScratchLayout::new(64, 256)),
            Some(ScratchLayout::new(128, 256))
        );
        assert_eq!(
            current.grow_to(ScratchLayout::new(0, 0)),
            Some(ScratchLayout::default())
        );
        assert_eq!(
            ScratchLayout::default().grow_to(ScratchLayout::default()),
            None
        );
    }

    #[test]
    fn test_buffer_zones() {
        let buffer = ScratchBuffer::allocate(ScratchLayout::new(100, 10));
        assert_eq!(buffer.base_address() % SCRATCH_ALIGN, 0);

        let reduce = unsafe { buffer.reduce_zone().bytes_mut() };
        assert_eq!(reduce.len(), 128);
        assert!(reduce.iter().all(|&b| b == 0));
        reduce.fill(0xAA);
        let thread = unsafe { buffer.thread_zone().bytes_mut() };
        assert_eq!(thread.len(), 64);
        assert!(thread.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = ScratchBuffer::empty();
        assert_eq!(buffer.layout(), ScratchLayout::default());
        assert_eq!(buffer.base_address() % SCRATCH_ALIGN, 0);
        let slots = buffer.reduce_zone().slots::<u64>(0, 2).unwrap();
        assert!(unsafe { slots.get(1) }.is_empty());
    }

    #[test]
    fn test_slots() {
        let buffer = ScratchBuffer::allocate(ScratchLayout::new(64, 0));
        let slots = buffer.reduce_zone().slots::<u64>(4, 2).unwrap();

        unsafe { slots.get_mut(0) }.copy_from_slice(&[1, 2, 3, 4]);
        unsafe { slots.get_mut(1) }.copy_from_slice(&[5, 6, 7, 8]);
        assert_eq!(unsafe { slots.get(0) }, [1, 2, 3, 4]);
        assert_eq!(unsafe { slots.get(1) }, [5, 6, 7, 8]);

        // The same bytes, seen as a single slot of another type.
        let words = buffer.reduce_zone().slots::<u32>(16, 1).unwrap();
        assert_eq!(
            unsafe { words.get(0) }[..4],
            *bytemuck::cast_slice::<u64, u32>(&[1, 2])
        );
    }

    #[test]
    fn test_slots_too_small() {
        let buffer = ScratchBuffer::allocate(ScratchLayout::new(64, 1000));
        match buffer.reduce_zone().slots::<u64>(5, 2) {
            Err(Error::ScratchTooSmall {
                required: 80,
                available: 64,
            }) => (),
            _ => panic!("expected a ScratchTooSmall error"),
        }
    }

    #[test]
    fn test_slots_misaligned() {
        #[derive(Clone, Copy)]
        #[repr(C, align(128))]
        struct OverAligned([u8; 128]);
        // SAFETY: The type is plain bytes without padding.
        unsafe impl bytemuck::Zeroable for OverAligned {}
        // SAFETY: The type is plain bytes without padding.
        unsafe impl bytemuck::Pod for OverAligned {}

        let buffer = ScratchBuffer::allocate(ScratchLayout::new(1024, 0));
        assert!(matches!(
            buffer.reduce_zone().slots::<OverAligned>(1, 1),
            Err(Error::Misaligned {
                align: 128,
                max: 64
            })
        ));
    }

    #[test]
    #[should_panic(expected = "slot 2 is out of bounds for 2 slots")]
    fn test_slot_out_of_bounds() {
        let buffer = ScratchBuffer::allocate(ScratchLayout::new(64, 0));
        let slots = buffer.reduce_zone().slots::<u8>(1, 2).unwrap();
        unsafe { slots.get(2) };
    }
}
