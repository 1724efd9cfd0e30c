//! Out-of-memory recovery: registry-wide reclaim and a single retry
//!
//! Each test uses its own budget slot, so its backend type (and therefore its
//! pools) is never shared with another test running in parallel.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use nebula_recycler::backend::{Backend, BackendError, HostBackend};
use nebula_recycler::{RecycleError, RecyclerConfig, Registry};

static BUDGETS: [AtomicUsize; 4] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

/// Host memory limited to a byte budget
#[derive(Debug, Default)]
struct Budgeted<const SLOT: usize>;

impl<const SLOT: usize> Budgeted<SLOT> {
    fn set_budget(bytes: usize) {
        BUDGETS[SLOT].store(bytes, Ordering::SeqCst);
    }

    fn remaining() -> usize {
        BUDGETS[SLOT].load(Ordering::SeqCst)
    }
}

unsafe impl<const SLOT: usize> Backend for Budgeted<SLOT> {
    const NAME: &'static str = "budgeted";

    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, BackendError> {
        BUDGETS[SLOT]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(layout.size())
            })
            .map_err(|_| BackendError::OutOfMemory)?;
        HostBackend.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { HostBackend.deallocate(ptr, layout) };
        BUDGETS[SLOT].fetch_add(layout.size(), Ordering::SeqCst);
    }
}

fn registry() -> Registry {
    Registry::with_config(RecyclerConfig::silent())
}

#[test]
fn reclaims_other_pools_and_retries() {
    type Backend0 = Budgeted<0>;
    Backend0::set_budget(1024);
    let registry = registry();

    let bytes = registry.get::<u8, Backend0>(512).unwrap();
    let words = registry.get::<u32, Backend0>(128).unwrap();
    assert_eq!(Backend0::remaining(), 0);

    // Idle memory now sits in the u8 pool only
    unsafe { registry.mark_unused::<u8, Backend0>(bytes, 512).unwrap() };

    let more = registry.get::<u32, Backend0>(64).unwrap();

    let words_stats = registry.stats::<u32, Backend0>().unwrap();
    assert_eq!(words_stats.oom_recoveries, 1);
    assert_eq!(words_stats.created, 2);

    let bytes_stats = registry.stats::<u8, Backend0>().unwrap();
    assert_eq!(bytes_stats.unused_buffers, 0);
    assert_eq!(Backend0::remaining(), 256);

    unsafe {
        registry.mark_unused::<u32, Backend0>(words, 128).unwrap();
        registry.mark_unused::<u32, Backend0>(more, 64).unwrap();
    }
}

#[test]
fn reclaims_own_idle_buffers_of_other_sizes() {
    type Backend1 = Budgeted<1>;
    Backend1::set_budget(1000);
    let registry = registry();

    let large = registry.get::<f32, Backend1>(200).unwrap();
    unsafe { registry.mark_unused::<f32, Backend1>(large, 200).unwrap() };

    // 400 bytes needed, 200 left: the idle 800-byte buffer has to go
    let small = registry.get::<f32, Backend1>(100).unwrap();

    let stats = registry.stats::<f32, Backend1>().unwrap();
    assert_eq!(stats.oom_recoveries, 1);
    assert_eq!(stats.unused_buffers, 0);
    assert_eq!(registry.reference_count::<f32, Backend1>(small), Some(1));

    unsafe { registry.mark_unused::<f32, Backend1>(small, 100).unwrap() };
}

#[test]
fn failure_propagates_when_nothing_is_idle() {
    type Backend2 = Budgeted<2>;
    Backend2::set_budget(256);
    let registry = registry();

    let held = registry.get::<u64, Backend2>(32).unwrap();

    let err = registry.get::<u64, Backend2>(1).unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(
        err,
        RecycleError::OutOfMemory {
            type_name: "u64",
            backend: "budgeted",
            elements: 1,
            bytes: 8,
        }
    );

    let stats = registry.stats::<u64, Backend2>().unwrap();
    assert_eq!(stats.oom_recoveries, 0);
    assert_eq!(stats.created, 1);
    assert_eq!(registry.reference_count::<u64, Backend2>(held), Some(1));

    // The pool keeps working once memory is back
    unsafe { registry.mark_unused::<u64, Backend2>(held, 32).unwrap() };
    assert_eq!(registry.get::<u64, Backend2>(32).unwrap(), held);
    unsafe { registry.mark_unused::<u64, Backend2>(held, 32).unwrap() };
}

#[test]
fn failure_propagates_when_reclaim_is_not_enough() {
    type Backend3 = Budgeted<3>;
    Backend3::set_budget(128);
    let registry = registry();

    let idle = registry.get::<u8, Backend3>(64).unwrap();
    unsafe { registry.mark_unused::<u8, Backend3>(idle, 64).unwrap() };

    let err = registry.get::<u8, Backend3>(256).unwrap_err();
    assert!(err.is_out_of_memory());

    // The reclaim still happened
    let stats = registry.stats::<u8, Backend3>().unwrap();
    assert_eq!(stats.unused_buffers, 0);
    assert_eq!(stats.oom_recoveries, 0);
    assert_eq!(Backend3::remaining(), 128);
}
