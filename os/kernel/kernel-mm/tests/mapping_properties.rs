mod common;

use common::Machine;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mm::{MapFlags, Prot};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
struct Region {
    pages: u64,
    populate: bool,
    touches: Vec<u64>,
}

fn region() -> impl Strategy<Value = Region> {
    (1_u64..8, any::<bool>(), prop::collection::vec(0_u64..8, 0..6)).prop_map(
        |(pages, populate, touches)| Region {
            pages,
            populate,
            touches: touches.into_iter().map(|t| t % pages).collect(),
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn committed_pages_never_share_frames(regions in prop::collection::vec(region(), 1..6)) {
        let m = Machine::new();
        let pool_free = m.mm.kernel_pool().free_bytes();
        let flags = |r: &Region| if r.populate { MapFlags::POPULATE } else { MapFlags::empty() };

        let mapped: Vec<(VirtualAddress, &Region)> = regions
            .iter()
            .map(|r| {
                let va = m.mm
                    .mmap(0, r.pages * PAGE_SIZE, Prot::READ | Prot::WRITE, flags(r), -1, 0)
                    .unwrap();
                (va, r)
            })
            .collect();

        let tables_and_populated = m.free_frames();
        let mut touched = 0;
        for (va, r) in &mapped {
            let mut fresh = HashSet::new();
            for page in &r.touches {
                m.write(*va + page * PAGE_SIZE, 1).unwrap();
                if !r.populate && fresh.insert(*page) {
                    touched += 1;
                }
            }
        }
        prop_assert_eq!(tables_and_populated - m.free_frames(), touched);

        let mut frames = HashSet::new();
        for (va, r) in &mapped {
            for page in 0..r.pages {
                let va = *va + page * PAGE_SIZE;
                if m.mm.mpresent(va) {
                    prop_assert!(frames.insert(m.mm.mphysaddr(va).unwrap()));
                }
            }
        }

        for (va, r) in &mapped {
            m.mm.munmap(*va, r.pages * PAGE_SIZE).unwrap();
        }
        prop_assert_eq!(m.mm.kernel_pool().free_bytes(), pool_free);
        prop_assert!(m.mm.kernel_pool().validate().is_ok());
    }
}
