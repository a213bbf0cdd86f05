use core::fmt;

use page_alloc::PhysAddr;

use crate::{PageTable, tree::PageTableEntries};

/// Human-readable listing of a page table, returned by [`PageTable::dump`].
///
/// ```text
/// page table 0x0000000087f6e000
/// ..0: pte 0x0000000021fda801 pa 0x0000000087f6a000
/// .. ..0: pte 0x0000000021fda401 pa 0x0000000087f69000
/// .. .. ..0: pte 0x0000000021fdac1f pa 0x0000000087f6b000
/// ```
pub struct Dump<'a> {
    table: &'a PageTable,
}

impl PageTable {
    /// Returns a value that prints every valid entry of this table, depth
    /// first.
    #[must_use]
    pub fn dump(&self) -> Dump<'_> {
        Dump { table: self }
    }
}

impl fmt::Display for Dump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = self.table.root_addr();
        writeln!(f, "page table {root:#018x}")?;
        dump_level(f, root, 1)
    }
}

fn dump_level(f: &mut fmt::Formatter<'_>, table: PhysAddr, depth: usize) -> fmt::Result {
    let pt = unsafe { PageTableEntries::from_frame(table) };
    for (i, pte) in pt.0.iter().enumerate() {
        if !pte.is_valid() {
            continue;
        }
        for j in 0..depth {
            if j > 0 {
                f.write_str(" ")?;
            }
            f.write_str("..")?;
        }
        let pa = pte.phys_addr();
        writeln!(f, "{i}: pte {:#018x} pa {pa:#018x}", pte.bits())?;
        if pte.is_non_leaf() && depth < 3 {
            dump_level(f, pa, depth + 1)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;

    use kernel_params::PAGE_SIZE;
    use page_alloc::{AllocatorConfig, testing::host_page_manager};

    use crate::{PtEntryFlags, VirtAddr};

    use super::*;

    #[test]
    fn test_empty_table() {
        let frames = host_page_manager(16, AllocatorConfig::default());
        let pt = PageTable::new(&frames).unwrap();
        assert_eq!(
            pt.dump().to_string(),
            format!("page table {:#018x}\n", pt.root_addr())
        );
    }

    #[test]
    fn test_dump_format() {
        let frames = host_page_manager(32, AllocatorConfig::default());
        let mut pt = PageTable::new(&frames).unwrap();
        let pages = [frames.alloc_page().unwrap(), frames.alloc_page().unwrap()];
        unsafe {
            pt.map_pages(&frames, VirtAddr::ZERO, PAGE_SIZE, pages[0], PtEntryFlags::URW)
                .unwrap();
            pt.map_pages(
                &frames,
                VirtAddr::new(2 * PAGE_SIZE).unwrap(),
                PAGE_SIZE,
                pages[1],
                PtEntryFlags::URX,
            )
            .unwrap();
        }

        let root = unsafe { PageTableEntries::from_frame(pt.root_addr()) };
        let l2 = root.0[0].bits();
        let l1 = unsafe { PageTableEntries::from_frame(root.0[0].phys_addr()) }.0[0].bits();
        let mut expected = format!("page table {:#018x}\n", pt.root_addr());
        for (prefix, index, bits) in [
            ("..", 0, l2),
            (".. ..", 0, l1),
            (".. .. ..", 0, pt.find(VirtAddr::ZERO).unwrap().bits()),
            (
                ".. .. ..",
                2,
                pt.find(VirtAddr::new(2 * PAGE_SIZE).unwrap()).unwrap().bits(),
            ),
        ] {
            writeln!(
                expected,
                "{prefix}{index}: pte {bits:#018x} pa {:#018x}",
                (bits >> 10) << 12
            )
            .unwrap();
        }
        assert_eq!(pt.dump().to_string(), expected);
        assert_eq!(pt.dump().to_string().lines().count(), 5);
    }
}
