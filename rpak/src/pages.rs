//! Slab, page, and lump management for the paged region of a pak.
//!
//! A lump is one piece of content with its own alignment. Lumps with equal
//! flags are packed into shared pages as long as the page, padded out to its
//! final alignment, stays at or below [`PAK_MAX_PAGE_MERGE_SIZE`]. Pages with
//! equal flags accumulate into one slab. Alignment padding is tracked as
//! dataless lumps and only materializes when the page data is written.
//!
//! During building, a page's size is not necessarily a multiple of its own
//! alignment: a page aligned to 64 can hold a run of 8-aligned lumps padded
//! only to 8-byte boundaries. [`PageBuilder::pad_slabs_and_pages`] settles the
//! remainders once all lumps are placed, which saves a significant amount of
//! file size when many small lumps merge into shared pages.

use crate::format::{
    PagePtr, PakPageHdr, PakSlabHdr, PAK_MAX_PAGE_MERGE_SIZE, PAK_MAX_SLAB_COUNT,
};
use crate::util::align_up;
use anyhow::bail;
use binio::BinaryIo;
use pow2::Pow2;
use std::io::SeekFrom;
use sync_file::WriteAt;
use zerocopy::byteorder::{U32, U64};

fn align_up32(value: u32, align: u32) -> u32 {
    align_up(u64::from(value), u64::from(align)) as u32
}

/// Stable handle to a lump created by [`PageBuilder::create_page_lump`].
///
/// The handle stays valid for the lifetime of the builder; the lump's bytes
/// are reached through [`PageBuilder::lump_data_mut`] until
/// [`PageBuilder::write_page_data`] consumes them.
#[derive(Copy, Clone, Debug)]
pub struct PageLump {
    page: usize,
    slot: usize,
    ptr: PagePtr,
    size: u32,
}

impl PageLump {
    /// The relocatable pointer to the start of this lump.
    pub fn ptr(&self) -> PagePtr {
        self.ptr
    }

    /// The relocatable pointer to `offset` bytes into this lump.
    pub fn ptr_at(&self, offset: usize) -> PagePtr {
        self.ptr.shifted(offset as u32)
    }

    /// The lump's unpadded size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }
}

/// A piece of page data. `data == None` marks alignment padding, which is
/// never backed by memory; it materializes as zero bytes at write time.
struct Lump {
    data: Option<Box<[u8]>>,
    size: u32,
    #[allow(dead_code)]
    alignment: u32,
}

struct Page {
    flags: u32,
    slab_index: u32,
    alignment: u32,
    data_size: u32,
    lumps: Vec<Lump>,
}

struct Slab {
    flags: u32,
    alignment: u32,
    data_size: u64,
}

/// Packs lumps into aligned pages and pages into slabs, and writes the three
/// resulting sections of the pak.
#[derive(Default)]
pub struct PageBuilder {
    slabs: Vec<Slab>,
    pages: Vec<Page>,
}

impl PageBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slabs created so far.
    pub fn slab_count(&self) -> u16 {
        self.slabs.len() as u16
    }

    /// Number of pages created so far.
    pub fn page_count(&self) -> u16 {
        self.pages.len() as u16
    }

    /// Finds the slab with the given flags, or creates one. The matched
    /// slab's alignment is raised to `align` if it was lower, and `size` is
    /// accumulated into it.
    fn find_or_create_slab(&mut self, flags: u32, align: u32, size: u32) -> anyhow::Result<usize> {
        for (index, slab) in self.slabs.iter_mut().enumerate() {
            if slab.flags != flags {
                continue;
            }

            // Raising the alignment keeps previously placed data aligned,
            // since all alignments are powers of two.
            if slab.alignment < align {
                slab.alignment = align;
            }

            slab.data_size += u64::from(size);
            return Ok(index);
        }

        if self.slabs.len() >= PAK_MAX_SLAB_COUNT {
            bail!(
                "Cannot create more than {PAK_MAX_SLAB_COUNT} slabs; \
                 too many distinct lump flag combinations requested."
            );
        }

        self.slabs.push(Slab {
            flags,
            alignment: align,
            data_size: u64::from(size),
        });
        Ok(self.slabs.len() - 1)
    }

    /// Finds a page with the given flags and room for `aligned_size` more
    /// bytes, preferring the page whose alignment is closest to `align`, or
    /// creates a new page. The returned page has `aligned_size` accumulated
    /// into it (and into its slab) already.
    fn find_or_create_page(
        &mut self,
        flags: u32,
        align: u32,
        aligned_size: u32,
    ) -> anyhow::Result<usize> {
        let slab_index = self.find_or_create_slab(flags, align, aligned_size)?;

        let mut best: Option<usize> = None;
        let mut best_align_diff = u32::MAX;

        for (index, page) in self.pages.iter().enumerate() {
            if page.flags != flags {
                continue;
            }

            // The page size is not yet aligned to the page's own alignment
            // while lumps are still being placed, so the ceiling check must
            // cover the padding that materializes later: the current size
            // padded to the merged alignment, the new data, and the final
            // page padding all have to stay within the merge ceiling.
            let merge_align = page.alignment.max(align);
            let padded =
                align_up32(align_up32(page.data_size, merge_align) + aligned_size, merge_align);
            if padded > PAK_MAX_PAGE_MERGE_SIZE {
                continue;
            }

            if page.alignment == align {
                best = Some(index);
                break;
            }

            let diff = page.alignment.abs_diff(align);
            if diff < best_align_diff {
                best_align_diff = diff;
                best = Some(index);
            }
        }

        if let Some(index) = best {
            let page = &mut self.pages[index];
            if page.alignment < align {
                page.alignment = align;
            }
            page.data_size += aligned_size;
            return Ok(index);
        }

        if self.pages.len() >= u16::MAX as usize {
            bail!("Cannot create more than {} pages.", u16::MAX);
        }

        self.pages.push(Page {
            flags,
            slab_index: slab_index as u32,
            alignment: align,
            data_size: aligned_size,
            lumps: Vec::new(),
        });
        Ok(self.pages.len() - 1)
    }

    /// Allocates a lump of `size` bytes with the given flags and alignment.
    ///
    /// When `data` is provided it is adopted as the lump's buffer and must be
    /// exactly `size` bytes; otherwise a zeroed buffer is allocated. The
    /// buffer does not include alignment padding; padding is tracked as
    /// separate dataless lumps.
    pub fn create_page_lump(
        &mut self,
        size: usize,
        flags: u32,
        alignment: u32,
        data: Option<Box<[u8]>>,
    ) -> anyhow::Result<PageLump> {
        if alignment == 0 || alignment >= 255 || Pow2::try_from(alignment).is_err() {
            bail!("Page lump alignment must be a power of two below 255, got {alignment}.");
        }

        let Ok(size) = u32::try_from(size) else {
            bail!("Page lump size {size} does not fit a page.");
        };

        let aligned_size = align_up32(size, alignment);
        if aligned_size > PAK_MAX_PAGE_MERGE_SIZE {
            bail!(
                "Page lump of {size} bytes aligned to {alignment} exceeds the \
                 page size limit of {PAK_MAX_PAGE_MERGE_SIZE} bytes."
            );
        }

        let page_index = self.find_or_create_page(flags, alignment, aligned_size)?;

        // Pad the page out if the previous lump left it unaligned for this
        // one. The pad amount is unchanged by the size accumulated above,
        // because aligned_size is a multiple of the requested alignment.
        let (pad, slab_index, page_alignment) = {
            let page = &self.pages[page_index];
            (
                align_up32(page.data_size, alignment) - page.data_size,
                page.slab_index as usize,
                page.alignment,
            )
        };
        if pad > 0 {
            let page = &mut self.pages[page_index];
            page.lumps.push(Lump {
                data: None,
                size: pad,
                alignment: page_alignment,
            });
            page.data_size += pad;
            self.slabs[slab_index].data_size += u64::from(pad);
        }

        let buffer = match data {
            Some(buffer) => {
                assert_eq!(buffer.len(), size as usize, "adopted buffer length mismatch");
                buffer
            }
            None => vec![0u8; size as usize].into_boxed_slice(),
        };

        let page = &mut self.pages[page_index];
        let offset = page.data_size - aligned_size;
        let ptr = PagePtr::new(page_index as i32, offset as i32);

        page.lumps.push(Lump {
            data: Some(buffer),
            size,
            alignment,
        });
        let slot = page.lumps.len() - 1;

        // The remainder of the aligned slot. Already accounted in the page
        // and slab sizes, so only the lump is recorded.
        let trailing = aligned_size - size;
        if trailing > 0 {
            let page_alignment = page.alignment;
            page.lumps.push(Lump {
                data: None,
                size: trailing,
                alignment: page_alignment,
            });
        }

        Ok(PageLump {
            page: page_index,
            slot,
            ptr,
            size,
        })
    }

    /// Gets mutable access to a lump's bytes.
    ///
    /// # Panics
    /// Panics if the lump's buffer was already consumed by
    /// [`PageBuilder::write_page_data`].
    pub fn lump_data_mut(&mut self, lump: &PageLump) -> &mut [u8] {
        self.pages[lump.page].lumps[lump.slot]
            .data
            .as_deref_mut()
            .expect("lump data has already been written and released")
    }

    /// Pads every page up to its own alignment, then every slab up to its
    /// own alignment. Page padding is tracked as a lump; slab padding is
    /// accounting only and never materializes as bytes.
    ///
    /// Slab alignment can exceed the alignment of some of its pages (another
    /// page may have raised it), so the slab remainder is settled separately
    /// after its pages are padded.
    pub fn pad_slabs_and_pages(&mut self) {
        for index in 0..self.pages.len() {
            let (pad, slab_index, page_alignment) = {
                let page = &self.pages[index];
                (
                    align_up32(page.data_size, page.alignment) - page.data_size,
                    page.slab_index as usize,
                    page.alignment,
                )
            };
            if pad > 0 {
                let page = &mut self.pages[index];
                page.lumps.push(Lump {
                    data: None,
                    size: pad,
                    alignment: page_alignment,
                });
                page.data_size += pad;
                self.slabs[slab_index].data_size += u64::from(pad);
            }
        }

        for slab in &mut self.slabs {
            slab.data_size = align_up(slab.data_size, u64::from(slab.alignment));
        }
    }

    /// Writes the slab headers in creation order.
    pub fn write_slab_headers<F: WriteAt>(&self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        for slab in &self.slabs {
            io.write(&PakSlabHdr {
                flags: U32::new(slab.flags),
                alignment: U32::new(slab.alignment),
                data_size: U64::new(slab.data_size),
            })?;
        }
        Ok(())
    }

    /// Writes the page headers in creation order.
    pub fn write_page_headers<F: WriteAt>(&self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        for page in &self.pages {
            io.write(&PakPageHdr {
                slab_index: U32::new(page.slab_index),
                alignment: U32::new(page.alignment),
                data_size: U32::new(page.data_size),
            })?;
        }
        Ok(())
    }

    /// Writes the paged data: pages in index order, each lump's bytes in
    /// placement order. Padding lumps advance the put cursor without writing;
    /// the skipped ranges read back as zero. Lump buffers are released as
    /// they are written.
    pub fn write_page_data<F: WriteAt>(&mut self, io: &mut BinaryIo<F>) -> std::io::Result<()> {
        for page in &mut self.pages {
            for lump in &mut page.lumps {
                match lump.data.take() {
                    Some(bytes) => io.write_bytes(&bytes)?,
                    None => {
                        io.seek_put(SeekFrom::Current(i64::from(lump.size)))?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{SF_CPU, SF_HEAD};
    use crate::tests::MemFile;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn lump_offsets_respect_alignment() {
        let mut builder = PageBuilder::new();
        let a = builder.create_page_lump(10, SF_HEAD, 8, None).unwrap();
        let b = builder.create_page_lump(5, SF_HEAD, 8, None).unwrap();
        let c = builder.create_page_lump(3, SF_HEAD, 64, None).unwrap();

        assert_eq!(a.ptr().index, 0);
        assert_eq!(a.ptr().offset, 0);
        // 10 bytes pad to 16 within the 8-aligned slot.
        assert_eq!(b.ptr().offset, 16);
        // 5 bytes pad to 24; then the 64-alignment pads up to 64.
        assert_eq!(c.ptr().offset, 64);

        for lump in [a, b, c] {
            assert_eq!(lump.ptr().offset % 8, 0);
        }
        assert_eq!(builder.page_count(), 1);
        assert_eq!(builder.pages[0].alignment, 64);
    }

    #[test]
    fn distinct_flags_get_distinct_pages_and_slabs() {
        let mut builder = PageBuilder::new();
        let head = builder.create_page_lump(16, SF_HEAD, 8, None).unwrap();
        let cpu = builder.create_page_lump(16, SF_CPU, 8, None).unwrap();
        assert_ne!(head.ptr().index, cpu.ptr().index);
        assert_eq!(builder.page_count(), 2);
        assert_eq!(builder.slab_count(), 2);
    }

    #[test]
    fn page_merge_ceiling_starts_a_fresh_page() {
        let mut builder = PageBuilder::new();
        for _ in 0..3 {
            builder.create_page_lump(20_000, SF_CPU, 8, None).unwrap();
        }
        assert_eq!(builder.page_count(), 1, "3 * 20_000 fits one page");

        let fourth = builder.create_page_lump(20_000, SF_CPU, 8, None).unwrap();
        assert_eq!(builder.page_count(), 2, "the fourth lump must open a new page");
        assert_eq!(fourth.ptr().index, 1);
        assert_eq!(fourth.ptr().offset, 0);
    }

    #[test]
    fn oversized_lump_is_rejected() {
        let mut builder = PageBuilder::new();
        assert!(builder.create_page_lump(0x10000, SF_CPU, 8, None).is_err());
        assert!(builder.create_page_lump(0xffff, SF_CPU, 1, None).is_ok());
    }

    #[test]
    fn invalid_alignment_is_rejected() {
        let mut builder = PageBuilder::new();
        assert!(builder.create_page_lump(16, SF_HEAD, 0, None).is_err());
        assert!(builder.create_page_lump(16, SF_HEAD, 3, None).is_err());
        assert!(builder.create_page_lump(16, SF_HEAD, 255, None).is_err());
        assert!(builder.create_page_lump(16, SF_HEAD, 256, None).is_err());
        assert!(builder.create_page_lump(16, SF_HEAD, 128, None).is_ok());
    }

    #[test]
    fn slab_limit_is_enforced() {
        let mut builder = PageBuilder::new();
        for flags in 0..PAK_MAX_SLAB_COUNT as u32 {
            builder.create_page_lump(8, flags, 8, None).unwrap();
        }
        let err = builder
            .create_page_lump(8, PAK_MAX_SLAB_COUNT as u32, 8, None)
            .unwrap_err();
        assert!(err.to_string().contains("slabs"));
    }

    #[test]
    fn random_packing_preserves_invariants() {
        let mut rng = StdRng::seed_from_u64(0x7a9e);
        let mut builder = PageBuilder::new();

        for _ in 0..500 {
            let size = rng.gen_range(1..=3000);
            let alignment = 1u32 << rng.gen_range(0..=7);
            let flags = rng.gen_range(0..3u32);
            let lump = builder.create_page_lump(size, flags, alignment, None).unwrap();
            assert_eq!(
                lump.ptr().offset as u32 % alignment,
                0,
                "lump offset must honor its alignment"
            );
        }

        builder.pad_slabs_and_pages();

        for page in &builder.pages {
            let lump_total: u32 = page.lumps.iter().map(|l| l.size).sum();
            assert_eq!(lump_total, page.data_size, "lump sizes must add up to the page size");
            assert!(page.data_size <= PAK_MAX_PAGE_MERGE_SIZE, "padded page exceeds the ceiling");
            assert_eq!(page.data_size % page.alignment, 0);

            let max_lump_align = page.lumps.iter().map(|l| l.alignment).max().unwrap();
            assert_eq!(page.alignment, max_lump_align);

            let slab = &builder.slabs[page.slab_index as usize];
            assert!(slab.alignment >= page.alignment);
            assert_eq!(slab.flags, page.flags);
        }

        for slab in &builder.slabs {
            assert_eq!(slab.data_size % u64::from(slab.alignment), 0);
            let page_total: u64 = builder
                .pages
                .iter()
                .filter(|p| builder.slabs[p.slab_index as usize].flags == slab.flags)
                .map(|p| u64::from(p.data_size))
                .sum();
            assert!(slab.data_size >= page_total);
        }
    }

    #[test]
    fn written_page_data_lands_at_recorded_offsets() {
        let mut builder = PageBuilder::new();
        let a = builder.create_page_lump(6, SF_CPU, 4, None).unwrap();
        let b = builder.create_page_lump(8, SF_CPU, 8, None).unwrap();
        builder.lump_data_mut(&a).copy_from_slice(b"AAAAAA");
        builder.lump_data_mut(&b).copy_from_slice(b"BBBBBBBB");
        builder.pad_slabs_and_pages();

        let mut io = BinaryIo::with_file(MemFile::default(), 0);
        builder.write_page_data(&mut io).unwrap();

        // Single page, so page base is 0 in the output stream.
        let mut check = vec![0u8; 6];
        io.seek_get(SeekFrom::Start(a.ptr().offset as u64)).unwrap();
        io.read_into(&mut check).unwrap();
        assert_eq!(&check, b"AAAAAA");

        let mut check = vec![0u8; 8];
        io.seek_get(SeekFrom::Start(b.ptr().offset as u64)).unwrap();
        io.read_into(&mut check).unwrap();
        assert_eq!(&check, b"BBBBBBBB");

        // The gap between the lumps is padding and reads back as zero.
        io.seek_get(SeekFrom::Start(6)).unwrap();
        let gap: u8 = io.read().unwrap();
        assert_eq!(gap, 0);
    }

    #[test]
    fn released_lump_data_cannot_be_touched() {
        let mut builder = PageBuilder::new();
        let lump = builder.create_page_lump(4, SF_CPU, 4, None).unwrap();
        let mut io = BinaryIo::with_file(MemFile::default(), 0);
        builder.write_page_data(&mut io).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = builder.lump_data_mut(&lump);
        }));
        assert!(result.is_err());
    }
}
