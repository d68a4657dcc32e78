//! Layout management.
//!
//! This module places a module's sections in memory. Small sections are packed
//! into shared blocks, one chain of blocks per protection class, while large or
//! over-aligned sections get a mapping of their own. Every region comes from the
//! [`Placement`] policy, which keeps a module's regions contiguous and, when
//! the architecture needs it, within reach of the load anchor.

use std::collections::HashMap;
use std::io;

use crate::config::LinkerConfig;
use crate::decode::{SectionContents, SectionDescriptor, SectionKind};
use crate::error::{FatalError, LinkError, Result};
use crate::memory::{MemoryAccess, MemoryProvider, Region};
use crate::proddable::ProddableBlocks;
use crate::utils::{align_up, distance};

/// How a section's memory was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionAlloc {
    /// Not loaded.
    None,
    /// Packed into a shared block.
    Suballocated,
    /// Given a mapping of its own.
    Mapped,
    /// Heap memory; protection is recorded but not enforced.
    Heap,
}

/// Final protection class of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentProt {
    /// Reserved but holding nothing in use, such as a trampoline pool no
    /// relocation needed.
    NoAccess,
    ReadOnly,
    ReadExecute,
    ReadWrite,
}

impl SegmentProt {
    pub fn for_section(desc: &SectionDescriptor) -> Self {
        match desc.kind {
            _ if desc.executable => SegmentProt::ReadExecute,
            SectionKind::RwData => SegmentProt::ReadWrite,
            _ => SegmentProt::ReadOnly,
        }
    }

    pub fn access(self) -> MemoryAccess {
        match self {
            SegmentProt::NoAccess => MemoryAccess::NoAccess,
            SegmentProt::ReadOnly => MemoryAccess::ReadOnly,
            SegmentProt::ReadExecute => MemoryAccess::ReadExecute,
            SegmentProt::ReadWrite => MemoryAccess::ReadWrite,
        }
    }
}

/// A section of a loaded module.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    pub alloc: SectionAlloc,
    /// Runtime address; zero when not loaded.
    pub start: u64,
    pub size: u64,
    /// Index of the segment holding this section.
    pub segment: Option<usize>,
    /// Offset inside the module's TLS block, for thread-local sections.
    pub tls_offset: Option<u64>,
}

impl Section {
    pub fn is_loaded(&self) -> bool {
        self.segment.is_some()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.is_loaded() && (self.start..self.start + self.size).contains(&address)
    }
}

/// A page-aligned region sharing one final protection.
#[derive(Debug)]
pub struct Segment {
    /// Name of the segment (e.g., "rx.0", ".islands").
    pub name: String,
    pub prot: SegmentProt,
    /// Sections placed in this segment.
    pub sections: Vec<usize>,
    /// Bytes handed out so far, from the start of the region.
    pub used: u64,
    pub(crate) region: Region,
}

impl Segment {
    pub fn base(&self) -> u64 {
        self.region.base()
    }

    pub fn size(&self) -> u64 {
        self.region.len() as u64
    }

    pub fn access(&self) -> MemoryAccess {
        self.region.access()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.region.contains(address)
    }

    pub fn region(&self) -> &Region {
        &self.region
    }
}

/// Where new regions may go.
///
/// Every reservation is hinted at the end of the previous one. With a reach,
/// the policy also tries the anchor and then addresses widening outward from
/// it, and rejects any region that strays too far.
#[derive(Debug)]
pub struct Placement {
    anchor: u64,
    reach: Option<u64>,
    cursor: Option<u64>,
}

/// Number of steps tried on each side of the anchor.
const PLACEMENT_STEPS: u64 = 32;

static HOST_ANCHOR: u8 = 0;

impl Placement {
    /// `anchor` defaults to an address inside the host image.
    pub fn new(anchor: Option<u64>, reach: Option<u64>) -> Self {
        Self {
            anchor: anchor.unwrap_or(&HOST_ANCHOR as *const u8 as u64),
            reach,
            cursor: None,
        }
    }

    pub fn anchor(&self) -> u64 {
        self.anchor
    }

    pub fn reach(&self) -> Option<u64> {
        self.reach
    }

    /// Whether a region at `[base, base + len)` is acceptable.
    pub fn accepts(&self, base: u64, len: u64) -> bool {
        match self.reach {
            None => true,
            Some(reach) => distance(base, self.anchor) <= reach && distance(base + len, self.anchor) <= reach,
        }
    }

    fn candidates(&self, size: u64, page: u64, reach: u64) -> Vec<u64> {
        let mut hints = Vec::new();
        if let Some(cursor) = self.cursor {
            if self.accepts(cursor, size) {
                hints.push(cursor);
            }
        }
        let start = align_up(self.anchor, page);
        hints.push(start);
        let step = align_up((reach / PLACEMENT_STEPS).max(size), page);
        for k in 1..=PLACEMENT_STEPS {
            let offset = step * k;
            if let Some(up) = start.checked_add(offset) {
                if self.accepts(up, size) {
                    hints.push(up);
                }
            }
            if let Some(down) = start.checked_sub(offset) {
                if self.accepts(down, size) {
                    hints.push(down);
                }
            }
        }
        hints
    }

    /// Reserves `size` bytes. `Ok(None)` means nothing within reach could be had.
    pub fn reserve(&mut self, provider: &mut dyn MemoryProvider, size: usize, page: u64) -> io::Result<Option<Region>> {
        let Some(reach) = self.reach else {
            let region = provider.reserve(size, self.cursor)?;
            self.cursor = Some(region.end());
            return Ok(Some(region));
        };

        for hint in self.candidates(size as u64, page, reach) {
            match provider.reserve(size, Some(hint)) {
                Ok(region) if self.accepts(region.base(), region.len() as u64) => {
                    tracing::debug!(hint = format_args!("{hint:#x}"), base = format_args!("{:#x}", region.base()), "placed region");
                    self.cursor = Some(region.end());
                    return Ok(Some(region));
                }
                Ok(region) => {
                    tracing::trace!(base = format_args!("{:#x}", region.base()), "region out of reach");
                    provider.release(region);
                }
                Err(err) => tracing::trace!(hint = format_args!("{hint:#x}"), "reservation failed: {err}"),
            }
        }
        Ok(None)
    }
}

/// Places one module's sections.
///
/// Owns the segments until [`finish`](Self::finish) hands them over, or
/// [`abandon`](Self::abandon) gives them back to the provider.
pub struct MemoryLayoutManager<'a> {
    module: String,
    provider: &'a mut dyn MemoryProvider,
    placement: &'a mut Placement,
    page_size: u64,
    small_limit: u64,
    block_size: u64,
    sections: Vec<Section>,
    segments: Vec<Segment>,
    /// Open sub-allocation block per protection class.
    blocks: HashMap<SegmentProt, usize>,
    proddables: ProddableBlocks,
    tls_size: u64,
}

/// Everything a finished layout produced.
pub struct Layout {
    pub sections: Vec<Section>,
    pub segments: Vec<Segment>,
    pub proddables: ProddableBlocks,
    /// Size of the module's TLS block; zero if it has none.
    pub tls_size: u64,
}

impl<'a> MemoryLayoutManager<'a> {
    pub fn new(
        module: impl Into<String>,
        provider: &'a mut dyn MemoryProvider,
        placement: &'a mut Placement,
        config: &LinkerConfig,
    ) -> Self {
        Self {
            module: module.into(),
            provider,
            placement,
            page_size: config.page_size,
            small_limit: config.small_section_limit,
            block_size: config.page_size * config.block_pages.max(1),
            sections: Vec::new(),
            segments: Vec::new(),
            blocks: HashMap::new(),
            proddables: ProddableBlocks::default(),
            tls_size: 0,
        }
    }

    /// Reserves a fresh segment of at least `size_hint` bytes.
    pub fn allocate_segment(&mut self, name: &str, size_hint: u64, prot: SegmentProt) -> Result<usize> {
        let size = align_up(size_hint.max(1), self.page_size);
        let region = self
            .placement
            .reserve(self.provider, size as usize, self.page_size)
            .map_err(|source| LinkError::Memory {
                module: self.module.clone(),
                source,
            })?
            .ok_or(FatalError::Placement {
                size,
                anchor: self.placement.anchor(),
                reach: self.placement.reach().unwrap_or(u64::MAX),
            })?;
        tracing::debug!(
            module = %self.module,
            segment = name,
            base = format_args!("{:#x}", region.base()),
            size = format_args!("{size:#x}"),
            ?prot,
            "allocated segment"
        );
        self.segments.push(Segment {
            name: name.to_string(),
            prot,
            sections: Vec::new(),
            used: 0,
            region,
        });
        Ok(self.segments.len() - 1)
    }

    /// Places a section and copies its contents in. Returns its index.
    pub fn add_section(&mut self, desc: &SectionDescriptor) -> Result<usize> {
        let index = self.sections.len();
        if !desc.kind.is_loadable() || desc.size == 0 {
            self.sections.push(Section {
                name: desc.name.clone(),
                kind: desc.kind,
                alloc: SectionAlloc::None,
                start: 0,
                size: desc.size,
                segment: None,
                tls_offset: None,
            });
            return Ok(index);
        }

        let small = desc.size <= self.small_limit && desc.align.max(1) <= self.page_size;
        self.place_section(desc, small)
    }

    /// Places the zero-filled block for common symbols in a segment of its
    /// own, reserved right after everything placed so far.
    pub fn add_bss_extension(&mut self, name: &str, size: u64) -> Result<usize> {
        let desc = SectionDescriptor {
            name: name.to_string(),
            kind: SectionKind::RwData,
            size,
            align: 16,
            contents: SectionContents::ZeroFill,
            executable: false,
            tls: false,
        };
        self.place_section(&desc, false)
    }

    fn place_section(&mut self, desc: &SectionDescriptor, small: bool) -> Result<usize> {
        let index = self.sections.len();
        let prot = SegmentProt::for_section(desc);
        let align = desc.align.max(1);
        let (segment, start) = if small {
            self.suballocate(prot, desc.size, align)?
        } else {
            let padded = desc.size + if align > self.page_size { align } else { 0 };
            let segment = self.allocate_segment(&desc.name, padded, prot)?;
            let start = align_up(self.segments[segment].base(), align);
            self.segments[segment].used = start - self.segments[segment].base() + desc.size;
            (segment, start)
        };
        let alloc = match (self.provider.can_map(), small) {
            (false, _) => SectionAlloc::Heap,
            (true, true) => SectionAlloc::Suballocated,
            (true, false) => SectionAlloc::Mapped,
        };

        if let SectionContents::Bytes(bytes) = &desc.contents {
            let seg = &mut self.segments[segment];
            let at = (start - seg.base()) as usize;
            let len = bytes.len().min(desc.size as usize);
            let dest = seg.region.bytes_mut().ok_or_else(|| LinkError::Memory {
                module: self.module.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "fresh segment is not writable"),
            })?;
            dest[at..at + len].copy_from_slice(&bytes[..len]);
        }
        self.segments[segment].sections.push(index);
        self.proddables.add(start, desc.size);

        let tls_offset = desc.tls.then(|| {
            let offset = align_up(self.tls_size, align);
            self.tls_size = offset + desc.size;
            offset
        });

        tracing::trace!(
            module = %self.module,
            section = %desc.name,
            start = format_args!("{start:#x}"),
            size = desc.size,
            ?alloc,
            "placed section"
        );
        self.sections.push(Section {
            name: desc.name.clone(),
            kind: desc.kind,
            alloc,
            start,
            size: desc.size,
            segment: Some(segment),
            tls_offset,
        });
        Ok(index)
    }

    fn suballocate(&mut self, prot: SegmentProt, size: u64, align: u64) -> Result<(usize, u64)> {
        if let Some(&segment) = self.blocks.get(&prot) {
            let seg = &mut self.segments[segment];
            let start = align_up(seg.base() + seg.used, align);
            if start + size <= seg.region.end() {
                seg.used = start + size - seg.base();
                return Ok((segment, start));
            }
        }
        let name = match prot {
            SegmentProt::NoAccess => "none",
            SegmentProt::ReadOnly => "r",
            SegmentProt::ReadExecute => "rx",
            SegmentProt::ReadWrite => "rw",
        };
        let name = format!("{name}.{}", self.segments.len());
        let segment = self.allocate_segment(&name, self.block_size.max(size), prot)?;
        self.blocks.insert(prot, segment);
        let seg = &mut self.segments[segment];
        seg.used = size;
        Ok((segment, seg.base()))
    }

    /// Registers an extra writable range, such as the trampoline pool.
    pub fn add_proddable(&mut self, start: u64, size: u64) {
        self.proddables.add(start, size);
    }

    pub fn segment_mut(&mut self, index: usize) -> &mut Segment {
        &mut self.segments[index]
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn finish(self) -> Layout {
        Layout {
            sections: self.sections,
            segments: self.segments,
            proddables: self.proddables,
            tls_size: self.tls_size,
        }
    }

    /// Gives every reserved region back.
    pub fn abandon(self) {
        tracing::debug!(module = %self.module, segments = self.segments.len(), "abandoning layout");
        release_segments(self.provider, self.segments);
    }
}

/// Switches every segment to its final protection.
///
/// Must run only after every relocation into the segments has been applied.
pub fn finalize_protections(provider: &mut dyn MemoryProvider, segments: &mut [Segment]) -> io::Result<()> {
    for segment in segments.iter_mut() {
        let access = segment.prot.access();
        if segment.region.access() != access {
            provider.protect(&mut segment.region, access)?;
            tracing::debug!(segment = %segment.name, ?access, "protection finalized");
        }
    }
    Ok(())
}

pub fn release_segments(provider: &mut dyn MemoryProvider, segments: Vec<Segment>) {
    for segment in segments {
        provider.release(segment.region);
    }
}
