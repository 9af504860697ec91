use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rayon::prelude::*;

use super::fragment::FragmentBuffer;
use super::tiling::{BufferLayout, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileEntry {
    /// Slot in the fragment buffer.
    pub fragment: u32,
    /// Source tile minus destination tile.
    pub source_offset: [i16; 2],
}

impl TileEntry {
    pub fn pack(self) -> u64 {
        self.fragment as u64
            | (self.source_offset[0] as u16 as u64) << 32
            | (self.source_offset[1] as u16 as u64) << 48
    }

    pub fn unpack(bits: u64) -> Self {
        Self {
            fragment: bits as u32,
            source_offset: [(bits >> 32) as u16 as i16, (bits >> 48) as u16 as i16],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Work groups of one indirect dispatch.
pub struct DispatchCommand {
    pub group_x: u32,
    pub group_y: u32,
    pub group_z: u32,
}

impl DispatchCommand {
    pub const EMPTY: Self = Self {
        group_x: 0,
        group_y: 0,
        group_z: 0,
    };

    /// Enough groups of `group_size` invocations for `invocations` items.
    pub fn covering(invocations: u32, group_size: u32) -> Self {
        if invocations == 0 {
            return Self::EMPTY;
        }
        Self {
            group_x: invocations.div_ceil(group_size.max(1)),
            group_y: 1,
            group_z: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.group_x == 0 || self.group_y == 0 || self.group_z == 0
    }

    pub fn group_count(&self) -> u32 {
        self.group_x * self.group_y * self.group_z
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplatStats {
    pub entries: u64,
    pub overflowed: u64,
    pub max_tile_count: u32,
}

/// Per-tile lists in one arena with a fixed stride per tile. A full tile
/// drops the entry and bumps the overflow counter.
pub struct TileBuffers {
    pub num_tiles: Resolution,
    pub tile_size: u32,
    pub center_capacity: u32,
    pub capacity: u32,
    pub center_counts: Vec<u32>,
    /// Fragment slots each tile owns, `center_capacity` per tile.
    pub centers: Vec<u32>,
    pub splat_commands: Vec<DispatchCommand>,
    counts: Vec<AtomicU32>,
    entries: Vec<AtomicU64>,
    overflow: AtomicU64,
}

impl TileBuffers {
    pub fn new(layout: &BufferLayout) -> Self {
        let tiles = layout.tile_count();
        Self {
            num_tiles: layout.num_tiles,
            tile_size: layout.tile_size,
            center_capacity: layout.tile_center_per_entry,
            capacity: layout.tile_per_entry,
            center_counts: vec![0; tiles],
            centers: vec![0; tiles * layout.tile_center_per_entry as usize],
            splat_commands: vec![DispatchCommand::EMPTY; tiles],
            counts: (0..tiles).map(|_| AtomicU32::new(0)).collect(),
            entries: (0..tiles * layout.tile_per_entry as usize)
                .map(|_| AtomicU64::new(0))
                .collect(),
            overflow: AtomicU64::new(0),
        }
    }

    pub fn tile_count(&self) -> usize {
        self.counts.len()
    }

    pub fn tile_of_pixel(&self, x: u32, y: u32) -> usize {
        ((y / self.tile_size) * self.num_tiles.width + x / self.tile_size) as usize
    }

    /// Valid entries of a tile; entries beyond the capacity were dropped.
    pub fn count(&self, tile: usize) -> u32 {
        self.counts[tile].load(Ordering::Relaxed).min(self.capacity)
    }

    pub fn entry(&self, tile: usize, i: u32) -> TileEntry {
        let slot = tile * self.capacity as usize + i as usize;
        TileEntry::unpack(self.entries[slot].load(Ordering::Relaxed))
    }

    /// Overwrites slot `i` of a tile; used to write lists back in sorted order.
    pub fn store_entry(&self, tile: usize, i: u32, entry: TileEntry) {
        let slot = tile * self.capacity as usize + i as usize;
        self.entries[slot].store(entry.pack(), Ordering::Relaxed);
    }

    /// Entries of a tile in list order.
    pub fn entries(&self, tile: usize) -> impl Iterator<Item = TileEntry> + '_ {
        (0..self.count(tile)).map(move |i| self.entry(tile, i))
    }

    pub fn overflowed(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn clear(&mut self) {
        self.center_counts.iter_mut().for_each(|c| *c = 0);
        self.counts.iter_mut().for_each(|c| *c.get_mut() = 0);
        *self.overflow.get_mut() = 0;
    }

    /// Collects the valid fragments each tile owns.
    pub fn build_centers(&mut self, fragments: &FragmentBuffer) {
        let t = self.tile_size;
        let tiles_x = self.num_tiles.width;
        let layers = fragments.layers;
        self.centers
            .par_chunks_mut(self.center_capacity as usize)
            .zip(self.center_counts.par_iter_mut())
            .enumerate()
            .for_each(|(tile, (list, count))| {
                let (tx, ty) = (tile as u32 % tiles_x, tile as u32 / tiles_x);
                let mut n = 0;
                for y in ty * t..(ty + 1) * t {
                    for x in tx * t..(tx + 1) * t {
                        for layer in 0..layers {
                            let index = fragments.index(x, y, layer);
                            if fragments.fragments[index].is_valid() {
                                list[n] = index as u32;
                                n += 1;
                            }
                        }
                    }
                }
                *count = n as u32;
            });
    }

    /// One splat dispatch per tile sized by its center count.
    pub fn write_splat_commands(&mut self, group_size: u32) {
        self.splat_commands
            .par_iter_mut()
            .zip(self.center_counts.par_iter())
            .for_each(|(cmd, &count)| *cmd = DispatchCommand::covering(count, group_size));
    }

    /// Appends every center fragment to each tile its kernel footprint
    /// touches, running the groups recorded in the splat commands.
    pub fn splat(&self, fragments: &FragmentBuffer, group_size: u32) -> SplatStats {
        let t = self.tile_size as i32;
        let (tiles_x, tiles_y) = (self.num_tiles.width as i32, self.num_tiles.height as i32);
        let capacity = self.capacity as usize;
        let entries: u64 = (0..self.tile_count())
            .into_par_iter()
            .map(|tile| {
                let cmd = self.splat_commands[tile];
                if cmd.is_empty() {
                    return 0;
                }
                let count = self.center_counts[tile];
                let list = &self.centers[tile * self.center_capacity as usize..];
                let (sx, sy) = (tile as i32 % tiles_x, tile as i32 / tiles_x);
                let mut written = 0u64;
                for group in 0..cmd.group_count() {
                    for lane in 0..group_size {
                        let i = group * group_size + lane;
                        if i >= count {
                            break;
                        }
                        let index = list[i as usize] as usize;
                        let (xs, ys) = fragments.footprint(index);
                        let x_range = (xs.start().div_euclid(t)).max(0)..=(xs.end().div_euclid(t)).min(tiles_x - 1);
                        let y_range = (ys.start().div_euclid(t)).max(0)..=(ys.end().div_euclid(t)).min(tiles_y - 1);
                        for dy in y_range {
                            for dx in x_range.clone() {
                                let dest = (dy * tiles_x + dx) as usize;
                                let slot = self.counts[dest].fetch_add(1, Ordering::Relaxed) as usize;
                                if slot >= capacity {
                                    self.overflow.fetch_add(1, Ordering::Relaxed);
                                    continue;
                                }
                                let entry = TileEntry {
                                    fragment: index as u32,
                                    source_offset: [(sx - dx) as i16, (sy - dy) as i16],
                                };
                                self.entries[dest * capacity + slot].store(entry.pack(), Ordering::Relaxed);
                                written += 1;
                            }
                        }
                    }
                }
                written
            })
            .sum();

        let max_tile_count = (0..self.tile_count()).map(|t| self.count(t)).max().unwrap_or(0);
        SplatStats {
            entries,
            overflowed: self.overflowed(),
            max_tile_count,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.centers.len() * 4
            + self.center_counts.len() * 4
            + self.splat_commands.len() * std::mem::size_of::<DispatchCommand>()
            + self.counts.len() * 4
            + self.entries.len() * 8
    }
}
