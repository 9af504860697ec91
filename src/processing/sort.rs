use rayon::prelude::*;

use super::fragment::FragmentBuffer;
use super::tile::{DispatchCommand, TileBuffers, TileEntry};
use super::tiling::{BufferLayout, dispatch_element_index, sort_group_id};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortItem {
    pub key: f32,
    pub entry: u64,
}

impl SortItem {
    pub const PADDING: Self = Self {
        key: f32::INFINITY,
        entry: u64::MAX,
    };

    pub fn is_padding(&self) -> bool {
        self.entry == u64::MAX
    }
}

/// Sort key of a fragment. Later layers are pushed back by a constant plus
/// a depth-proportional bias; the fragment itself keeps its depth.
pub fn sort_key(depth: f32, layer: u32, offset: f32, scale: f32) -> f32 {
    depth + layer as f32 * (offset + scale * depth)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortGroupDescriptor {
    pub group_id: u32,
    pub group_size: u32,
    pub compare_distance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPass {
    /// Every stage with group size up to the shared size, per shared chunk.
    Presort,
    /// One compare distance across the whole list.
    Outer(SortGroupDescriptor),
    /// Distances below the shared size for one group size, per shared chunk.
    Inner(SortGroupDescriptor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledPass {
    pub slot: u32,
    pub pass: SortPass,
}

/// Passes for lists of up to `max_elements`, with their dispatch slots.
///
/// A list of `count` entries is padded to `next_pow2(count)` with +inf keys.
/// A local presort runs every stage that fits in `shared`; larger group sizes
/// alternate global passes, one per compare distance down to `shared`, with a
/// single local pass that finishes the remaining distances.
pub fn schedule(shared: u32, max_elements: u32) -> Vec<ScheduledPass> {
    let mut passes = vec![ScheduledPass {
        slot: 0,
        pass: SortPass::Presort,
    }];
    let mut k = shared as u64 * 2;
    while k <= max_elements as u64 {
        let group_id = sort_group_id(k, shared);
        let mut slot = dispatch_element_index(k, shared);
        let mut j = k / 2;
        while j >= shared as u64 {
            passes.push(ScheduledPass {
                slot,
                pass: SortPass::Outer(SortGroupDescriptor {
                    group_id,
                    group_size: k as u32,
                    compare_distance: j as u32,
                }),
            });
            slot += 1;
            j /= 2;
        }
        passes.push(ScheduledPass {
            slot,
            pass: SortPass::Inner(SortGroupDescriptor {
                group_id,
                group_size: k as u32,
                compare_distance: shared / 2,
            }),
        });
        k *= 2;
    }
    passes
}

fn compare_exchange(items: &mut [SortItem], i: usize, l: usize, ascending: bool) {
    if (items[i].key > items[l].key) == ascending && items[i].key != items[l].key {
        items.swap(i, l);
    }
}

/// Runs the compare stages `group_sizes` × distances inside one chunk whose
/// first element sits at global index `base`.
fn local_stages(chunk: &mut [SortItem], base: usize, group_size: usize, first_distance: usize) {
    let mut j = first_distance;
    while j >= 1 {
        for i in 0..chunk.len() {
            let l = i ^ j;
            if l > i {
                compare_exchange(chunk, i, l, (base + i) & group_size == 0);
            }
        }
        j /= 2;
    }
}

/// Work groups of a pass for a list padded to `n`.
fn pass_command(pass: SortPass, n: u32, shared: u32, sort_group_size: u32) -> DispatchCommand {
    match pass {
        SortPass::Presort if n >= 2 => DispatchCommand::covering(n / n.min(shared), 1),
        SortPass::Outer(d) if n >= d.group_size => DispatchCommand::covering(n / 2, sort_group_size),
        SortPass::Inner(d) if n >= d.group_size => DispatchCommand::covering(n / shared, 1),
        _ => DispatchCommand::EMPTY,
    }
}

/// Executes one pass on a padded list according to its command.
fn run_pass(
    items: &mut [SortItem],
    pass: SortPass,
    cmd: DispatchCommand,
    shared: usize,
    sort_group_size: usize,
) {
    let n = items.len();
    match pass {
        SortPass::Presort => {
            let chunk = n.min(shared);
            for group in 0..cmd.group_count() as usize {
                let base = group * chunk;
                let part = &mut items[base..base + chunk];
                let mut k = 2;
                while k <= chunk {
                    local_stages(part, base, k, k / 2);
                    k *= 2;
                }
            }
        }
        SortPass::Outer(d) => {
            let (k, j) = (d.group_size as usize, d.compare_distance as usize);
            for group in 0..cmd.group_count() as usize {
                for lane in 0..sort_group_size {
                    let t = group * sort_group_size + lane;
                    if t >= n / 2 {
                        break;
                    }
                    let i = (t / j) * 2 * j + t % j;
                    compare_exchange(items, i, i + j, i & k == 0);
                }
            }
        }
        SortPass::Inner(d) => {
            let k = d.group_size as usize;
            for group in 0..cmd.group_count() as usize {
                let base = group * shared;
                local_stages(&mut items[base..base + shared], base, k, d.compare_distance as usize);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortStats {
    pub tiles: usize,
    pub passes: u64,
}

/// Tiles shorter than a group size find an empty command for its passes.
pub struct SortBuffers {
    pub shared: u32,
    pub sort_group_size: u32,
    pub dispatch_per_entry: u32,
    pub schedule: Vec<ScheduledPass>,
    /// Padded list length per tile, 0 for empty tiles.
    pub lengths: Vec<u32>,
    pub commands: Vec<DispatchCommand>,
}

impl SortBuffers {
    pub fn new(layout: &BufferLayout, sort_group_size: u32) -> Self {
        let tiles = layout.tile_count();
        let schedule = schedule(layout.sort_shared_elements, layout.sort_elements);
        debug_assert!(schedule.iter().all(|p| p.slot < layout.dispatch_per_entry));
        Self {
            shared: layout.sort_shared_elements,
            sort_group_size,
            dispatch_per_entry: layout.dispatch_per_entry,
            schedule,
            lengths: vec![0; tiles],
            commands: vec![DispatchCommand::EMPTY; tiles * layout.dispatch_per_entry as usize],
        }
    }

    /// Writes each tile's padded length and per-pass commands.
    pub fn write_params(&mut self, tiles: &TileBuffers) {
        let (shared, group) = (self.shared, self.sort_group_size);
        let schedule = &self.schedule;
        self.lengths
            .par_iter_mut()
            .zip(self.commands.par_chunks_mut(self.dispatch_per_entry as usize))
            .enumerate()
            .for_each(|(tile, (length, commands))| {
                let count = tiles.count(tile);
                let n = if count == 0 { 0 } else { count.next_power_of_two() };
                *length = n;
                commands.iter_mut().for_each(|c| *c = DispatchCommand::EMPTY);
                for p in schedule {
                    commands[p.slot as usize] = pass_command(p.pass, n, shared, group);
                }
            });
    }

    /// Sorts one padded list through the scheduled passes of `tile`.
    pub fn sort_list(&self, tile: usize, items: &mut [SortItem]) -> u64 {
        let commands = &self.commands[tile * self.dispatch_per_entry as usize..];
        let mut passes = 0;
        for p in &self.schedule {
            let cmd = commands[p.slot as usize];
            if cmd.is_empty() {
                continue;
            }
            run_pass(items, p.pass, cmd, self.shared as usize, self.sort_group_size as usize);
            passes += 1;
        }
        passes
    }

    /// Sorts every tile list in place by key, front to back.
    pub fn sort_tiles(
        &self,
        tiles: &TileBuffers,
        fragments: &FragmentBuffer,
        depth_offset: f32,
        depth_scale: f32,
    ) -> SortStats {
        let (sorted, passes) = (0..tiles.tile_count())
            .into_par_iter()
            .map_init(Vec::new, |items, tile| {
                let n = self.lengths[tile] as usize;
                if n == 0 {
                    return (0, 0);
                }
                items.clear();
                items.extend(tiles.entries(tile).map(|entry| {
                    let f = &fragments.fragments[entry.fragment as usize];
                    SortItem {
                        key: sort_key(f.depth, f.layer, depth_offset, depth_scale),
                        entry: entry.pack(),
                    }
                }));
                items.resize(n, SortItem::PADDING);
                let passes = self.sort_list(tile, items);
                for (i, item) in items.iter().take_while(|it| !it.is_padding()).enumerate() {
                    tiles.store_entry(tile, i as u32, TileEntry::unpack(item.entry));
                }
                (1, passes)
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
        SortStats {
            tiles: sorted,
            passes,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.lengths.len() * 4 + self.commands.len() * std::mem::size_of::<DispatchCommand>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlurConfig;
    use crate::processing::fragment::Fragment;
    use crate::processing::tiling::{Resolution, dispatch_buffer_max_per_entry, max_sort_iterations};

    fn lcg(seed: &mut u64) -> f32 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (*seed >> 40) as f32 / (1u64 << 24) as f32
    }

    fn sorted_list(count: usize, shared: u32, max_elements: u32, seed: u64) -> Vec<SortItem> {
        let dispatch = dispatch_buffer_max_per_entry(max_sort_iterations(max_elements as u64, shared));
        let mut buffers = SortBuffers {
            shared,
            sort_group_size: 4,
            dispatch_per_entry: dispatch,
            schedule: schedule(shared, max_elements),
            lengths: vec![0],
            commands: vec![DispatchCommand::EMPTY; dispatch as usize],
        };
        let n = count.next_power_of_two() as u32;
        buffers.lengths[0] = n;
        for p in buffers.schedule.clone() {
            buffers.commands[p.slot as usize] = pass_command(p.pass, n, shared, 4);
        }
        let mut seed = seed;
        let mut items: Vec<SortItem> = (0..count)
            .map(|i| SortItem {
                key: lcg(&mut seed) * 100.0,
                entry: i as u64,
            })
            .collect();
        items.resize(n as usize, SortItem::PADDING);
        buffers.sort_list(0, &mut items);
        items
    }

    fn assert_sorted(items: &[SortItem], count: usize) {
        for pair in items[..count].windows(2) {
            assert!(pair[0].key <= pair[1].key, "{} > {}", pair[0].key, pair[1].key);
        }
        assert!(items[..count].iter().all(|it| !it.is_padding()));
        assert!(items[count..].iter().all(|it| it.is_padding()));
        let mut seen: Vec<u64> = items[..count].iter().map(|it| it.entry).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..count as u64).collect::<Vec<_>>());
    }

    #[test]
    fn schedule_fills_triangular_slots() {
        let passes = schedule(64, 512);
        let slots: Vec<u32> = passes.iter().map(|p| p.slot).collect();
        assert_eq!(slots, (0..10).collect::<Vec<_>>());
        assert_eq!(
            passes[1].pass,
            SortPass::Outer(SortGroupDescriptor {
                group_id: 1,
                group_size: 128,
                compare_distance: 64
            })
        );
        assert!(matches!(passes[2].pass, SortPass::Inner(d) if d.group_size == 128));
        assert!(matches!(passes[3].pass, SortPass::Outer(d) if d.compare_distance == 128));
    }

    #[test]
    fn short_lists_sort_in_the_presort() {
        for count in [1, 2, 3, 17, 31, 64] {
            let items = sorted_list(count, 64, 1024, count as u64);
            assert_sorted(&items, count);
        }
    }

    #[test]
    fn long_lists_sort_across_shared_chunks() {
        for (count, seed) in [(65, 1), (100, 2), (255, 3), (256, 4), (700, 5), (1000, 6)] {
            let items = sorted_list(count, 16, 1024, seed);
            assert_sorted(&items, count);
        }
    }

    #[test]
    fn shared_size_of_two_still_sorts() {
        let items = sorted_list(37, 2, 64, 9);
        assert_sorted(&items, 37);
    }

    #[test]
    fn later_layers_sort_behind_at_equal_depth() {
        assert!(sort_key(2.0, 1, 0.01, 0.0) > sort_key(2.0, 0, 0.01, 0.0));
        assert_eq!(sort_key(2.0, 0, 0.5, 0.5), 2.0);
        assert_eq!(sort_key(2.0, 2, 0.0, 0.25), 3.0);
    }

    #[test]
    fn params_leave_short_tiles_without_outer_passes() {
        let config = BlurConfig {
            tile_size: 8,
            max_coc: 8,
            max_sort_elements: 64,
            ..Default::default()
        };
        let layout = BufferLayout::new(&config, Resolution::new(16, 8), 1).unwrap();
        let tiles = TileBuffers::new(&layout);
        let mut buffers = SortBuffers::new(&layout, 32);
        buffers.write_params(&tiles);
        // empty tiles get no work at all
        assert!(buffers.lengths.iter().all(|&n| n == 0));
        assert!(buffers.commands.iter().all(|c| c.is_empty()));
        assert!(buffers.schedule.len() > 1);
    }

    #[test]
    fn tile_lists_come_back_front_to_back() {
        let config = BlurConfig {
            tile_size: 8,
            max_coc: 8,
            max_sort_elements: 16,
            ..Default::default()
        };
        let layout = BufferLayout::new(&config, Resolution::new(16, 16), 1).unwrap();
        let mut fragments = FragmentBuffer::new(&layout);
        let mut seed = 7;
        for (i, f) in fragments.fragments.iter_mut().enumerate() {
            *f = Fragment {
                color: [1.0; 3],
                alpha: 1.0,
                depth: 0.5 + lcg(&mut seed) * 10.0,
                blur_radius: (i % 5) as u32,
                size: 1,
                ..Default::default()
            };
        }
        let mut tiles = TileBuffers::new(&layout);
        tiles.build_centers(&fragments);
        tiles.write_splat_commands(32);
        let splat = tiles.splat(&fragments, 32);
        assert_eq!(splat.overflowed, 0);

        let mut buffers = SortBuffers::new(&layout, 32);
        buffers.write_params(&tiles);
        let stats = buffers.sort_tiles(&tiles, &fragments, 0.01, 0.0);
        assert_eq!(stats.tiles, 4);
        assert!(stats.passes > 4);
        for tile in 0..tiles.tile_count() {
            let depths: Vec<f32> = tiles
                .entries(tile)
                .map(|e| fragments.fragments[e.fragment as usize].depth)
                .collect();
            assert!(depths.windows(2).all(|w| w[0] <= w[1]), "tile {tile}");
        }
    }
}
