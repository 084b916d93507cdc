// Copyright 2026 The TrieDB Authors.
// This file is part of triedb.

// triedb is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// triedb is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with triedb.  If not, see <http://www.gnu.org/licenses/>.

//! Maps raw devices to uniformly sized chunks (§4.1).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::config::{PoolConfig, PoolMode};
use crate::error::{PoolError, PoolResult};
use crate::metadata::{recover, ChunkList, MetadataMirror, RecoveryAction};
use crate::{CONVENTIONAL_CHUNKS_PER_DEVICE, DEVICE_MAGIC, DISK_PAGE};

/// Conventional chunks are random-access and hold only superblocks/metadata;
/// sequential chunks are append-only and hold nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Conventional,
    Sequential,
}

/// One backing device (block device or plain file), opened and footer-verified.
pub struct Device {
    pub index: u16,
    pub path: PathBuf,
    pub file: Mutex<File>,
    pub size: u64,
    pub chunk_capacity: u64,
    pub sequential_chunk_count: u32,
}

impl Device {
    fn footer_offset(size: u64) -> u64 {
        size - Footer::ENCODED_LEN as u64
    }

    /// Verifies or writes the tail footer depending on `mode`.
    fn open_or_create(path: PathBuf, index: u16, mode: PoolMode, chunk_capacity: u64, config_hash: u32) -> PoolResult<Device> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        if size < Footer::ENCODED_LEN as u64 + chunk_capacity * CONVENTIONAL_CHUNKS_PER_DEVICE as u64 {
            return Err(PoolError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "device too small for chunk capacity",
            )));
        }

        match mode {
            PoolMode::Truncate => {
                Self::discard_whole_device(&mut file, size)?;
                let footer = Footer {
                    magic: DEVICE_MAGIC,
                    chunk_capacity,
                    config_hash,
                };
                file.seek(SeekFrom::Start(Self::footer_offset(size)))?;
                footer.write_to(&mut file)?;
                file.flush()?;
            }
            PoolMode::OpenExisting => {
                file.seek(SeekFrom::Start(Self::footer_offset(size)))?;
                let footer = Footer::read_from(&mut file)?;
                if footer.magic != DEVICE_MAGIC {
                    return Err(PoolError::BadMagic(path.display().to_string()));
                }
                if footer.chunk_capacity != chunk_capacity {
                    return Err(PoolError::ChunkCapacityNotPowerOfTwo(footer.chunk_capacity));
                }
                if footer.config_hash != config_hash {
                    return Err(PoolError::ConfigHashMismatch(footer.config_hash, config_hash));
                }
            }
        }

        let total_chunks = (size / chunk_capacity) as u32;
        let sequential_chunk_count = total_chunks.saturating_sub(CONVENTIONAL_CHUNKS_PER_DEVICE as u32);

        Ok(Device {
            index,
            path,
            file: Mutex::new(file),
            size,
            chunk_capacity,
            sequential_chunk_count,
        })
    }

    /// Wipes prior contents: hole-punch for files, discard for block
    /// devices. We cannot reliably tell the two apart from a `File` alone in
    /// a portable way, so conventional truncate-then-extend is used here;
    /// real block-device discard is issued by `try_trim_contents` at chunk
    /// granularity during normal operation.
    fn discard_whole_device(file: &mut File, size: u64) -> io::Result<()> {
        file.set_len(0)?;
        file.set_len(size)?;
        Ok(())
    }

    fn chunk_byte_offset(&self, chunk_index: u32) -> u64 {
        chunk_index as u64 * self.chunk_capacity
    }
}

struct Footer {
    magic: [u8; 4],
    chunk_capacity: u64,
    config_hash: u32,
}

impl Footer {
    const ENCODED_LEN: usize = 4 + 8 + 4;

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.magic)?;
        w.write_u64::<LittleEndian>(self.chunk_capacity)?;
        w.write_u32::<LittleEndian>(self.config_hash)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Footer> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        let chunk_capacity = r.read_u64::<LittleEndian>()?;
        let config_hash = r.read_u32::<LittleEndian>()?;
        Ok(Footer {
            magic,
            chunk_capacity,
            config_hash,
        })
    }
}

/// fnv1a over device identities, sizes, and chunk capacity, used as the
/// cross-device consistency check recorded in each device's footer.
pub fn config_hash(device_paths: &[PathBuf], sizes: &[u64], chunk_capacity: u64) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            hash ^= *b as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    for p in device_paths {
        feed(p.to_string_lossy().as_bytes());
    }
    for s in sizes {
        feed(&s.to_le_bytes());
    }
    feed(&chunk_capacity.to_le_bytes());
    hash
}

/// A handle to an activated chunk: read/write file descriptors (which may
/// alias for random-access conventional chunks), the chunk's byte offset
/// within its device, and its capacity.
pub struct ChunkActivation {
    pub device_index: u16,
    pub chunk_id: u32,
    pub kind: ChunkKind,
    pub byte_offset_in_device: u64,
    pub capacity: u64,
}

/// Carves one or more backing devices into fixed-size chunks and tracks
/// free/fast/slow membership through a [`MetadataMirror`] pair.
pub struct StoragePool {
    pub config: PoolConfig,
    pub devices: Vec<Arc<Device>>,
    pub front: MetadataMirror,
    pub back: MetadataMirror,
    /// Maps a global sequential chunk index to (device_index, chunk index
    /// within that device), built once at open time by the interleaving
    /// algorithm in §4.1.
    chunk_placement: Vec<(u16, u32)>,
    activations: Mutex<HashMap<u32, Arc<ChunkActivation>>>,
}

impl StoragePool {
    pub fn open(config: PoolConfig) -> PoolResult<StoragePool> {
        config.validate()?;
        if config.device_paths.is_empty() {
            return Err(PoolError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no device paths configured",
            )));
        }

        let sizes: Vec<u64> = config
            .device_paths
            .iter()
            .map(|p| std::fs::metadata(p).map(|m| m.len()))
            .collect::<io::Result<_>>()?;
        let hash = if config.disable_mismatching_storage_pool_check {
            0
        } else {
            config_hash(&config.device_paths, &sizes, config.chunk_capacity)
        };

        let mut devices = Vec::with_capacity(config.device_paths.len());
        for (i, path) in config.device_paths.iter().enumerate() {
            let device = Device::open_or_create(
                path.clone(),
                i as u16,
                config.mode,
                config.chunk_capacity,
                hash,
            )?;
            devices.push(Arc::new(device));
        }

        let chunk_placement = if config.interleave_chunks_evenly {
            interleave_chunks(&devices)
        } else {
            sequential_chunks(&devices)
        };

        let num_chunks = chunk_placement.len();
        let front = MetadataMirror::new(num_chunks);
        let back = MetadataMirror::new(num_chunks);
        for (i, (dev_idx, chunk_idx)) in chunk_placement.iter().enumerate() {
            front.chunks[i].bytes_used.store(0, std::sync::atomic::Ordering::Relaxed);
            let _ = (dev_idx, chunk_idx, i);
        }
        if matches!(config.mode, PoolMode::Truncate) {
            front.seed_free_list();
            back.seed_free_list();
        }

        let pool = StoragePool {
            config,
            devices,
            front,
            back,
            chunk_placement,
            activations: Mutex::new(HashMap::new()),
        };

        match pool.config.mode {
            PoolMode::Truncate => {
                // Both mirrors start out identical and clean; persist them
                // (metadata and dirty bit alike) so an immediate re-open in
                // `OpenExisting` mode has something on disk to recover from.
                pool.persist_metadata().map_err(PoolError::Io)?;
                pool.persist_dirty_bit(0, false).map_err(PoolError::Io)?;
                pool.persist_dirty_bit(1, false).map_err(PoolError::Io)?;
            }
            PoolMode::OpenExisting => {
                pool.load_metadata_mirror(0, &pool.front).map_err(PoolError::Io)?;
                pool.load_metadata_mirror(1, &pool.back).map_err(PoolError::Io)?;
                if pool.load_dirty_bit(0).map_err(PoolError::Io)? {
                    pool.front.mark_dirty();
                }
                if pool.load_dirty_bit(1).map_err(PoolError::Io)? {
                    pool.back.mark_dirty();
                }
                match recover(&pool.front, &pool.back, pool.config.open_read_only_allow_dirty)? {
                    RecoveryAction::UseFront | RecoveryAction::UseBack => {}
                    RecoveryAction::HealFrontFromBack => {
                        pool.front.decode_into(&pool.back.encode());
                        pool.front.clear_dirty();
                        pool.mmap_write_mirror(&pool.devices[0], 0, &pool.front).map_err(PoolError::Io)?;
                        pool.persist_dirty_bit(0, false).map_err(PoolError::Io)?;
                    }
                    RecoveryAction::HealBackFromFront => {
                        pool.back.decode_into(&pool.front.encode());
                        pool.back.clear_dirty();
                        pool.mmap_write_mirror(&pool.devices[0], 1, &pool.back).map_err(PoolError::Io)?;
                        pool.persist_dirty_bit(1, false).map_err(PoolError::Io)?;
                    }
                }
            }
        }

        Ok(pool)
    }

    pub fn chunk_capacity(&self) -> u64 {
        self.config.chunk_capacity
    }

    pub fn sequential_chunk_count(&self) -> usize {
        self.chunk_placement.len()
    }

    /// Hands out a shared activation handle for a chunk; the last drop
    /// releases OS file descriptors (handled by `Arc` + `HashMap` eviction
    /// being the caller's responsibility via [`Self::deactivate`]).
    pub fn activate_chunk(&self, list: ChunkList, chunk_global_id: u32) -> PoolResult<Arc<ChunkActivation>> {
        let mut activations = self.activations.lock();
        if let Some(existing) = activations.get(&chunk_global_id) {
            return Ok(existing.clone());
        }
        let (device_index, chunk_index) = *self
            .chunk_placement
            .get(chunk_global_id as usize)
            .ok_or_else(|| PoolError::Io(io::Error::new(io::ErrorKind::NotFound, "unknown chunk id")))?;
        let device = &self.devices[device_index as usize];
        let byte_offset_in_device =
            device.chunk_byte_offset(chunk_index + CONVENTIONAL_CHUNKS_PER_DEVICE as u32);
        let _ = list;
        let activation = Arc::new(ChunkActivation {
            device_index,
            chunk_id: chunk_global_id,
            kind: ChunkKind::Sequential,
            byte_offset_in_device,
            capacity: device.chunk_capacity,
        });
        activations.insert(chunk_global_id, activation.clone());
        Ok(activation)
    }

    pub fn deactivate_chunk(&self, chunk_global_id: u32) {
        self.activations.lock().remove(&chunk_global_id);
    }

    /// Reserves `n_bytes` against the chunk's append-only byte-used counter
    /// and returns the write position. Aborts (returns an error, which is
    /// fatal on the upsert path) if capacity would be exceeded.
    pub fn write_fd_reserve(&self, chunk_global_id: u32, n_bytes: u64) -> PoolResult<u64> {
        let meta = &self.front.chunks[chunk_global_id as usize];
        meta.reserve_bytes(n_bytes, self.chunk_capacity())
    }

    /// Appends `bytes` to the tail of `list`'s write frontier, allocating a
    /// fresh chunk from the free list when the current head chunk has no
    /// room left. Returns the physical offset (for embedding in a parent's
    /// child pointer) and the virtual offset (for cache keys and compaction
    /// ordering). This is the synchronous counterpart of the spec's
    /// executor-routed node write; callers on the executor's owning thread
    /// use it directly, since node writes never actually need to overlap
    /// with other submissions on a single-threaded engine.
    pub fn append_bytes(&self, list: ChunkList, bytes: &[u8]) -> PoolResult<(crate::offset::PhysicalOffset, crate::offset::VirtualOffset)> {
        let capacity = self.chunk_capacity();
        if bytes.len() as u64 > capacity {
            return Err(PoolError::ChunkCapacityExceeded(bytes.len() as u64, capacity));
        }

        let needs_new_chunk = match self.front.head(list) {
            Some(id) => self.front.chunks[id as usize].bytes_used.load(std::sync::atomic::Ordering::Acquire) + bytes.len() as u64 > capacity,
            None => true,
        };
        let chunk_id = if needs_new_chunk {
            self.front.allocate_chunk(list)?
        } else {
            self.front.head(list).expect("checked above")
        };

        let position = self.front.chunks[chunk_id as usize].reserve_bytes(bytes.len() as u64, capacity)?;
        let activation = self.activate_chunk(list, chunk_id)?;
        self.write_at(activation.device_index, activation.byte_offset_in_device + position, bytes)
            .map_err(PoolError::Io)?;

        let insertion_count = self.front.chunks[chunk_id as usize].insertion_count();
        let pages_to_read = ((bytes.len() as u64 + DISK_PAGE - 1) / DISK_PAGE).max(1) as u8;
        let physical = crate::offset::PhysicalOffset::new(chunk_id, position, pages_to_read);
        let virtual_offset = crate::offset::VirtualOffset::new(insertion_count, position as u32);

        let frontier = match list {
            ChunkList::Fast => &self.front.fast_offset,
            ChunkList::Slow => &self.front.slow_offset,
            ChunkList::Free => unreachable!("writer routing never targets the free list"),
        };
        frontier.store(insertion_count as u64, std::sync::atomic::Ordering::Release);

        Ok((physical, virtual_offset))
    }

    /// Reads the bytes for a previously-written node back out, using the
    /// pages-to-read hint packed into `offset` to size the read.
    pub fn read_node_bytes(&self, offset: crate::offset::PhysicalOffset) -> PoolResult<Vec<u8>> {
        let activation = self.activate_chunk(ChunkList::Fast, offset.chunk_id())?;
        let (aligned, delta) = offset.page_aligned();
        let read_len = (offset.pages_to_read().max(1) as u64 * DISK_PAGE) as usize;
        let mut buf = vec![0u8; read_len];
        self.read_at(activation.device_index, activation.byte_offset_in_device + aligned, &mut buf)
            .map_err(PoolError::Io)?;
        Ok(buf[delta as usize..].to_vec())
    }

    /// Writes `data` at `byte_offset` within the given device. Conventional
    /// chunk mutations go through this for metadata mirrors; sequential
    /// chunk writes go through the I/O executor in normal operation, but
    /// this path is used by synchronous test fixtures and recovery.
    pub fn write_at(&self, device_index: u16, byte_offset: u64, data: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        let device = &self.devices[device_index as usize];
        let file = device.file.lock();
        file.write_all_at(data, byte_offset)
    }

    pub fn read_at(&self, device_index: u16, byte_offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        let device = &self.devices[device_index as usize];
        let file = device.file.lock();
        file.read_exact_at(buf, byte_offset)
    }

    /// Flushes the front metadata mirror into the first conventional chunk
    /// of device 0 and the back mirror into the second, via a private mmap
    /// so the dirty-guard protocol in §4.2 commits through ordinary page
    /// writes rather than a syscall per field.
    pub fn persist_metadata(&self) -> io::Result<()> {
        let device = &self.devices[0];
        self.mmap_write_mirror(device, 0, &self.front)?;
        self.mmap_write_mirror(device, 1, &self.back)?;
        Ok(())
    }

    /// Byte offset of a mirror's on-disk dirty flag: the last byte of its
    /// conventional chunk, deliberately outside the range [`Self::mmap_write_mirror`]
    /// touches so raising/clearing it is a single-byte write independent of
    /// whatever the encoded payload's current length happens to be (§4.2's
    /// "dirty flag brackets the mutation rather than being part of the
    /// payload it guards").
    fn dirty_byte_offset(&self, conventional_slot: u32) -> u64 {
        let device = &self.devices[0];
        device.chunk_byte_offset(conventional_slot) + device.chunk_capacity - 1
    }

    /// Raises or clears a mirror's dirty flag on disk. Called around the
    /// bracketed mutation a [`crate::metadata::DirtyGuard`] guards in
    /// memory; writing it as its own single-byte `write_at` rather than
    /// folding it into [`Self::persist_metadata`] means it survives a crash
    /// that lands between "dirty raised" and "metadata flushed".
    pub fn persist_dirty_bit(&self, conventional_slot: u32, dirty: bool) -> io::Result<()> {
        self.write_at(0, self.dirty_byte_offset(conventional_slot), &[dirty as u8])
    }

    /// Reads a mirror's on-disk dirty flag back, consulted at open before
    /// [`crate::metadata::recover`] runs.
    pub fn load_dirty_bit(&self, conventional_slot: u32) -> io::Result<bool> {
        let mut buf = [0u8; 1];
        self.read_at(0, self.dirty_byte_offset(conventional_slot), &mut buf)?;
        Ok(buf[0] != 0)
    }

    fn mmap_write_mirror(&self, device: &Arc<Device>, conventional_slot: u32, mirror: &MetadataMirror) -> io::Result<()> {
        let encoded = mirror.encode();
        let offset = device.chunk_byte_offset(conventional_slot);
        let file = device.file.lock();
        // Capped one byte short of the chunk so the trailing dirty-flag
        // byte (see `dirty_byte_offset`) is never part of this mapping.
        let usable_capacity = device.chunk_capacity - 1;
        let mut mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(offset)
                .len(usable_capacity.min((encoded.len() as u64).max(DISK_PAGE.min(usable_capacity))) as usize)
                .map_mut(&*file)?
        };
        let n = encoded.len().min(mmap.len());
        mmap[..n].copy_from_slice(&encoded[..n]);
        mmap.flush()?;
        Ok(())
    }

    /// Loads a previously persisted mirror back from its conventional chunk.
    pub fn load_metadata_mirror(&self, conventional_slot: u32, mirror: &MetadataMirror) -> io::Result<()> {
        let device = &self.devices[0];
        let offset = device.chunk_byte_offset(conventional_slot);
        let file = device.file.lock();
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(offset)
                .len(device.chunk_capacity.min(DISK_PAGE * 64) as usize)
                .map(&*file)?
        };
        mirror.decode_into(&mmap);
        Ok(())
    }

    /// Hole-punches (files) or discards (block devices) the tail of a
    /// chunk beyond `keep_bytes`, reading-modifying-zeroing the boundary
    /// page if the truncation point is mid-page so stale bytes beyond the
    /// new logical size are never visible.
    pub fn try_trim_contents(&self, device_index: u16, byte_offset: u64, capacity: u64, keep_bytes: u64) -> io::Result<()> {
        let device = &self.devices[device_index as usize];
        let file = device.file.lock();
        use std::os::unix::fs::FileExt;

        if keep_bytes % DISK_PAGE != 0 {
            let page_start = (keep_bytes / DISK_PAGE) * DISK_PAGE;
            let mut page = vec![0u8; DISK_PAGE as usize];
            let read_len = ((page_start + DISK_PAGE).min(capacity) - page_start) as usize;
            file.read_exact_at(&mut page[..read_len], byte_offset + page_start)?;
            let zero_from = (keep_bytes - page_start) as usize;
            for b in &mut page[zero_from..read_len] {
                *b = 0;
            }
            file.write_all_at(&page[..read_len], byte_offset + page_start)?;
        }

        #[cfg(target_os = "linux")]
        {
            let trim_start = ((keep_bytes + DISK_PAGE - 1) / DISK_PAGE) * DISK_PAGE;
            if trim_start < capacity {
                let _ = nix_fallocate_punch_hole(&file, (byte_offset + trim_start) as i64, (capacity - trim_start) as i64);
            }
        }
        Ok(())
    }

    /// Copies up to `n` bytes from one location to another using the
    /// fastest available path; falls back to a plain read-then-write loop
    /// when kernel copy-offload is unavailable.
    pub fn clone_contents_into(
        &self,
        src_device: u16,
        src_offset: u64,
        dst_device: u16,
        dst_offset: u64,
        n: u64,
    ) -> io::Result<()> {
        const BUF: usize = 1 << 20;
        let mut remaining = n;
        let mut so = src_offset;
        let mut dof = dst_offset;
        let mut buf = vec![0u8; BUF.min(n as usize).max(1)];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            self.read_at(src_device, so, &mut buf[..chunk])?;
            self.write_at(dst_device, dof, &buf[..chunk])?;
            so += chunk as u64;
            dof += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn nix_fallocate_punch_hole(file: &File, offset: i64, len: i64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Even interleaving across devices using continuous-ratio counters: given
/// per-device sequential-chunk counts c1..cn and total T, emits chunks so
/// that any prefix of length k has approximately k*ci/T chunks on device i.
fn interleave_chunks(devices: &[Arc<Device>]) -> Vec<(u16, u32)> {
    let total: u64 = devices.iter().map(|d| d.sequential_chunk_count as u64).sum();
    if total == 0 {
        return Vec::new();
    }
    let mut fractional: Vec<f64> = devices.iter().map(|_| 0.0).collect();
    let mut emitted_per_device: Vec<u32> = devices.iter().map(|_| 0).collect();
    let mut placement = Vec::with_capacity(total as usize);

    for _ in 0..total {
        let mut chosen: Option<usize> = None;
        for i in 0..devices.len() {
            let ci = devices[i].sequential_chunk_count as u64;
            if emitted_per_device[i] as u64 >= ci {
                continue;
            }
            fractional[i] -= 1.0;
            if fractional[i] <= 0.0 {
                match chosen {
                    None => chosen = Some(i),
                    Some(j) if i < j => chosen = Some(i),
                    _ => {}
                }
            }
        }
        let i = chosen.unwrap_or_else(|| {
            (0..devices.len())
                .filter(|&i| (emitted_per_device[i] as u64) < devices[i].sequential_chunk_count as u64)
                .min_by(|&a, &b| {
                    let ra = emitted_per_device[a] as f64 / devices[a].sequential_chunk_count.max(1) as f64;
                    let rb = emitted_per_device[b] as f64 / devices[b].sequential_chunk_count.max(1) as f64;
                    ra.partial_cmp(&rb).unwrap()
                })
                .expect("total > 0 implies some device has remaining chunks")
        });
        let ci = devices[i].sequential_chunk_count as u64;
        fractional[i] += total as f64 / ci as f64;
        placement.push((devices[i].index, emitted_per_device[i]));
        emitted_per_device[i] += 1;
    }
    placement
}

fn sequential_chunks(devices: &[Arc<Device>]) -> Vec<(u16, u32)> {
    let mut placement = Vec::new();
    for device in devices {
        for c in 0..device.sequential_chunk_count {
            placement.push((device.index, c));
        }
    }
    placement
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_devices(counts: &[u32]) -> Vec<Arc<Device>> {
        // Device::chunk_byte_offset etc. are not exercised here; we only
        // need `index` and `sequential_chunk_count` for the interleave
        // algorithm, so construct minimal devices via transmute-free
        // field access through a helper constructor used only in tests.
        counts
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                Arc::new(Device {
                    index: i as u16,
                    path: PathBuf::new(),
                    file: Mutex::new(tempfile::tempfile().unwrap()),
                    size: 0,
                    chunk_capacity: 4096,
                    sequential_chunk_count: c,
                })
            })
            .collect()
    }

    #[test]
    fn interleave_respects_proportional_share() {
        let devices = fake_devices(&[3, 1]);
        let placement = interleave_chunks(&devices);
        assert_eq!(placement.len(), 4);
        let dev0_count = placement.iter().filter(|(d, _)| *d == 0).count();
        let dev1_count = placement.iter().filter(|(d, _)| *d == 1).count();
        assert_eq!(dev0_count, 3);
        assert_eq!(dev1_count, 1);
    }

    #[test]
    fn interleave_ties_break_by_device_index() {
        let devices = fake_devices(&[2, 2]);
        let placement = interleave_chunks(&devices);
        assert_eq!(placement[0].0, 0);
    }

    #[test]
    fn sequential_placement_is_per_device_contiguous() {
        let devices = fake_devices(&[2, 2]);
        let placement = sequential_chunks(&devices);
        assert_eq!(placement, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn config_hash_is_stable_for_same_inputs() {
        let paths = vec![PathBuf::from("/a"), PathBuf::from("/b")];
        let h1 = config_hash(&paths, &[100, 200], 4096);
        let h2 = config_hash(&paths, &[100, 200], 4096);
        assert_eq!(h1, h2);
    }

    fn sized_temp_file(chunks: u64) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * chunks + 4096).unwrap();
        file
    }

    #[test]
    fn truncate_persists_clean_mirrors_that_reopen_can_recover() {
        let file = sized_temp_file(16);
        let path = file.path().to_path_buf();

        {
            let pool = StoragePool::open(PoolConfig::new(vec![path.clone()], 4096).truncate()).unwrap();
            assert!(!pool.front.is_dirty());
            assert!(!pool.back.is_dirty());
        }

        let reopened = StoragePool::open(PoolConfig::new(vec![path], 4096)).unwrap();
        assert!(!reopened.front.is_dirty());
        assert!(!reopened.back.is_dirty());
        assert_eq!(reopened.front.list_iter(ChunkList::Free).len(), reopened.front.chunks.len());
    }

    #[test]
    fn a_front_dirty_on_disk_after_a_simulated_crash_heals_from_the_clean_back() {
        let file = sized_temp_file(16);
        let path = file.path().to_path_buf();

        let pool = StoragePool::open(PoolConfig::new(vec![path.clone()], 4096).truncate()).unwrap();
        pool.front.allocate_chunk(ChunkList::Fast).unwrap();
        pool.persist_metadata().unwrap();
        // Simulate a crash between "front mirror updated" and "back mirror
        // mirrored and dirty bit cleared": front is ahead of back on disk,
        // and its dirty byte was never cleared.
        pool.persist_dirty_bit(0, true).unwrap();
        drop(pool);

        let reopened = StoragePool::open(PoolConfig::new(vec![path], 4096)).unwrap();
        // Healed from the clean back copy, so the allocation that never
        // made it past the front mirror is gone again.
        assert!(!reopened.front.is_dirty());
        assert_eq!(reopened.front.list_iter(ChunkList::Free).len(), reopened.front.chunks.len());
    }

    #[test]
    fn both_mirrors_dirty_on_disk_without_allow_dirty_fails_to_open() {
        let file = sized_temp_file(16);
        let path = file.path().to_path_buf();

        let pool = StoragePool::open(PoolConfig::new(vec![path.clone()], 4096).truncate()).unwrap();
        pool.persist_dirty_bit(0, true).unwrap();
        pool.persist_dirty_bit(1, true).unwrap();
        drop(pool);

        let result = StoragePool::open(PoolConfig::new(vec![path], 4096));
        assert!(result.is_err());
    }
}
