//! Partition table discovery inside flat disk images.
//!
//! Supports GPT (protective MBR plus an "EFI PART" header at LBA 1, with
//! 512-byte or 4096-byte logical blocks) and classic MBR primary
//! partitions. A disk without either is treated as a single volume
//! spanning the whole image. Indices are 0-based and count only used
//! entries, in table order.

use std::io::{self, Read, Seek, SeekFrom};

use imgmount_device::ImageStream;

/// Logical block size of MBR tables.
pub const LBA_SIZE: u64 = 512;

/// Logical block sizes tried, in order, when looking for a GPT header.
const GPT_BLOCK_SIZES: [u64; 2] = [512, 4096];

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_TABLE_OFFSET: usize = 0x1BE;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_PROTECTIVE: u8 = 0xEE;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_MIN_ENTRY_SIZE: usize = 128;
const GPT_MAX_ENTRIES: u32 = 1024;
const GPT_MAX_ENTRY_SIZE: u32 = 4096;

/// Which table described the partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    Gpt,
    Mbr,
    /// No table; the whole disk is one volume.
    WholeDisk,
}

/// Partition type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// MBR system id byte.
    Mbr(u8),
    /// GPT type GUID, on-disk byte order.
    Gpt([u8; 16]),
    WholeDisk,
}

/// One volume inside a disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    /// Byte offset of the first byte.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    pub kind: PartitionKind,
    /// GPT partition name, if any.
    pub name: Option<String>,
}

/// The volumes found in a disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub scheme: PartitionScheme,
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Read the partition table of `disk`.
    pub fn read(disk: &mut dyn ImageStream) -> io::Result<Self> {
        let disk_len = disk.length();
        let Some(mbr) = read_block(disk, 0, disk_len)? else {
            return Ok(Self::whole_disk(disk_len));
        };
        if mbr[510..512] != MBR_SIGNATURE {
            return Ok(Self::whole_disk(disk_len));
        }

        let primaries = mbr_entries(&mbr);
        if primaries.iter().any(|e| e.kind == MBR_PROTECTIVE) {
            if let Some(table) = read_gpt(disk, disk_len)? {
                return Ok(table);
            }
            tracing::warn!("protective MBR without a valid GPT header, using MBR entries");
        }

        let partitions: Vec<Partition> = primaries
            .into_iter()
            .filter(|e| e.kind != 0 && e.kind != MBR_PROTECTIVE && e.sectors != 0)
            .map(|e| Partition {
                index: 0,
                start: e.first_lba as u64 * LBA_SIZE,
                length: e.sectors as u64 * LBA_SIZE,
                kind: PartitionKind::Mbr(e.kind),
                name: None,
            })
            .collect();

        if partitions.is_empty() {
            return Ok(Self::whole_disk(disk_len));
        }
        Ok(Self::numbered(PartitionScheme::Mbr, partitions, disk_len))
    }

    fn whole_disk(disk_len: u64) -> Self {
        Self {
            scheme: PartitionScheme::WholeDisk,
            partitions: vec![Partition {
                index: 0,
                start: 0,
                length: disk_len,
                kind: PartitionKind::WholeDisk,
                name: None,
            }],
        }
    }

    /// Assign indices and drop entries that lie outside the disk.
    fn numbered(scheme: PartitionScheme, partitions: Vec<Partition>, disk_len: u64) -> Self {
        let partitions = partitions
            .into_iter()
            .filter(|p| {
                let inside = p.start.checked_add(p.length).is_some_and(|end| end <= disk_len);
                if !inside {
                    tracing::warn!(
                        start = p.start,
                        length = p.length,
                        disk_len,
                        "ignoring partition outside the disk image"
                    );
                }
                inside
            })
            .enumerate()
            .map(|(index, p)| Partition { index, ..p })
            .collect();
        Self { scheme, partitions }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Partition> {
        self.partitions.get(index)
    }
}

struct MbrEntry {
    kind: u8,
    first_lba: u32,
    sectors: u32,
}

fn mbr_entries(mbr: &[u8]) -> Vec<MbrEntry> {
    (0..4)
        .map(|i| {
            let e = &mbr[MBR_TABLE_OFFSET + i * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE];
            MbrEntry {
                kind: e[4],
                first_lba: le_u32(&e[8..12]),
                sectors: le_u32(&e[12..16]),
            }
        })
        .collect()
}

fn read_gpt(disk: &mut dyn ImageStream, disk_len: u64) -> io::Result<Option<PartitionTable>> {
    for block_size in GPT_BLOCK_SIZES {
        if let Some(table) = read_gpt_at(disk, disk_len, block_size)? {
            return Ok(Some(table));
        }
    }
    Ok(None)
}

/// Read a GPT whose header sits at LBA 1 for the given block size.
fn read_gpt_at(
    disk: &mut dyn ImageStream,
    disk_len: u64,
    block_size: u64,
) -> io::Result<Option<PartitionTable>> {
    let Some(header) = read_block(disk, block_size, disk_len)? else {
        return Ok(None);
    };
    if &header[0..8] != GPT_SIGNATURE {
        return Ok(None);
    }

    let entries_lba = le_u64(&header[72..80]);
    let entry_count = le_u32(&header[80..84]);
    let entry_size = le_u32(&header[84..88]);
    if (entry_size as usize) < GPT_MIN_ENTRY_SIZE
        || entry_size > GPT_MAX_ENTRY_SIZE
        || entry_count > GPT_MAX_ENTRIES
    {
        tracing::warn!(entry_size, entry_count, "implausible GPT entry layout");
        return Ok(None);
    }

    let array_len = entry_size as u64 * entry_count as u64;
    let array_start = entries_lba
        .checked_mul(block_size)
        .filter(|start| start.checked_add(array_len).is_some_and(|end| end <= disk_len));
    let Some(array_start) = array_start else {
        tracing::warn!(entries_lba, "GPT entry array runs past the end of the disk");
        return Ok(None);
    };
    let mut array = vec![0u8; array_len as usize];
    disk.seek(SeekFrom::Start(array_start))?;
    disk.read_exact(&mut array)?;

    let partitions = array
        .chunks_exact(entry_size as usize)
        .filter_map(|entry| {
            let mut type_guid = [0u8; 16];
            type_guid.copy_from_slice(&entry[0..16]);
            if type_guid == [0u8; 16] {
                return None;
            }
            let first = le_u64(&entry[32..40]);
            let last = le_u64(&entry[40..48]);
            let Some((start, length)) = gpt_extent(first, last, block_size) else {
                tracing::warn!(first, last, "ignoring GPT entry with an invalid extent");
                return None;
            };
            Some(Partition {
                index: 0,
                start,
                length,
                kind: PartitionKind::Gpt(type_guid),
                name: gpt_name(&entry[56..128]),
            })
        })
        .collect();

    if block_size != LBA_SIZE {
        tracing::debug!(block_size, "GPT uses large logical blocks");
    }
    Ok(Some(PartitionTable::numbered(
        PartitionScheme::Gpt,
        partitions,
        disk_len,
    )))
}

/// Byte offset and length of an inclusive LBA range, if it fits in a u64.
fn gpt_extent(first: u64, last: u64, block_size: u64) -> Option<(u64, u64)> {
    let blocks = last.checked_sub(first)?.checked_add(1)?;
    Some((first.checked_mul(block_size)?, blocks.checked_mul(block_size)?))
}

/// UTF-16LE name, NUL-terminated.
fn gpt_name(raw: &[u8]) -> Option<String> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    if units.is_empty() {
        return None;
    }
    Some(String::from_utf16_lossy(&units))
}

/// Read one logical block at `offset`, or `None` if the disk is too short.
fn read_block(
    disk: &mut dyn ImageStream,
    offset: u64,
    disk_len: u64,
) -> io::Result<Option<Vec<u8>>> {
    if offset.saturating_add(LBA_SIZE) > disk_len {
        return Ok(None);
    }
    let mut block = vec![0u8; LBA_SIZE as usize];
    disk.seek(SeekFrom::Start(offset))?;
    disk.read_exact(&mut block)?;
    Ok(Some(block))
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&b[..8]);
    u64::from_le_bytes(bytes)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use imgmount_device::{Access, ImageFile};
    use std::io::Write;

    fn stream(bytes: &[u8]) -> ImageFile {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        ImageFile::from_file(file, Access::ReadOnly)
    }

    #[test]
    fn test_blank_disk_is_whole_volume() {
        let mut disk = stream(&[0u8; 4096]);
        let table = PartitionTable::read(&mut disk).unwrap();
        assert_eq!(table.scheme, PartitionScheme::WholeDisk);
        assert_eq!(table.len(), 1);
        assert_eq!(table.partitions[0].length, 4096);
    }

    #[test]
    fn test_mbr_skips_empty_entries() {
        let bytes = mbr_disk(64, &[(0x83, 8, 16), (0, 0, 0), (0x07, 24, 32)]);
        let table = PartitionTable::read(&mut stream(&bytes)).unwrap();

        assert_eq!(table.scheme, PartitionScheme::Mbr);
        assert_eq!(table.len(), 2);
        assert_eq!(table.partitions[0].start, 8 * 512);
        assert_eq!(table.partitions[1].index, 1);
        assert_eq!(table.partitions[1].kind, PartitionKind::Mbr(0x07));
        assert_eq!(table.partitions[1].length, 32 * 512);
    }

    #[test]
    fn test_mbr_entry_past_end_dropped() {
        let bytes = mbr_disk(16, &[(0x83, 8, 100)]);
        let table = PartitionTable::read(&mut stream(&bytes)).unwrap();
        assert_eq!(table.scheme, PartitionScheme::Mbr);
        assert!(table.is_empty());
    }

    #[test]
    fn test_gpt_entries() {
        let bytes = gpt_disk(128, &[(34, 63, "boot"), (64, 127, "data")]);
        let table = PartitionTable::read(&mut stream(&bytes)).unwrap();

        assert_eq!(table.scheme, PartitionScheme::Gpt);
        assert_eq!(table.len(), 2);
        assert_eq!(table.partitions[0].start, 34 * 512);
        assert_eq!(table.partitions[0].length, 30 * 512);
        assert_eq!(table.partitions[1].name.as_deref(), Some("data"));
        assert_eq!(table.get(1).map(|p| p.index), Some(1));
    }

    #[test]
    fn test_gpt_with_4k_blocks() {
        let bytes = gpt_disk_with_blocks(4096, 64, &[(6, 31, "esp"), (32, 63, "root")]);
        let table = PartitionTable::read(&mut stream(&bytes)).unwrap();

        assert_eq!(table.scheme, PartitionScheme::Gpt);
        assert_eq!(table.len(), 2);
        assert_eq!(table.partitions[0].start, 6 * 4096);
        assert_eq!(table.partitions[0].length, 26 * 4096);
        assert_eq!(table.partitions[1].name.as_deref(), Some("root"));
    }

    #[test]
    fn test_gpt_entries_with_overflowing_extents_skipped() {
        let bytes = gpt_disk(
            128,
            &[
                (34, 63, "ok"),
                (0, u64::MAX, "wraps"),
                (u64::MAX / 2, u64::MAX / 2 + 1, "far"),
            ],
        );
        let table = PartitionTable::read(&mut stream(&bytes)).unwrap();

        assert_eq!(table.scheme, PartitionScheme::Gpt);
        assert_eq!(table.len(), 1);
        assert_eq!(table.partitions[0].name.as_deref(), Some("ok"));
    }

    #[test]
    fn test_gpt_entry_array_offset_overflow_rejected() {
        let mut bytes = gpt_disk(128, &[(34, 63, "ok")]);
        bytes[512 + 72..512 + 80].copy_from_slice(&(u64::MAX / 4).to_le_bytes());

        let table = PartitionTable::read(&mut stream(&bytes)).unwrap();
        assert_eq!(table.scheme, PartitionScheme::WholeDisk);
    }

    #[test]
    fn test_protective_entry_never_a_partition() {
        let bytes = mbr_disk(64, &[(MBR_PROTECTIVE, 1, 63)]);
        let table = PartitionTable::read(&mut stream(&bytes)).unwrap();
        assert_eq!(table.scheme, PartitionScheme::WholeDisk);
        assert_eq!(table.partitions[0].kind, PartitionKind::WholeDisk);

        let bytes = mbr_disk(64, &[(MBR_PROTECTIVE, 1, 8), (0x83, 16, 16)]);
        let table = PartitionTable::read(&mut stream(&bytes)).unwrap();
        assert_eq!(table.scheme, PartitionScheme::Mbr);
        assert_eq!(table.len(), 1);
        assert_eq!(table.partitions[0].kind, PartitionKind::Mbr(0x83));
        assert_eq!(table.partitions[0].start, 16 * 512);
    }
}
