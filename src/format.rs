//! Shard file codec.
//!
//! Layout: `SHRDSEEK` magic, `u32` version, `u8` element type + 3 pad bytes,
//! `u32` rank, `rank x u32` shape, then the little-endian payload. The header is
//! always a multiple of 4 bytes, so f32 payloads are read in place from the
//! memory map.

use std::fs::{self, create_dir_all, remove_file, rename, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeekError};

pub const MAGIC: &[u8; 8] = b"SHRDSEEK";
pub const VERSION: u32 = 1;
pub const MAX_RANK: usize = 3;
pub const MAX_EXTENT: usize = 1 << 31;
const FIXED_HEADER: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElemType {
    #[default]
    F32,
    F16,
}

impl ElemType {
    pub fn size(&self) -> usize {
        match self {
            ElemType::F32 => 4,
            ElemType::F16 => 2,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            ElemType::F32 => 0,
            ElemType::F16 => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ElemType::F32),
            1 => Some(ElemType::F16),
            _ => None,
        }
    }
}

/// Owned, row-major array. The leading axis is the item axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        check_shape(&shape)?;
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(SeekError::DimensionMismatch { expected, got: data.len() });
        }
        Ok(Self { shape, data })
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dims = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(rows.len() * dims);
        for row in rows {
            if row.len() != dims {
                return Err(SeekError::DimensionMismatch { expected: dims, got: row.len() });
            }
            data.extend_from_slice(row);
        }
        Self::new(vec![rows.len(), dims], data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Number of values per item.
    pub fn item_len(&self) -> usize {
        self.shape[1..].iter().product()
    }

    pub fn item(&self, i: usize) -> &[f32] {
        let n = self.item_len();
        &self.data[i * n..(i + 1) * n]
    }
}

fn check_shape(shape: &[usize]) -> Result<()> {
    if shape.is_empty() || shape.len() > MAX_RANK {
        return Err(SeekError::InvalidArgument(format!(
            "shard rank must be between 1 and {}, got {}",
            MAX_RANK,
            shape.len()
        )));
    }
    if let Some(&extent) = shape.iter().find(|&&e| e > MAX_EXTENT) {
        return Err(SeekError::InvalidArgument(format!(
            "axis extent {} exceeds maximum {}",
            extent, MAX_EXTENT
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHeader {
    pub version: u32,
    pub elem: ElemType,
    pub shape: Vec<usize>,
}

impl ShardHeader {
    pub fn header_len(&self) -> usize {
        FIXED_HEADER + 4 * self.shape.len()
    }

    pub fn payload_len(&self) -> usize {
        self.shape.iter().product::<usize>() * self.elem.size()
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&[self.elem.tag(), 0, 0, 0]);
        out.extend_from_slice(&(self.shape.len() as u32).to_le_bytes());
        for &d in &self.shape {
            out.extend_from_slice(&(d as u32).to_le_bytes());
        }
        out
    }
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn parse_fixed(bytes: &[u8], path: &Path) -> Result<(u32, ElemType, usize)> {
    if bytes.len() < FIXED_HEADER || &bytes[0..8] != MAGIC {
        return Err(SeekError::format(path, "missing SHRDSEEK magic"));
    }
    let version = le_u32(bytes, 8);
    if version != VERSION {
        return Err(SeekError::format(path, format!("unsupported version {}", version)));
    }
    let elem = ElemType::from_tag(bytes[12])
        .ok_or_else(|| SeekError::format(path, format!("unknown element tag {}", bytes[12])))?;
    let rank = le_u32(bytes, 16) as usize;
    if rank == 0 || rank > MAX_RANK {
        return Err(SeekError::format(path, format!("invalid rank {}", rank)));
    }
    Ok((version, elem, rank))
}

fn parse_header(bytes: &[u8], path: &Path) -> Result<ShardHeader> {
    let (version, elem, rank) = parse_fixed(bytes, path)?;
    if bytes.len() < FIXED_HEADER + 4 * rank {
        return Err(SeekError::format(path, "truncated shape"));
    }
    let shape = (0..rank)
        .map(|i| le_u32(bytes, FIXED_HEADER + 4 * i) as usize)
        .collect();
    Ok(ShardHeader { version, elem, shape })
}

/// Reads only the header, plus a size check against the file length.
pub fn read_header(path: &Path) -> Result<ShardHeader> {
    let mut file = File::open(path).map_err(|e| SeekError::io(path, e))?;
    let file_len = file.metadata().map_err(|e| SeekError::io(path, e))?.len() as usize;
    let mut buf = vec![0u8; FIXED_HEADER + 4 * MAX_RANK];
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..]).map_err(|e| SeekError::io(path, e))?;
        if n == 0 {
            break;
        }
        read += n;
    }
    let header = parse_header(&buf[..read], path)?;
    let expected = header.header_len() + header.payload_len();
    if expected != file_len {
        return Err(SeekError::format(
            path,
            format!("size mismatch: expected {} bytes, found {}", expected, file_len),
        ));
    }
    Ok(header)
}

enum Storage {
    Mapped { mmap: Mmap, offset: usize },
    Owned(Vec<f32>),
}

/// A shard as read back from disk. f32 shards stay memory mapped, so the
/// returned values must be treated as read-only.
pub struct ShardData {
    path: PathBuf,
    shape: Vec<usize>,
    storage: Storage,
}

impl ShardData {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn item_len(&self) -> usize {
        self.shape[1..].iter().product()
    }

    /// Extent of the sequence-position axis for `(n, T, D)` shards.
    pub fn positions(&self) -> Option<usize> {
        (self.shape.len() == 3).then(|| self.shape[1])
    }

    /// Width of the innermost axis.
    pub fn row_dims(&self) -> usize {
        if self.shape.len() == 1 {
            1
        } else {
            self.shape[self.shape.len() - 1]
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.storage, Storage::Mapped { .. })
    }

    pub fn as_slice(&self) -> &[f32] {
        match &self.storage {
            Storage::Mapped { mmap, offset } => bytemuck::cast_slice(&mmap[*offset..]),
            Storage::Owned(v) => v,
        }
    }

    /// All values of item `i`, flattened.
    pub fn item(&self, i: usize) -> &[f32] {
        let n = self.item_len();
        &self.as_slice()[i * n..(i + 1) * n]
    }

    /// Row of item `i` at sequence position `t`. Only meaningful for rank-3 shards.
    pub fn item_at(&self, i: usize, t: usize) -> &[f32] {
        let d = self.row_dims();
        let per_item = self.item_len();
        let start = i * per_item + t * d;
        &self.as_slice()[start..start + d]
    }
}

pub fn read_shard_file(path: &Path) -> Result<ShardData> {
    if !path.is_file() {
        return Err(SeekError::NotGenerated(format!("shard {}", path.display())));
    }
    let file = File::open(path).map_err(|e| SeekError::io(path, e))?;
    let mmap = unsafe { Mmap::map(&file).map_err(|e| SeekError::io(path, e))? };
    let header = parse_header(&mmap, path)?;
    let offset = header.header_len();
    let expected = offset + header.payload_len();
    if expected != mmap.len() {
        return Err(SeekError::format(
            path,
            format!("data size mismatch: expected {}, got {}", expected, mmap.len()),
        ));
    }

    let zero_copy = header.elem == ElemType::F32
        && cfg!(target_endian = "little")
        && bytemuck::try_cast_slice::<u8, f32>(&mmap[offset..]).is_ok();

    let storage = if zero_copy {
        Storage::Mapped { mmap, offset }
    } else {
        let payload = &mmap[offset..];
        Storage::Owned(match header.elem {
            ElemType::F32 => payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            ElemType::F16 => payload
                .chunks_exact(2)
                .map(|c| half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
        })
    };

    Ok(ShardData { path: path.to_path_buf(), shape: header.shape, storage })
}

/// Writes a shard atomically: the payload goes to a `.tmp` sibling which is
/// verified and then renamed over `path`.
pub fn write_shard_file(path: &Path, shape: &[usize], data: &[f32], elem: ElemType) -> Result<()> {
    check_shape(shape)?;
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(SeekError::DimensionMismatch { expected, got: data.len() });
    }

    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(|e| SeekError::io(parent, e))?;
    }

    let header = ShardHeader { version: VERSION, elem, shape: shape.to_vec() };
    let head = header.encode();
    let total_size = head.len() + header.payload_len();

    let tmp_path = path.with_extension("tmp");
    if tmp_path.exists() {
        remove_file(&tmp_path).map_err(|e| SeekError::io(&tmp_path, e))?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| SeekError::io(&tmp_path, e))?;
    file.set_len(total_size as u64).map_err(|e| SeekError::io(&tmp_path, e))?;

    let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| SeekError::io(&tmp_path, e))? };
    mmap[..head.len()].copy_from_slice(&head);
    let body = &mut mmap[head.len()..];
    match elem {
        ElemType::F32 => {
            for (dst, v) in body.chunks_exact_mut(4).zip(data) {
                dst.copy_from_slice(&v.to_le_bytes());
            }
        }
        ElemType::F16 => {
            for (dst, v) in body.chunks_exact_mut(2).zip(data) {
                dst.copy_from_slice(&half::f16::from_f32(*v).to_bits().to_le_bytes());
            }
        }
    }
    mmap.flush().map_err(|e| SeekError::io(&tmp_path, e))?;
    drop(mmap);
    drop(file);

    let actual_size = fs::metadata(&tmp_path).map_err(|e| SeekError::io(&tmp_path, e))?.len();
    if actual_size != total_size as u64 {
        remove_file(&tmp_path).ok();
        return Err(SeekError::format(
            &tmp_path,
            format!("size verification failed: expected {}, got {}", total_size, actual_size),
        ));
    }

    rename(&tmp_path, path).map_err(|e| SeekError::io(path, e))?;
    Ok(())
}
