//! RomFS Level-3 image construction.
//!
//! A Level-3 image is the innermost, IVFC-wrapped layer of a RomFS: a
//! header, two hash tables, directory and file metadata tables, and the
//! raw file data. [`Level3::build`] walks a host directory and produces
//! the metadata blob plus a map from virtual data offsets to host paths;
//! file contents are never loaded, they are read on demand by the
//! [`reader`](crate::reader).

mod entry;
mod hash;

use core::mem;

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use log::{debug, warn};

use crate::string::RomfsName;
use crate::{align_up, align_up64, CtrfsError, CtrfsResult};
use entry::{DirEntry, FileEntry, Level3Header, RawDirEntry, RawFileEntry, SectionDescriptor};

pub(crate) use entry::INVALID_OFFSET;

/// Granularity of the virtual image size.
pub const BLOCK_SIZE: usize = 1 << 0xC;

pub(crate) const NAME_ALIGN: u32 = 4;
const FILE_DATA_ALIGN: i64 = 0x10;

const SECTION_DIR_HASH: usize = 0;
const SECTION_DIR_TABLE: usize = 1;
const SECTION_FILE_HASH: usize = 2;
const SECTION_FILE_TABLE: usize = 3;

bitflags! {
    /// Ways a build degraded without failing. An empty set means the
    /// image faithfully reflects the host tree as it was scanned.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BuildWarnings: u32 {
        /// A directory could not be listed; it contributed no children.
        const DIR_SCAN_FAILED = 0x1;
        /// A file's size could not be queried; it was stored as empty.
        const FILE_SIZE_FAILED = 0x2;
        /// A host name was not valid Unicode; a lossy copy was stored.
        const NAME_NOT_UNICODE = 0x4;
    }
}

/// A built Level-3 image: the serialized metadata blob and the mapping
/// that locates file data on the host.
pub struct Level3 {
    blob: Vec<u8>,
    data_offset: u32,
    image_size: u64,
    file_map: BTreeMap<u64, PathBuf>,
    warnings: BuildWarnings,
}

impl Level3 {
    /// Walks `root_dir` and builds the Level-3 metadata for it.
    ///
    /// Unreadable directories and unstatable files degrade the image
    /// instead of failing the build; see [`Level3::warnings`]. The only
    /// fatal errors are arithmetic overflows of on-disk offset fields.
    pub fn build(root_dir: impl AsRef<Path>) -> CtrfsResult<Self> {
        let mut builder = Level3Builder::new(root_dir.as_ref().to_path_buf());
        builder.push_dir_entry(OsStr::new(""), 0);
        builder.stack.push(CreationFrame::new(0));
        builder.walk_tree()?;
        builder.prune_empty_dirs()?;
        builder.build_hash_tables();
        builder.link_offsets();
        builder.finalize_header()?;
        let data_offset = builder.header.data_offset;
        debug!(
            "built RomFS L3: {} dirs, {} files, metadata {data_offset:#x} bytes",
            builder.dirs.len(),
            builder.files.len(),
        );
        Ok(builder.emit())
    }

    /// The serialized header, hash tables and metadata tables. Its
    /// length equals [`Level3::data_offset`].
    #[must_use]
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }
    /// Offset at which file data begins within the virtual image.
    #[must_use]
    pub fn data_offset(&self) -> u32 {
        self.data_offset
    }
    /// Total size of the virtual image, block-aligned.
    #[must_use]
    pub fn image_size(&self) -> u64 {
        self.image_size
    }
    #[must_use]
    pub fn warnings(&self) -> BuildWarnings {
        self.warnings
    }
    /// Pairs of (virtual image offset, host path) for every non-empty
    /// file, in ascending offset order.
    pub fn file_map(&self) -> impl Iterator<Item = (u64, &Path)> + '_ {
        self.file_map.iter().map(|(&ofs, path)| (ofs, path.as_path()))
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, u32, BTreeMap<u64, PathBuf>) {
        (self.blob, self.data_offset, self.file_map)
    }
}

/// One directory awaiting its children pass. `cursor` is `None` until
/// the directory has been scanned, then counts recursion progress
/// through `child_dirs`.
struct CreationFrame {
    dir_index: usize,
    child_dirs: Vec<usize>,
    cursor: Option<usize>,
}

impl CreationFrame {
    fn new(dir_index: usize) -> Self {
        Self {
            dir_index,
            child_dirs: Vec::new(),
            cursor: None,
        }
    }
}

struct Level3Builder {
    root: PathBuf,
    header: Level3Header,
    dirs: Vec<DirEntry>,
    files: Vec<FileEntry>,
    stack: Vec<CreationFrame>,
    dir_buckets: Vec<i32>,
    file_buckets: Vec<i32>,
    /// Running end of file data, relative to `data_offset`. Unaligned.
    data_size: i64,
    warnings: BuildWarnings,
}

impl Level3Builder {
    fn new(root: PathBuf) -> Self {
        let mut header = Level3Header {
            header_size: mem::size_of::<Level3Header>() as u32,
            sections: [SectionDescriptor { offset: 0, size: 0 }; 4],
            data_offset: 0,
        };
        header.sections[SECTION_DIR_HASH].offset = align_up(header.header_size, NAME_ALIGN);
        Self {
            root,
            header,
            dirs: Vec::new(),
            files: Vec::new(),
            stack: Vec::new(),
            dir_buckets: Vec::new(),
            file_buckets: Vec::new(),
            data_size: 0,
            warnings: BuildWarnings::empty(),
        }
    }

    fn entry_name(&mut self, host_name: &OsStr) -> RomfsName {
        match RomfsName::try_from(host_name) {
            Ok(name) => name,
            Err(_) => {
                warn!("name {host_name:?} is not valid Unicode, storing a lossy copy");
                self.warnings |= BuildWarnings::NAME_NOT_UNICODE;
                RomfsName::from_os_lossy(host_name)
            }
        }
    }

    /// Appends a directory entry. The first pushed entry is the root:
    /// its host path is the build root and it is its own parent.
    fn push_dir_entry(&mut self, host_name: &OsStr, parent: i32) {
        let (host_path, name) = if self.dirs.is_empty() {
            (self.root.clone(), RomfsName::empty())
        } else {
            (
                self.dirs[parent as usize].host_path.join(host_name),
                self.entry_name(host_name),
            )
        };
        self.dirs.push(DirEntry::new(host_path, name, parent));

        // All children of a directory are appended consecutively, so the
        // previously appended entry is the new entry's elder sibling
        // unless the new entry is the first child.
        let new_index = (self.dirs.len() - 1) as i32;
        let first_child = self.dirs[parent as usize].raw.child_dir;
        if first_child != INVALID_OFFSET && new_index != first_child {
            let prev = (new_index - 1) as usize;
            let prev_parent = self.dirs[prev].raw.parent_dir;
            debug_assert_eq!(prev_parent, parent);
            self.dirs[prev].raw.sibling_dir = new_index;
        }
    }

    fn push_file_entry(&mut self, host_name: &OsStr, parent: i32) -> CtrfsResult<()> {
        let host_path = self.dirs[parent as usize].host_path.join(host_name);
        let name = self.entry_name(host_name);
        let entry_ofs = align_up(self.header.sections[SECTION_FILE_TABLE].size, NAME_ALIGN);
        let data_ofs = align_up64(self.data_size, FILE_DATA_ALIGN);
        let file_size = match fs::metadata(&host_path) {
            Ok(meta) => meta.len() as i64,
            Err(err) => {
                warn!("cannot stat {}: {err}", host_path.display());
                self.warnings |= BuildWarnings::FILE_SIZE_FAILED;
                0
            }
        };
        let name_padded = name.padded_len();
        self.files.push(FileEntry::new(
            host_path,
            name,
            parent,
            entry_ofs as i32,
            data_ofs,
            file_size,
        ));

        let new_index = (self.files.len() - 1) as i32;
        let first_child = self.dirs[parent as usize].raw.child_file;
        if first_child != INVALID_OFFSET && new_index != first_child {
            let prev = (new_index - 1) as usize;
            let prev_parent = self.files[prev].raw.parent_dir;
            debug_assert_eq!(prev_parent, parent);
            self.files[prev].raw.sibling_file = new_index;
        }

        self.header.sections[SECTION_FILE_TABLE].size = checked_add(
            entry_ofs,
            mem::size_of::<RawFileEntry>() as u32 + name_padded,
        )?;
        self.data_size = data_ofs
            .checked_add(file_size)
            .ok_or(CtrfsError::OffsetOverflow)?;
        Ok(())
    }

    /// Drives the creation stack until every directory has been scanned
    /// and recursed into. Children are discovered breadth-first per
    /// directory; recursion happens only after a directory's own
    /// children have all been appended.
    fn walk_tree(&mut self) -> CtrfsResult<()> {
        loop {
            let Some(top) = self.stack.last() else { break };
            match top.cursor {
                None => self.scan_top()?,
                Some(cursor) => {
                    if cursor < top.child_dirs.len() {
                        let child = top.child_dirs[cursor];
                        self.stack.last_mut().unwrap().cursor = Some(cursor + 1);
                        self.stack.push(CreationFrame::new(child));
                    } else {
                        self.stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    fn scan_top(&mut self) -> CtrfsResult<()> {
        let dir_index = self.stack.last().unwrap().dir_index;
        let path = self.dirs[dir_index].host_path.clone();
        for (host_name, is_dir) in self.scan_children(&path) {
            if is_dir {
                if self.dirs[dir_index].raw.child_dir == INVALID_OFFSET {
                    self.dirs[dir_index].raw.child_dir = self.dirs.len() as i32;
                }
                let new_index = self.dirs.len();
                self.stack.last_mut().unwrap().child_dirs.push(new_index);
                self.push_dir_entry(&host_name, dir_index as i32);
            } else {
                if self.dirs[dir_index].raw.child_file == INVALID_OFFSET {
                    self.dirs[dir_index].raw.child_file = self.files.len() as i32;
                }
                self.push_file_entry(&host_name, dir_index as i32)?;
            }
        }
        self.stack.last_mut().unwrap().cursor = Some(0);
        Ok(())
    }

    /// Lists one directory level in platform iteration order. Failure
    /// yields an empty child list and a warning flag; the directory may
    /// then be pruned as empty.
    fn scan_children(&mut self, path: &Path) -> Vec<(OsString, bool)> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot list {}: {err}", path.display());
                self.warnings |= BuildWarnings::DIR_SCAN_FAILED;
                return Vec::new();
            }
        };
        let mut children = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => {
                    let is_dir = entry.file_type().map(|ty| ty.is_dir()).unwrap_or(false);
                    children.push((entry.file_name(), is_dir));
                }
                Err(err) => {
                    warn!("cannot list an entry of {}: {err}", path.display());
                    self.warnings |= BuildWarnings::DIR_SCAN_FAILED;
                }
            }
        }
        children
    }

    /// Removes childless directories until none remain (the root is
    /// exempt), then lays out the directory table. Removal shifts the
    /// indexes of every entry behind the removed one, so all index
    /// references are rewritten on each removal.
    fn prune_empty_dirs(&mut self) -> CtrfsResult<()> {
        loop {
            let empty = (1..self.dirs.len()).rev().find(|&index| {
                self.dirs[index].raw.child_dir == INVALID_OFFSET
                    && self.dirs[index].raw.child_file == INVALID_OFFSET
            });
            match empty {
                Some(index) => self.remove_dir_entry(index),
                None => break,
            }
        }

        let mut table_size = 0u32;
        for dir in &mut self.dirs {
            let entry_ofs = align_up(table_size, NAME_ALIGN);
            dir.entry_ofs = entry_ofs as i32;
            table_size = checked_add(
                entry_ofs,
                mem::size_of::<RawDirEntry>() as u32 + dir.name.padded_len(),
            )?;
        }
        self.header.sections[SECTION_DIR_TABLE].size = table_size;
        Ok(())
    }

    fn remove_dir_entry(&mut self, index: usize) {
        // Unlink: the removed entry is referenced either by its elder
        // sibling (which, tail of a consecutive-children run, sits right
        // before it) or by its parent's first-child link.
        let removed_sibling = self.dirs[index].raw.sibling_dir;
        let parent = self.dirs[index].raw.parent_dir as usize;
        if self.dirs[index - 1].raw.sibling_dir == index as i32 {
            self.dirs[index - 1].raw.sibling_dir = removed_sibling;
        } else if self.dirs[parent].raw.child_dir == index as i32 {
            self.dirs[parent].raw.child_dir = removed_sibling;
        }

        for dir in &mut self.dirs {
            dir.raw.parent_dir = shift_removed_index(dir.raw.parent_dir, index);
            dir.raw.sibling_dir = shift_removed_index(dir.raw.sibling_dir, index);
            dir.raw.child_dir = shift_removed_index(dir.raw.child_dir, index);
        }
        for file in &mut self.files {
            file.raw.parent_dir = shift_removed_index(file.raw.parent_dir, index);
        }
        self.dirs.remove(index);
    }

    /// Assigns every entry to a hash bucket keyed on (parent entry
    /// offset, name). Buckets hold the last entry inserted; earlier
    /// entries are threaded through the `prev` links.
    fn build_hash_tables(&mut self) {
        self.dir_buckets =
            vec![INVALID_OFFSET; hash::bucket_count(self.dirs.len() as u32) as usize];
        self.file_buckets =
            vec![INVALID_OFFSET; hash::bucket_count(self.files.len() as u32) as usize];

        for index in 0..self.dirs.len() {
            let parent = self.dirs[index].raw.parent_dir as usize;
            let parent_ofs = self.dirs[parent].entry_ofs;
            self.dirs[index].bucket_index = (hash::entry_hash(parent_ofs, &self.dirs[index].name)
                % self.dir_buckets.len() as u32) as usize;
            let bucket = self.dirs[index].bucket_index;
            if self.dir_buckets[bucket] != INVALID_OFFSET {
                self.dirs[index].raw.prev_dir = self.dir_buckets[bucket];
            }
            self.dir_buckets[bucket] = index as i32;
        }

        for index in 0..self.files.len() {
            let parent = self.files[index].raw.parent_dir as usize;
            let parent_ofs = self.dirs[parent].entry_ofs;
            self.files[index].bucket_index = (hash::entry_hash(parent_ofs, &self.files[index].name)
                % self.file_buckets.len() as u32) as usize;
            let bucket = self.files[index].bucket_index;
            if self.file_buckets[bucket] != INVALID_OFFSET {
                self.files[index].raw.prev_file = self.file_buckets[bucket];
            }
            self.file_buckets[bucket] = index as i32;
        }
    }

    /// Rewrites every list index (buckets and link fields) into a byte
    /// offset within the entry's table.
    fn link_offsets(&mut self) {
        let dir_ofs: Vec<i32> = self.dirs.iter().map(|dir| dir.entry_ofs).collect();
        let file_ofs: Vec<i32> = self.files.iter().map(|file| file.entry_ofs).collect();

        for bucket in &mut self.dir_buckets {
            *bucket = redirect(*bucket, &dir_ofs);
        }
        for bucket in &mut self.file_buckets {
            *bucket = redirect(*bucket, &file_ofs);
        }
        for dir in &mut self.dirs {
            dir.raw.parent_dir = redirect(dir.raw.parent_dir, &dir_ofs);
            dir.raw.sibling_dir = redirect(dir.raw.sibling_dir, &dir_ofs);
            dir.raw.child_dir = redirect(dir.raw.child_dir, &dir_ofs);
            dir.raw.child_file = redirect(dir.raw.child_file, &file_ofs);
            dir.raw.prev_dir = redirect(dir.raw.prev_dir, &dir_ofs);
        }
        for file in &mut self.files {
            file.raw.parent_dir = redirect(file.raw.parent_dir, &dir_ofs);
            file.raw.sibling_file = redirect(file.raw.sibling_file, &file_ofs);
            file.raw.prev_file = redirect(file.raw.prev_file, &file_ofs);
        }
    }

    fn finalize_header(&mut self) -> CtrfsResult<()> {
        let dir_hash_size =
            u32::try_from(self.dir_buckets.len() * 4).map_err(|_| CtrfsError::OffsetOverflow)?;
        let file_hash_size =
            u32::try_from(self.file_buckets.len() * 4).map_err(|_| CtrfsError::OffsetOverflow)?;

        // no references into the packed header, reads and writes only
        self.header.sections[SECTION_DIR_HASH].size = dir_hash_size;
        self.header.sections[SECTION_DIR_TABLE].offset = checked_align(
            checked_add(self.header.sections[SECTION_DIR_HASH].offset, dir_hash_size)?,
            NAME_ALIGN,
        )?;
        self.header.sections[SECTION_FILE_HASH].offset = checked_align(
            checked_add(
                self.header.sections[SECTION_DIR_TABLE].offset,
                self.header.sections[SECTION_DIR_TABLE].size,
            )?,
            NAME_ALIGN,
        )?;
        self.header.sections[SECTION_FILE_HASH].size = file_hash_size;
        self.header.sections[SECTION_FILE_TABLE].offset = checked_align(
            checked_add(self.header.sections[SECTION_FILE_HASH].offset, file_hash_size)?,
            NAME_ALIGN,
        )?;
        self.header.data_offset = checked_align(
            checked_add(
                self.header.sections[SECTION_FILE_TABLE].offset,
                self.header.sections[SECTION_FILE_TABLE].size,
            )?,
            FILE_DATA_ALIGN as u32,
        )?;
        Ok(())

    }

    /// Serializes header and tables into the metadata blob and derives
    /// the offset map. Consumes the builder.
    fn emit(self) -> Level3 {
        let Level3Builder {
            header,
            dirs,
            files,
            dir_buckets,
            file_buckets,
            data_size,
            warnings,
            ..
        } = self;

        let data_offset = header.data_offset;
        let mut blob = Vec::with_capacity(data_offset as usize);
        blob.extend_from_slice(header.as_bytes());

        for bucket in &dir_buckets {
            blob.extend_from_slice(&bucket.to_le_bytes());
        }
        for dir in &dirs {
            debug_assert_eq!(dir.raw.name_size as u32, dir.name.byte_len());
            blob.extend_from_slice(dir.raw.as_bytes());
            dir.name.write_padded(&mut blob);
        }
        for bucket in &file_buckets {
            blob.extend_from_slice(&bucket.to_le_bytes());
        }

        let mut file_map = BTreeMap::new();
        for file in files {
            debug_assert_eq!(file.raw.name_size as u32, file.name.byte_len());
            blob.extend_from_slice(file.raw.as_bytes());
            file.name.write_padded(&mut blob);
            if file.raw.file_size > 0 {
                file_map.insert(
                    u64::from(data_offset) + file.raw.data_ofs as u64,
                    file.host_path,
                );
            }
        }
        blob.resize(data_offset as usize, 0);

        let image_size = align_up64(data_size + i64::from(data_offset), BLOCK_SIZE as i64) as u64;
        Level3 {
            blob,
            data_offset,
            image_size,
            file_map,
            warnings,
        }
    }
}

fn shift_removed_index(link: i32, removed: usize) -> i32 {
    if link > removed as i32 {
        link - 1
    } else {
        link
    }
}

fn redirect(link: i32, entry_offsets: &[i32]) -> i32 {
    if link == INVALID_OFFSET {
        link
    } else {
        entry_offsets[link as usize]
    }
}

fn checked_add(a: u32, b: u32) -> CtrfsResult<u32> {
    a.checked_add(b).ok_or(CtrfsError::OffsetOverflow)
}

fn checked_align(val: u32, alignment: u32) -> CtrfsResult<u32> {
    if val % alignment == 0 {
        Ok(val)
    } else {
        val.checked_add(alignment - val % alignment)
            .ok_or(CtrfsError::OffsetOverflow)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn rd_u32(blob: &[u8], ofs: usize) -> u32 {
        u32::from_le_bytes(blob[ofs..ofs + 4].try_into().unwrap())
    }
    fn rd_i32(blob: &[u8], ofs: usize) -> i32 {
        i32::from_le_bytes(blob[ofs..ofs + 4].try_into().unwrap())
    }
    fn rd_i64(blob: &[u8], ofs: usize) -> i64 {
        i64::from_le_bytes(blob[ofs..ofs + 8].try_into().unwrap())
    }
    fn align4(val: usize) -> usize {
        (val + 3) & !3
    }

    struct ParsedDir {
        parent: i32,
        sibling: i32,
        child_dir: i32,
        child_file: i32,
        prev: i32,
        name: String,
    }

    struct ParsedFile {
        parent: i32,
        sibling: i32,
        data_ofs: i64,
        file_size: i64,
        prev: i32,
        name: String,
    }

    struct ParsedImage {
        dir_hash: (usize, usize),
        dir_table: (usize, usize),
        file_hash: (usize, usize),
        file_table: (usize, usize),
        data_offset: usize,
        dir_buckets: Vec<i32>,
        file_buckets: Vec<i32>,
        dirs: HashMap<i32, ParsedDir>,
        files: HashMap<i32, ParsedFile>,
    }

    fn utf16_name(bytes: &[u8]) -> String {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).unwrap()
    }

    /// Test-local decoder for the emitted blob; the crate itself never
    /// parses metadata back.
    fn parse(blob: &[u8]) -> ParsedImage {
        assert_eq!(rd_u32(blob, 0), 0x28);
        let section =
            |index: usize| (rd_u32(blob, 4 + index * 8) as usize, rd_u32(blob, 8 + index * 8) as usize);
        let dir_hash = section(0);
        let dir_table = section(1);
        let file_hash = section(2);
        let file_table = section(3);
        let data_offset = rd_u32(blob, 36) as usize;

        let buckets = |(offset, size): (usize, usize)| {
            (0..size / 4)
                .map(|index| rd_i32(blob, offset + index * 4))
                .collect::<Vec<_>>()
        };
        let dir_buckets = buckets(dir_hash);
        let file_buckets = buckets(file_hash);

        let mut dirs = HashMap::new();
        let mut ofs = 0;
        while ofs < dir_table.1 {
            let base = dir_table.0 + ofs;
            let name_size = rd_i32(blob, base + 20) as usize;
            dirs.insert(
                ofs as i32,
                ParsedDir {
                    parent: rd_i32(blob, base),
                    sibling: rd_i32(blob, base + 4),
                    child_dir: rd_i32(blob, base + 8),
                    child_file: rd_i32(blob, base + 12),
                    prev: rd_i32(blob, base + 16),
                    name: utf16_name(&blob[base + 24..base + 24 + name_size]),
                },
            );
            ofs += 24 + align4(name_size);
        }

        let mut files = HashMap::new();
        let mut ofs = 0;
        while ofs < file_table.1 {
            let base = file_table.0 + ofs;
            let name_size = rd_i32(blob, base + 28) as usize;
            files.insert(
                ofs as i32,
                ParsedFile {
                    parent: rd_i32(blob, base),
                    sibling: rd_i32(blob, base + 4),
                    data_ofs: rd_i64(blob, base + 8),
                    file_size: rd_i64(blob, base + 16),
                    prev: rd_i32(blob, base + 24),
                    name: utf16_name(&blob[base + 32..base + 32 + name_size]),
                },
            );
            ofs += 32 + align4(name_size);
        }

        ParsedImage {
            dir_hash,
            dir_table,
            file_hash,
            file_table,
            data_offset,
            dir_buckets,
            file_buckets,
            dirs,
            files,
        }
    }

    fn walk_dir(image: &ParsedImage, dir_ofs: i32, prefix: &str, out: &mut Vec<(String, i64)>) {
        let dir = &image.dirs[&dir_ofs];
        let mut file_ofs = dir.child_file;
        while file_ofs != INVALID_OFFSET {
            let file = &image.files[&file_ofs];
            assert_eq!(file.parent, dir_ofs);
            out.push((format!("{prefix}{}", file.name), file.file_size));
            file_ofs = file.sibling;
        }
        let mut child_ofs = dir.child_dir;
        while child_ofs != INVALID_OFFSET {
            let child = &image.dirs[&child_ofs];
            assert_eq!(child.parent, dir_ofs);
            walk_dir(image, child_ofs, &format!("{prefix}{}/", child.name), out);
            child_ofs = child.sibling;
        }
    }

    /// Follows every bucket chain and checks that each visited entry
    /// hashes into the bucket it was found in, and that the chains
    /// cover each table exactly once.
    fn validate_hash_chains(image: &ParsedImage) {
        let bucket_count = image.dir_buckets.len() as u32;
        let mut visited = 0;
        for (bucket_index, &head) in image.dir_buckets.iter().enumerate() {
            let mut cursor = head;
            while cursor != INVALID_OFFSET {
                let dir = &image.dirs[&cursor];
                let hashed =
                    hash::entry_hash(dir.parent, &RomfsName::from(dir.name.as_str())) % bucket_count;
                assert_eq!(hashed as usize, bucket_index);
                cursor = dir.prev;
                visited += 1;
                assert!(visited <= image.dirs.len());
            }
        }
        assert_eq!(visited, image.dirs.len());

        let bucket_count = image.file_buckets.len() as u32;
        let mut visited = 0;
        for (bucket_index, &head) in image.file_buckets.iter().enumerate() {
            let mut cursor = head;
            while cursor != INVALID_OFFSET {
                let file = &image.files[&cursor];
                let hashed =
                    hash::entry_hash(file.parent, &RomfsName::from(file.name.as_str())) % bucket_count;
                assert_eq!(hashed as usize, bucket_index);
                cursor = file.prev;
                visited += 1;
                assert!(visited <= image.files.len());
            }
        }
        assert_eq!(visited, image.files.len());
    }

    #[test]
    fn single_file_image_layout() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("a.bin"), b"ABC").unwrap();

        let level3 = Level3::build(root.path()).unwrap();
        assert!(level3.warnings().is_empty());

        let image = parse(level3.blob());
        assert_eq!(image.dir_hash, (0x28, 12));
        assert_eq!(image.dir_table, (52, 24));
        assert_eq!(image.file_hash, (76, 12));
        assert_eq!(image.file_table, (88, 44));
        assert_eq!(image.data_offset, 144);
        assert_eq!(level3.blob().len(), 144);
        assert_eq!(level3.data_offset(), 144);
        assert_eq!(level3.image_size(), BLOCK_SIZE as u64);

        let root_entry = &image.dirs[&0];
        assert_eq!(root_entry.parent, 0);
        assert_eq!(root_entry.sibling, INVALID_OFFSET);
        assert_eq!(root_entry.child_dir, INVALID_OFFSET);
        assert_eq!(root_entry.child_file, 0);
        assert_eq!(root_entry.prev, INVALID_OFFSET);
        assert_eq!(root_entry.name, "");

        let file = &image.files[&0];
        assert_eq!(file.parent, 0);
        assert_eq!(file.sibling, INVALID_OFFSET);
        assert_eq!(file.data_ofs, 0);
        assert_eq!(file.file_size, 3);
        assert_eq!(file.name, "a.bin");

        // hash(0, "") and hash(0, "a.bin") both land in bucket 0
        assert_eq!(image.dir_buckets, vec![0, INVALID_OFFSET, INVALID_OFFSET]);
        assert_eq!(image.file_buckets, vec![0, INVALID_OFFSET, INVALID_OFFSET]);

        let mapped: Vec<_> = level3.file_map().collect();
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].0, 144);
    }

    #[test]
    fn empty_root_builds_minimal_image() {
        let root = tempdir().unwrap();

        let level3 = Level3::build(root.path()).unwrap();
        assert!(level3.warnings().is_empty());

        let image = parse(level3.blob());
        assert_eq!(image.dir_table.1, 24);
        assert_eq!(image.file_table.1, 0);
        assert_eq!(image.dir_buckets.len(), 3);
        assert_eq!(image.file_buckets.len(), 3);
        assert_eq!(image.data_offset, 96);
        assert_eq!(level3.blob().len(), 96);
        assert_eq!(level3.image_size(), BLOCK_SIZE as u64);
        assert_eq!(level3.file_map().count(), 0);
    }

    #[test]
    fn empty_dirs_are_pruned() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("empty_dir")).unwrap();
        fs::write(root.path().join("b.bin"), [0u8; 16]).unwrap();

        let level3 = Level3::build(root.path()).unwrap();
        let image = parse(level3.blob());

        assert_eq!(image.dirs.len(), 1);
        let root_entry = &image.dirs[&0];
        assert_eq!(root_entry.child_dir, INVALID_OFFSET);
        assert_eq!(root_entry.child_file, 0);
        assert_eq!(image.files[&0].file_size, 16);
    }

    #[test]
    fn nested_empty_dirs_prune_recursively() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("hollow/deeper/deepest")).unwrap();
        fs::create_dir(root.path().join("keep")).unwrap();
        fs::write(root.path().join("keep/k.bin"), b"data").unwrap();

        let level3 = Level3::build(root.path()).unwrap();
        let image = parse(level3.blob());

        assert_eq!(image.dirs.len(), 2);
        let root_entry = &image.dirs[&0];
        assert_ne!(root_entry.child_dir, INVALID_OFFSET);
        let keep = &image.dirs[&root_entry.child_dir];
        assert_eq!(keep.name, "keep");
        assert_eq!(keep.sibling, INVALID_OFFSET);
        assert_ne!(keep.child_file, INVALID_OFFSET);
        assert_eq!(image.files[&keep.child_file].name, "k.bin");
    }

    #[test]
    fn sibling_files_chain_in_discovery_order() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("f1"), [1u8; 5]).unwrap();
        fs::write(root.path().join("f2"), [2u8; 11]).unwrap();

        let level3 = Level3::build(root.path()).unwrap();
        let image = parse(level3.blob());

        assert_eq!(image.files.len(), 2);
        for file in image.files.values() {
            match file.name.as_str() {
                "f1" => assert_eq!(file.file_size, 5),
                "f2" => assert_eq!(file.file_size, 11),
                other => panic!("unexpected entry {other:?}"),
            }
        }

        // data offsets follow discovery order, second file aligned up
        let first = &image.files[&image.dirs[&0].child_file];
        assert_eq!(first.data_ofs, 0);
        assert_ne!(first.sibling, INVALID_OFFSET);
        let second = &image.files[&first.sibling];
        assert_eq!(second.data_ofs, 16);
        assert_eq!(second.sibling, INVALID_OFFSET);

        let keys: Vec<u64> = level3.file_map().map(|(ofs, _)| ofs).collect();
        let base = u64::from(level3.data_offset());
        assert_eq!(keys, vec![base, base + 16]);
    }

    #[test]
    fn zero_size_file_is_not_mapped() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("empty.bin"), b"").unwrap();

        let level3 = Level3::build(root.path()).unwrap();
        let image = parse(level3.blob());

        let file = &image.files[&0];
        assert_eq!(file.data_ofs, 0);
        assert_eq!(file.file_size, 0);
        assert_eq!(level3.file_map().count(), 0);
    }

    #[test]
    fn colliding_names_chain_through_prev() {
        let root = tempdir().unwrap();
        // hash(0, "a") == hash(0, "d") mod 3
        fs::write(root.path().join("a"), b"x").unwrap();
        fs::write(root.path().join("d"), b"y").unwrap();

        let level3 = Level3::build(root.path()).unwrap();
        let image = parse(level3.blob());

        assert_eq!(image.file_buckets.len(), 3);
        assert_eq!(image.file_buckets[0], INVALID_OFFSET);
        assert_eq!(image.file_buckets[2], INVALID_OFFSET);

        let head_ofs = image.file_buckets[1];
        assert_ne!(head_ofs, INVALID_OFFSET);
        let head = &image.files[&head_ofs];
        let earlier_ofs = if head_ofs == 0 { 36 } else { 0 };
        assert_eq!(head.prev, earlier_ofs);
        assert_eq!(image.files[&earlier_ofs].prev, INVALID_OFFSET);

        validate_hash_chains(&image);
    }

    #[test]
    fn unreadable_root_degrades_to_empty_image() {
        let root = tempdir().unwrap();
        let level3 = Level3::build(root.path().join("does-not-exist")).unwrap();

        assert!(level3.warnings().contains(BuildWarnings::DIR_SCAN_FAILED));
        assert_eq!(level3.blob().len(), 96);
        assert_eq!(level3.file_map().count(), 0);
    }

    #[test]
    fn round_trip_recovers_tree_structure() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("top.bin"), [7u8; 7]).unwrap();
        fs::create_dir_all(root.path().join("sub/nested")).unwrap();
        fs::write(root.path().join("sub/inner.txt"), [1u8; 40]).unwrap();
        fs::write(root.path().join("sub/nested/deep.dat"), b"abc").unwrap();
        fs::write(root.path().join("café"), b"latte").unwrap();

        let level3 = Level3::build(root.path()).unwrap();
        assert!(level3.warnings().is_empty());
        let image = parse(level3.blob());

        let mut found = Vec::new();
        walk_dir(&image, 0, "", &mut found);
        found.sort();
        let expected = vec![
            ("café".to_owned(), 5),
            ("sub/inner.txt".to_owned(), 40),
            ("sub/nested/deep.dat".to_owned(), 3),
            ("top.bin".to_owned(), 7),
        ];
        assert_eq!(found, expected);

        validate_hash_chains(&image);

        // every mapped offset points at the file that owns those bytes
        for (offset, path) in level3.file_map() {
            assert!(offset >= u64::from(level3.data_offset()));
            assert!(path.exists());
        }
    }

    #[test]
    fn entry_offsets_stay_inside_their_sections() {
        let root = tempdir().unwrap();
        for index in 0..25 {
            fs::write(root.path().join(format!("file-{index:02}")), [0u8; 1]).unwrap();
        }
        fs::create_dir(root.path().join("dir")).unwrap();
        fs::write(root.path().join("dir/one"), b"1").unwrap();

        let level3 = Level3::build(root.path()).unwrap();
        let image = parse(level3.blob());

        // 26 files forces the large-table bucket policy
        assert_eq!(image.files.len(), 26);
        assert_eq!(image.file_buckets.len(), 29);

        for (&ofs, file) in &image.files {
            let end = ofs as usize + 32 + align4(file.name.len() * 2);
            assert!(end <= image.file_table.1);
        }
        for (&ofs, dir) in &image.dirs {
            let end = ofs as usize + 24 + align4(dir.name.len() * 2);
            assert!(end <= image.dir_table.1);
        }
        validate_hash_chains(&image);
    }
}
