use crate::string::RomfsName;

/// Number of hash buckets for a table of `entries` entries. Small tables
/// get a fixed or odd count; larger ones grow until coprime with the
/// first seven primes. Format-defined, shared by every RomFS packer.
pub(crate) fn bucket_count(entries: u32) -> u32 {
    let mut bucket = entries;
    if bucket < 3 {
        bucket = 3;
    } else if bucket <= 19 {
        bucket |= 1;
    } else {
        while [2, 3, 5, 7, 11, 13, 17].iter().any(|p| bucket % p == 0) {
            bucket += 1;
        }
    }
    bucket
}

/// Format-defined entry hash: seed with the parent directory's byte
/// offset in the directory table, then fold in each UTF-16 code unit with
/// a rotate-right by 5. 32-bit unsigned arithmetic throughout.
pub(crate) fn entry_hash(parent_ofs: i32, name: &RomfsName) -> u32 {
    let mut hash = parent_ofs as u32 ^ 123456789;
    for &unit in name.code_units() {
        hash = hash.rotate_right(5) ^ u32::from(unit);
    }
    hash
}
