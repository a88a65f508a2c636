//! Sharder implementations.
//!
//! A sharder maps an arbitrary string onto one of `total_shards` buckets. Assignment uses 100
//! shards, so a bucket can be compared directly with percentages.

/// Number of buckets used for traffic allocation, variant splits and rollouts.
pub const TOTAL_BUCKETS: u64 = 100;

/// Deterministic string hash reduced to a shard.
pub trait Sharder {
    /// Map `input` to a shard in `0..total_shards`. Must return the same shard for the same input.
    fn get_shard(&self, input: &str, total_shards: u64) -> u64;
}

/// The default sharder. A 32-bit rolling hash (`h * 31 + unit`, wrapping) over the UTF-16 code
/// units of the input, reduced after taking its absolute value.
///
/// Kept compatible with assignments made by the storefront before it moved to this crate, so
/// persisted buckets don't reshuffle.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingHashSharder;

impl RollingHashSharder {
    fn hash(input: &str) -> i32 {
        input.encode_utf16().fold(0i32, |hash, unit| {
            hash.wrapping_shl(5)
                .wrapping_sub(hash)
                .wrapping_add(i32::from(unit))
        })
    }
}

impl Sharder for RollingHashSharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        u64::from(Self::hash(input).unsigned_abs()) % total_shards
    }
}

/// Sharder based on the first four bytes of the input's MD5 digest.
///
/// Distributes similar inputs better than [`RollingHashSharder`], but buckets are not compatible
/// with it. Switching sharders only affects users that have no persisted assignment yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        let hash = md5::compute(input);
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        u64::from(value) % total_shards
    }
}

/// Bucket `user_id` for the given `seed` into `0..100`.
///
/// The seed is appended to the user id without a separator.
pub fn bucket(sharder: &(impl Sharder + ?Sized), user_id: &str, seed: &str) -> u64 {
    let mut input = String::with_capacity(user_id.len() + seed.len());
    input.push_str(user_id);
    input.push_str(seed);
    sharder.get_shard(&input, TOTAL_BUCKETS)
}

#[cfg(test)]
pub(crate) struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        self.0.get(input).copied().unwrap_or(0) % total_shards
    }
}
