//! Lua scripts for atomic saga writes.
//!
//! The scripts report rejections as status replies instead of raising
//! errors, so that a rejected write inside `MULTI`/`EXEC` can be matched to
//! its operation. A rejected script performs no write.
//!
//! Old index entries are read from the stored `idx` list inside the script,
//! so the scripts assume a single Redis node.

/// Creates a record and its index entries.
///
/// KEYS[1] record, KEYS[2..] index hashes.
/// ARGV[1] data, ARGV[2] index list, ARGV[3..] index fields.
/// Returns 1 on success, 0 when the record exists.
pub(crate) const INSERT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'rev', 1, 'dat', ARGV[1], 'idx', ARGV[2])
for i = 2, #KEYS do
    redis.call('HSET', KEYS[i], ARGV[i + 1], KEYS[1])
end
return 1
"#;

/// Replaces a record at the expected revision and moves its index entries.
///
/// KEYS[1] record, KEYS[2..] index hashes.
/// ARGV[1] proposed revision, ARGV[2] data, ARGV[3] index list,
/// ARGV[4..] index fields.
/// Returns {1, proposed} on success, {0, stored} on a revision mismatch and
/// {-1, 0} when the record is gone.
pub(crate) const UPDATE: &str = r#"
local stored = redis.call('HGET', KEYS[1], 'rev')
if not stored then
    return {-1, 0}
end
stored = tonumber(stored)
local proposed = tonumber(ARGV[1])
if stored + 1 ~= proposed then
    return {0, stored}
end
local keep = {}
for i = 2, #KEYS do
    keep[KEYS[i] .. '\n' .. ARGV[i + 2]] = true
end
local previous = redis.call('HGET', KEYS[1], 'idx')
if previous then
    for _, entry in ipairs(cjson.decode(previous)) do
        if not keep[entry.key .. '\n' .. entry.hashField]
            and redis.call('HGET', entry.key, entry.hashField) == KEYS[1] then
            redis.call('HDEL', entry.key, entry.hashField)
        end
    end
end
redis.call('HSET', KEYS[1], 'rev', ARGV[1], 'dat', ARGV[2], 'idx', ARGV[3])
for i = 2, #KEYS do
    redis.call('HSET', KEYS[i], ARGV[i + 2], KEYS[1])
end
return {1, proposed}
"#;

/// Removes a record and every index entry that still points at it.
///
/// KEYS[1] record. Returns the number of deleted keys.
pub(crate) const DELETE: &str = r#"
local stored = redis.call('HGET', KEYS[1], 'idx')
if stored then
    for _, entry in ipairs(cjson.decode(stored)) do
        if redis.call('HGET', entry.key, entry.hashField) == KEYS[1] then
            redis.call('HDEL', entry.key, entry.hashField)
        end
    end
end
return redis.call('DEL', KEYS[1])
"#;
