//! Lua sources for the distributed limiters.
//!
//! All numeric arguments are rendered to strings on the client so that
//! microsecond scores survive without float formatting in Lua.

use super::store::StoreScript;

/// Leaky bucket over a hash.
///
/// `KEYS[1]` bucket key, `ARGV` = volume, rate, requested units, now (unix
/// seconds). Returns 1 on accept, 0 on overflow.
pub const LEAKY_BUCKET: StoreScript = StoreScript::new(
    "leaky_bucket",
    r#"
local key          = KEYS[1]
local volume       = tonumber(ARGV[1])
local rate         = tonumber(ARGV[2])
local requested    = tonumber(ARGV[3])
local current_time = tonumber(ARGV[4])

local ttl = math.floor((volume / rate) * 2)
if ttl < 60 then
    ttl = 60
end

if redis.call('EXISTS', key) == 0 then
    redis.call('HSET', key, 'last_time', current_time, 'count', 0)
end

local last_time = tonumber(redis.call('HGET', key, 'last_time'))
local count     = tonumber(redis.call('HGET', key, 'count'))
local remain    = count + requested - (current_time - last_time) * rate
if remain <= 0 then
    remain = 0
end

redis.call('HSET', key, 'volume', ARGV[1], 'rate', ARGV[2], 'last_time', ARGV[4])
redis.call('EXPIRE', key, ttl)

if remain > volume then
    redis.call('HSET', key, 'count', ARGV[1])
    return 0
end

redis.call('HSET', key, 'count', remain)
return 1
"#,
);

/// Exact sliding log over a sorted set.
///
/// `KEYS[1]` log key, `ARGV` = left, right, now (microseconds), limit,
/// requested units, member. Every unit is scored `now`; the first is named
/// `member` and further units of a weighted call `member:<i>`.
pub const SLIDING_LOG: StoreScript = StoreScript::new(
    "sliding_log",
    r#"
local key       = KEYS[1]
local left      = ARGV[1]
local right     = ARGV[2]
local now       = ARGV[3]
local limit     = tonumber(ARGV[4])
local requested = tonumber(ARGV[5])
local member    = ARGV[6]

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. left)

if redis.call('ZCOUNT', key, left, right) >= limit then
    return 0
end

redis.call('ZADD', key, now, member)
for i = 1, requested - 1 do
    redis.call('ZADD', key, now, member .. ':' .. i)
end
return 1
"#,
);

/// Sliding window over a sorted set.
///
/// `KEYS[1]` window key, `ARGV` = boundary, now (microseconds), limit,
/// member.
/// Counts before inserting and trims stale members only on accept.
pub const SLIDING_WINDOW: StoreScript = StoreScript::new(
    "sliding_window",
    r#"
local key      = KEYS[1]
local boundary = ARGV[1]
local now      = ARGV[2]
local limit    = tonumber(ARGV[3])
local member   = ARGV[4]

if redis.call('ZCOUNT', key, boundary, now) >= limit then
    return 0
end

redis.call('ZADD', key, now, member)
redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. boundary)
return 1
"#,
);
