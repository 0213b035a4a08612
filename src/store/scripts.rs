//! Lua sources for the atomic limiter operations.
//!
//! Redis runs a script to completion before serving any other command, so
//! each script is one atomic read-decide-write.

/// `KEYS[1]` counter key. `ARGV[1]` expiry in seconds.
///
/// Returns the post-increment count.
pub const FIXED_WINDOW: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
end
return count
"#;

/// `KEYS[1]` sorted set. `ARGV[1]` now (micros), `ARGV[2]` window start
/// (micros), `ARGV[3]` limit, `ARGV[4]` expiry in seconds, `ARGV[5]` member.
///
/// Returns `{count_before_insert, inserted}`.
pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

-- Scores are passed through as strings: Lua numbers reach Redis via %.14g.
redis.call('ZREMRANGEBYSCORE', key, '-inf', ARGV[2])
local count = redis.call('ZCARD', key)

if count < limit then
    redis.call('ZADD', key, ARGV[1], ARGV[5])
    redis.call('EXPIRE', key, ttl)
    return {count, 1}
end

return {count, 0}
"#;

/// `KEYS[1]` tokens, `KEYS[2]` last refill. `ARGV[1]` capacity, `ARGV[2]`
/// refill rate per second, `ARGV[3]` now (micros), `ARGV[4]` expiry in seconds.
///
/// Returns `{allowed, tostring(tokens)}`; the token count goes back as a
/// string because Redis truncates Lua numbers to integers in replies. The
/// timestamp is stored from `ARGV[3]` verbatim: `tostring` would round a
/// 16-digit microsecond value.
pub const TOKEN_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local tokens = tonumber(redis.call('GET', KEYS[1]))
local last_refill = tonumber(redis.call('GET', KEYS[2]))
if tokens == nil then tokens = capacity end
if last_refill == nil then last_refill = now end

local elapsed = (now - last_refill) / 1000000.0
if elapsed < 0 then elapsed = 0 end
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= 1.0 then
    tokens = tokens - 1.0
    allowed = 1
end

redis.call('SET', KEYS[1], tostring(tokens), 'EX', ttl)
redis.call('SET', KEYS[2], ARGV[3], 'EX', ttl)

return {allowed, tostring(tokens)}
"#;
