//! Every Lua script backing an atomic [`jobforge::Kv`] operation.
//!
//! `redis::Script::new` only hashes the source lazily on first `EVALSHA`
//! miss, so building a fresh `Script` per call is cheap; none of these are
//! hot enough to justify caching the `Script` value itself.

use redis::Script;

pub fn enqueue() -> Script {
    Script::new(
        r#"
        local has_dedup = ARGV[2]
        if has_dedup == '1' then
            if redis.call('EXISTS', KEYS[1]) == 1 then
                return 0
            end
            redis.call('SET', KEYS[1], ARGV[1])
        end
        redis.call('HSET', KEYS[2], unpack(ARGV, 6))
        local member = ARGV[1]
        if ARGV[5] == '1' then
            member = string.format('%020d', tonumber(ARGV[1]))
        end
        redis.call('ZADD', KEYS[3], ARGV[4], member)
        return 1
        "#,
    )
}

pub fn promote_due() -> Script {
    Script::new(
        r#"
        local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        local moved = {}
        for _, id in ipairs(ids) do
            local jobkey = KEYS[3] .. id
            local pc = tonumber(redis.call('HGET', jobkey, 'priority_class'))
            local created = tonumber(redis.call('HGET', jobkey, 'created_at_ms'))
            if pc then
                redis.call('ZREM', KEYS[1], id)
                local score = pc * 1e13 + created
                local member = string.format('%020d', tonumber(id))
                redis.call('ZADD', KEYS[2], score, member)
                redis.call('HSET', jobkey, 'state', 'waiting')
                table.insert(moved, id)
            end
        end
        return moved
        "#,
    )
}

pub fn pop_and_lease() -> Script {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == '1' then
            return {'EMPTY'}
        end

        local token_taken = false
        local max = redis.call('HGET', KEYS[2], 'max')
        if max then
            max = tonumber(max)
            local window_ms = tonumber(redis.call('HGET', KEYS[2], 'window_ms'))
            local now = tonumber(ARGV[1])
            local reset_at = tonumber(redis.call('GET', KEYS[4]))
            local tokens = tonumber(redis.call('GET', KEYS[3]))
            if not reset_at or now >= reset_at then
                tokens = max
                reset_at = now + window_ms
                redis.call('SET', KEYS[4], reset_at)
            end
            if not tokens then
                tokens = max
            end
            if tokens <= 0 then
                return {'THROTTLED', tostring(reset_at - now)}
            end
            redis.call('SET', KEYS[3], tokens - 1)
            token_taken = true
        end

        local popped = redis.call('ZPOPMIN', KEYS[5], 1)
        if #popped == 0 then
            if token_taken then
                local refund = tonumber(redis.call('GET', KEYS[3]))
                redis.call('SET', KEYS[3], refund + 1)
            end
            return {'EMPTY'}
        end

        local id = tostring(tonumber(popped[1]))
        local jobkey = KEYS[7] .. id
        local timeout = tonumber(redis.call('HGET', jobkey, 'timeout_ms'))
        local lease_until = tonumber(ARGV[1]) + timeout + tonumber(ARGV[2])
        redis.call('ZADD', KEYS[6], lease_until, id)
        redis.call('HSET', jobkey, 'state', 'active', 'lease_until_ms', lease_until)

        local first_attempted = redis.call('HGET', jobkey, 'first_attempted_at_ms')
        if not first_attempted or first_attempted == '' then
            redis.call('HSET', jobkey, 'first_attempted_at_ms', ARGV[1])
        end
        local attempts_made = tonumber(redis.call('HGET', jobkey, 'attempts_made'))
        redis.call('HSET', jobkey, 'attempts_made', attempts_made + 1)

        local fields = redis.call('HGETALL', jobkey)
        local result = {'LEASED'}
        for _, v in ipairs(fields) do
            table.insert(result, v)
        end
        return result
        "#,
    )
}

pub fn renew_lease() -> Script {
    Script::new(
        r#"
        if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
            redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
            redis.call('HSET', KEYS[2], 'lease_until_ms', ARGV[2])
            return 1
        end
        return 0
        "#,
    )
}

pub fn complete() -> Script {
    Script::new(
        r#"
        redis.call('ZREM', KEYS[1], ARGV[1])
        local retain = redis.call('HGET', KEYS[3], 'retain_on_completion')
        if retain == '0' then
            redis.call('DEL', KEYS[3])
            return redis.status_reply('OK')
        end
        redis.call('HSET', KEYS[3], 'state', 'completed', 'finished_at_ms', ARGV[2], 'result_b64', ARGV[3])
        redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
        local keep = tonumber(redis.call('HGET', KEYS[5], 'completed')) or 0
        if keep > 0 then
            local count = redis.call('ZCARD', KEYS[2])
            if count > keep then
                local victims = redis.call('ZRANGE', KEYS[2], 0, count - keep - 1)
                for _, vid in ipairs(victims) do
                    redis.call('ZREM', KEYS[2], vid)
                    redis.call('DEL', KEYS[4] .. vid)
                end
            end
        end
        return redis.status_reply('OK')
        "#,
    )
}

pub fn fail_retry() -> Script {
    Script::new(
        r#"
        redis.call('ZREM', KEYS[1], ARGV[1])
        redis.call('HSET', KEYS[3], 'state', 'delayed', 'available_at_ms', ARGV[3], 'last_error', ARGV[4])
        redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
        return redis.status_reply('OK')
        "#,
    )
}

pub fn fail_terminal() -> Script {
    Script::new(
        r#"
        redis.call('ZREM', KEYS[1], ARGV[1])
        local retain = redis.call('HGET', KEYS[3], 'retain_on_failure')
        if retain == '0' then
            redis.call('DEL', KEYS[3])
            return redis.status_reply('OK')
        end
        redis.call('HSET', KEYS[3], 'state', 'failed', 'finished_at_ms', ARGV[2], 'last_error', ARGV[3])
        redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
        local keep = tonumber(redis.call('HGET', KEYS[5], 'failed')) or 0
        if keep > 0 then
            local count = redis.call('ZCARD', KEYS[2])
            if count > keep then
                local victims = redis.call('ZRANGE', KEYS[2], 0, count - keep - 1)
                for _, vid in ipairs(victims) do
                    redis.call('ZREM', KEYS[2], vid)
                    redis.call('DEL', KEYS[4] .. vid)
                end
            end
        end
        return redis.status_reply('OK')
        "#,
    )
}

pub fn take_token() -> Script {
    Script::new(
        r#"
        local max = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local now = tonumber(ARGV[3])
        local reset_at = tonumber(redis.call('GET', KEYS[2]))
        local tokens = tonumber(redis.call('GET', KEYS[1]))
        if not reset_at or now >= reset_at then
            tokens = max
            reset_at = now + window
            redis.call('SET', KEYS[2], reset_at)
        end
        if not tokens then
            tokens = max
        end
        if tokens <= 0 then
            return {0, reset_at - now}
        end
        redis.call('SET', KEYS[1], tokens - 1)
        return {1, 0}
        "#,
    )
}

pub fn reclaim_stalled() -> Script {
    Script::new(
        r#"
        local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        local out = {}
        local max_stalls = tonumber(ARGV[2])
        for _, id in ipairs(expired) do
            if redis.call('ZREM', KEYS[1], id) == 1 then
                local jobkey = KEYS[4] .. id
                local stall_count = tonumber(redis.call('HINCRBY', jobkey, 'stall_count', 1))
                if stall_count > max_stalls then
                    redis.call('HSET', jobkey, 'state', 'failed', 'finished_at_ms', ARGV[1],
                        'last_error', 'stalled: lease expired too many times')
                    redis.call('ZADD', KEYS[3], ARGV[1], id)
                    table.insert(out, 'terminated')
                    table.insert(out, id)
                    table.insert(out, '0')
                else
                    local pc = tonumber(redis.call('HGET', jobkey, 'priority_class'))
                    local created = tonumber(redis.call('HGET', jobkey, 'created_at_ms'))
                    local score = pc * 1e13 + created
                    local member = string.format('%020d', tonumber(id))
                    redis.call('HSET', jobkey, 'state', 'waiting')
                    redis.call('ZADD', KEYS[2], score, member)
                    table.insert(out, 'requeued')
                    table.insert(out, id)
                    table.insert(out, tostring(stall_count))
                end
            end
        end
        return out
        "#,
    )
}

pub fn remove_job() -> Script {
    Script::new(
        r#"
        local lease = redis.call('ZSCORE', KEYS[1], ARGV[1])
        if lease and tonumber(lease) > tonumber(ARGV[2]) then
            return 0
        end
        redis.call('ZREM', KEYS[1], ARGV[1])
        redis.call('ZREM', KEYS[2], string.format('%020d', tonumber(ARGV[1])))
        redis.call('ZREM', KEYS[3], ARGV[1])
        redis.call('ZREM', KEYS[4], ARGV[1])
        redis.call('ZREM', KEYS[5], ARGV[1])
        redis.call('DEL', KEYS[6])
        return 1
        "#,
    )
}

pub fn retry_job() -> Script {
    Script::new(
        r#"
        if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
            redis.call('ZREM', KEYS[1], ARGV[1])
            local pc = tonumber(redis.call('HGET', KEYS[3], 'priority_class'))
            redis.call('HSET', KEYS[3], 'state', 'waiting', 'attempts_made', '0',
                'available_at_ms', ARGV[2], 'created_at_ms', ARGV[2], 'finished_at_ms', '')
            local score = pc * 1e13 + tonumber(ARGV[2])
            local member = string.format('%020d', tonumber(ARGV[1]))
            redis.call('ZADD', KEYS[2], score, member)
            return 1
        end
        return 0
        "#,
    )
}

pub fn clean() -> Script {
    Script::new(
        r#"
        local victims = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
        for _, id in ipairs(victims) do
            redis.call('ZREM', KEYS[1], id)
            redis.call('DEL', KEYS[2] .. id)
        end
        return #victims
        "#,
    )
}

/// Scans the three "live" sets for a job whose `repeat_id` matches.
/// O(queue depth) — there is no secondary repeat_id index. Acceptable at the
/// depths these sets run at in practice (live jobs, not history); revisit
/// with a `jq:{q}:repeat:{rid}:concrete` pointer key if that stops holding.
pub fn has_live_concrete() -> Script {
    Script::new(
        r#"
        local function scan(key)
            local ids = redis.call('ZRANGE', key, 0, -1)
            for _, raw_id in ipairs(ids) do
                local id = tostring(tonumber(raw_id))
                if redis.call('HGET', KEYS[4] .. id, 'repeat_id') == ARGV[1] then
                    return true
                end
            end
            return false
        end
        if scan(KEYS[1]) or scan(KEYS[2]) or scan(KEYS[3]) then
            return 1
        end
        return 0
        "#,
    )
}
