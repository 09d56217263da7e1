//! Server-side atomic scripts
//!
//! Each script runs as a single atomic unit on the store, so no other
//! client can observe or modify the key between its steps.

/// A named Lua script understood by every store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreScript {
    name: &'static str,
    body: &'static str,
}

impl StoreScript {
    pub const fn new(name: &'static str, body: &'static str) -> Self {
        Self { name, body }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn body(&self) -> &'static str {
        self.body
    }
}

/// Fixed-window counter.
///
/// KEYS[1] = window key, ARGV[1] = window in milliseconds, ARGV[2] = step.
/// The expiry is set only by the increment that opens the window. A key
/// found without any expiry is repaired so it cannot live forever.
/// Returns `{count, remaining_ttl_ms}`.
pub const INCREMENT_WINDOW: StoreScript = StoreScript::new(
    "increment_window",
    r#"
local current = tonumber(redis.call("INCRBY", KEYS[1], ARGV[2]))
if current == tonumber(ARGV[2]) or redis.call("PTTL", KEYS[1]) == -1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return {current, redis.call("PTTL", KEYS[1])}
"#,
);

/// Compare-and-extend for lock renewal.
///
/// KEYS[1] = lock key, ARGV[1] = holder token, ARGV[2] = ttl in milliseconds.
/// Returns 1 when extended, 0 when the key is missing or held by another token.
pub const EXTEND_IF_OWNER: StoreScript = StoreScript::new(
    "extend_if_owner",
    r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#,
);

/// Compare-and-delete for lock release.
///
/// KEYS[1] = lock key, ARGV[1] = holder token.
/// Returns 1 when deleted, 0 when the key is missing or held by another token.
pub const RELEASE_IF_OWNER: StoreScript = StoreScript::new(
    "release_if_owner",
    r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#,
);

/// Scripts registered with the server on connect
pub const BUILTIN_SCRIPTS: [StoreScript; 3] = [INCREMENT_WINDOW, EXTEND_IF_OWNER, RELEASE_IF_OWNER];
