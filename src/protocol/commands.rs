//! Command registry: which argument positions of a verb are keys.
//!
//! Mirrors the key-position triples of the command table (first key,
//! last key, step). Only verbs that can appear on a replication stream
//! matter here; a verb missing from the table is treated by callers as
//! unfilterable and passed through.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Key positions within a command's argument list (0-based, verb excluded).
///
/// `last == -1` means "through the final argument".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    pub first: usize,
    pub last: i32,
    pub step: usize,
}

const fn spec(first: usize, last: i32, step: usize) -> KeySpec {
    KeySpec { first, last, step }
}

/// Key at argument 0 only.
const ONE: KeySpec = spec(0, 0, 1);
/// Keys at arguments 0 and 1.
const TWO: KeySpec = spec(0, 1, 1);
/// Every argument is a key.
const ALL: KeySpec = spec(0, -1, 1);
/// Alternating key/value pairs.
const PAIRS: KeySpec = spec(0, -1, 2);

fn table() -> &'static HashMap<&'static str, KeySpec> {
    static TABLE: OnceLock<HashMap<&'static str, KeySpec>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut t = HashMap::new();
        // strings
        for verb in [
            "set",
            "setnx",
            "setex",
            "psetex",
            "setrange",
            "setbit",
            "append",
            "getset",
            "getdel",
            "incr",
            "decr",
            "incrby",
            "decrby",
            "incrbyfloat",
        ] {
            t.insert(verb, ONE);
        }
        // expiry
        for verb in ["expire", "pexpire", "expireat", "pexpireat", "persist"] {
            t.insert(verb, ONE);
        }
        // lists
        for verb in [
            "lpush", "rpush", "lpushx", "rpushx", "lpop", "rpop", "lset", "linsert", "lrem",
            "ltrim", "sort",
        ] {
            t.insert(verb, ONE);
        }
        // sets
        for verb in ["sadd", "srem", "spop"] {
            t.insert(verb, ONE);
        }
        // hashes
        for verb in ["hset", "hsetnx", "hmset", "hdel", "hincrby", "hincrbyfloat"] {
            t.insert(verb, ONE);
        }
        // sorted sets
        for verb in [
            "zadd",
            "zincrby",
            "zrem",
            "zremrangebyscore",
            "zremrangebyrank",
            "zremrangebylex",
            "zpopmin",
            "zpopmax",
        ] {
            t.insert(verb, ONE);
        }
        // hyperloglog, streams, misc single-key writes
        for verb in ["pfadd", "xadd", "xtrim", "xdel", "xsetid", "restore", "getex"] {
            t.insert(verb, ONE);
        }
        // multi-key
        for verb in ["del", "unlink", "pfmerge", "sinterstore", "sunionstore", "sdiffstore"] {
            t.insert(verb, ALL);
        }
        for verb in ["mset", "msetnx"] {
            t.insert(verb, PAIRS);
        }
        for verb in ["rename", "renamenx", "rpoplpush", "lmove", "smove", "copy", "georadius"] {
            t.insert(verb, TWO);
        }
        t
    })
}

/// Look up the key positions of a verb (already lowercased).
pub fn lookup(verb: &str) -> Option<&'static KeySpec> {
    table().get(verb)
}

/// Collect the key arguments of a command according to its spec.
///
/// Positions past the end of `args` are skipped, so a malformed command
/// simply yields fewer keys rather than panicking.
pub fn keys<'a>(spec: &KeySpec, args: &'a [Vec<u8>]) -> Vec<&'a [u8]> {
    if args.is_empty() {
        return Vec::new();
    }
    let last = if spec.last < 0 {
        args.len() - 1
    } else {
        (spec.last as usize).min(args.len() - 1)
    };
    let mut out = Vec::new();
    let mut i = spec.first;
    while i <= last {
        out.push(args[i].as_slice());
        i += spec.step.max(1);
    }
    out
}
