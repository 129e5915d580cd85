//! Command tagging: which argument is the routing key, and whether the
//! command is safe to serve from a replica.

/// Commands that can be routed to a replica when replica reads are enabled.
pub fn is_read_only_command(cmd: &str) -> bool {
    matches!(
        cmd.to_ascii_uppercase().as_str(),
        "GET"
            | "MGET"
            | "KEYS"
            | "SCAN"
            | "TYPE"
            | "TTL"
            | "PTTL"
            | "EXISTS"
            | "STRLEN"
            | "GETRANGE"
            | "SUBSTR"
            | "HGET"
            | "HMGET"
            | "HGETALL"
            | "HKEYS"
            | "HVALS"
            | "HLEN"
            | "HEXISTS"
            | "HSCAN"
            | "HRANDFIELD"
            | "LRANGE"
            | "LLEN"
            | "LINDEX"
            | "LPOS"
            | "SMEMBERS"
            | "SCARD"
            | "SISMEMBER"
            | "SMISMEMBER"
            | "SRANDMEMBER"
            | "SSCAN"
            | "SUNION"
            | "SINTER"
            | "SDIFF"
            | "ZRANGE"
            | "ZRANGEBYSCORE"
            | "ZRANGEBYLEX"
            | "ZREVRANGE"
            | "ZREVRANGEBYSCORE"
            | "ZREVRANGEBYLEX"
            | "ZCARD"
            | "ZSCORE"
            | "ZMSCORE"
            | "ZCOUNT"
            | "ZLEXCOUNT"
            | "ZRANK"
            | "ZREVRANK"
            | "ZRANDMEMBER"
            | "ZSCAN"
            | "XRANGE"
            | "XREVRANGE"
            | "XLEN"
            | "XREAD"
            | "XINFO"
            | "OBJECT"
            | "BITCOUNT"
            | "BITPOS"
            | "GETBIT"
            | "PFCOUNT"
            | "GEODIST"
            | "GEOHASH"
            | "GEOPOS"
            | "GEORADIUS_RO"
            | "GEORADIUSBYMEMBER_RO"
            | "GEOSEARCH"
    )
}

/// Extract the first routing key from a command's arguments, following the
/// same special-cased key positions a real cluster client needs.
pub fn extract_key<'a>(args: &'a [&str]) -> Option<&'a str> {
    if args.is_empty() {
        return None;
    }
    let cmd = args[0].to_ascii_uppercase();
    match cmd.as_str() {
        "PING" | "INFO" | "DBSIZE" | "CLUSTER" | "CONFIG" | "CLIENT" | "COMMAND" | "TIME"
        | "RANDOMKEY" | "WAIT" | "SAVE" | "BGSAVE" | "BGREWRITEAOF" | "FLUSHALL" | "FLUSHDB"
        | "LASTSAVE" | "SLOWLOG" | "DEBUG" | "MULTI" | "EXEC" | "DISCARD" | "SCRIPT"
        | "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE" | "QUIT" | "ASKING" => None,
        "EVAL" | "EVALSHA" => {
            if args.len() >= 4 {
                if let Ok(numkeys) = args[2].parse::<usize>() {
                    if numkeys > 0 && args.len() > 3 {
                        return Some(args[3]);
                    }
                }
            }
            None
        }
        "XREAD" | "XREADGROUP" => {
            for (i, arg) in args.iter().enumerate() {
                if arg.eq_ignore_ascii_case("STREAMS") && i + 1 < args.len() {
                    return Some(args[i + 1]);
                }
            }
            None
        }
        _ => args.get(1).copied(),
    }
}
