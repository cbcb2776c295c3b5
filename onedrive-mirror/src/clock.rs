use time::OffsetDateTime;

/// Current time as unix seconds, the unit every stored timestamp uses.
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
