/// Collector module
///
/// This module groups the logic that turns the tracked clan set into
/// stored records:
/// - `orchestrator`: one clan at a time, fetch → fan-out → histories → persist
/// - `scheduler`:    runs a cycle now, then once per interval, until shutdown
///
/// Design notes:
/// - HTTP concerns (rate limit, retry, status mapping) MUST NOT live here;
///   they belong to `api`
/// - Store drivers stay behind the `Store` trait
pub mod orchestrator;
pub mod scheduler;
