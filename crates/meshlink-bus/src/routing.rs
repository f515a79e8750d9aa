//! Broker topology names and routing-key helpers.
//!
//! Raw frames are published to [`RAW_EXCHANGE`] with routing key
//! `{frame kind}.{address}`; consumers bind `*.{address}` for each node they
//! own. Derived readings go to [`SENSOR_EXCHANGE`] keyed by metric name,
//! optionally followed by `.{address}`.

use meshlink_core::address::Address;

/// Topic exchange carrying every frame received from the radio.
pub const RAW_EXCHANGE: &str = "raw_xbee_packets";

/// Topic exchange carrying decoded sensor readings.
pub const SENSOR_EXCHANGE: &str = "sensor_data";

/// Well-known queue serviced by the packet bridge for transmit requests.
pub const TRANSMIT_QUEUE: &str = "xbee_tx";

/// Routing key for a raw frame: `{kind}.{address}`.
pub fn raw_routing_key(kind: &str, address: &Address) -> String {
    format!("{}.{}", kind, address)
}

/// Binding pattern matching every frame kind from one address.
pub fn address_binding(address: &Address) -> String {
    format!("*.{}", address)
}

/// Routing key for derived data: `{metric}` or `{metric}.{address}`.
pub fn derived_routing_key(metric: &str, address: Option<&Address>) -> String {
    match address {
        Some(address) => format!("{}.{}", metric, address),
        None => metric.to_string(),
    }
}

/// Extract the address from a raw routing key.
///
/// The address is everything after the first `.`; returns `None` if there
/// is no `.` or the remainder is not an address.
pub fn parse_address(routing_key: &str) -> Option<Address> {
    let (_, address) = routing_key.split_once('.')?;
    address.parse().ok()
}

/// Whether `routing_key` matches a topic-exchange binding `pattern`.
///
/// Both are `.`-separated words. In the pattern, `*` matches exactly one
/// word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => match_words(rest, key_rest),
            _ => false,
        },
    }
}
