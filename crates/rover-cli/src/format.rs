//! Plain-text rendering of attribute payloads.

use rover_core::CommsTimingStats;
use rover_types::AttributeType;
use rover_types::binary::bytes_to_u16s;

/// Space-separated lowercase hex, e.g. `2c 01`.
pub fn format_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One line for a read result: the raw bytes, plus a numeric reading when
/// the payload is one byte or a list of little-endian `u16`s.
pub fn format_reading(attribute: AttributeType, data: &[u8]) -> String {
    let raw = format_bytes(data);
    let decoded = match data.len() {
        0 => None,
        1 => Some(data[0].to_string()),
        _ => bytes_to_u16s(data).ok().map(|values| {
            values
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }),
    };
    match decoded {
        Some(value) => format!("{attribute}: {value} [{raw}]"),
        None => format!("{attribute}: [{raw}]"),
    }
}

pub fn format_stats(stats: &CommsTimingStats) -> String {
    format!(
        "Average write:       {:.2} ms\nAverage transaction: {:.2} ms\nRecommended interval: {} ms\n",
        stats.average_write_ms, stats.average_transaction_ms, stats.recommended_interval_ms
    )
}
