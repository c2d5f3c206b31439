//! Link-speed resolution from flow reports.

use serde::Serialize;

use crate::report::{FlowPair, FlowReport};
use crate::speed::SpeedBin;

/// Highest bin searched when the interface speed was not collected.
const FALLBACK_SEARCH_LIMIT: i32 = 10;

/// Winning bin index for one flow report, `-1` when the report carries no
/// data.
///
/// Only bins `0..=ifspeed` are searched so NIC coalescing cannot push the
/// estimate above the interface's own speed. An unknown, zero or out of range
/// interface index widens the search to bin 10. Ties keep the lower bin.
pub fn resolve_link(report: &FlowReport) -> i32 {
    let limit = match report.ifspeed {
        s if s <= 0 || s > FALLBACK_SEARCH_LIMIT => FALLBACK_SEARCH_LIMIT,
        s => s,
    } as usize;

    let mut max = 0i64;
    let mut index = 0usize;
    for (j, &count) in report.bins.iter().enumerate().take(limit + 1) {
        if max < count {
            max = count;
            index = j;
        }
    }

    if report.bins[index] == -1 {
        return -1;
    }
    index as i32
}

/// `false` for the no-data marker and the retransmission/unknown bins.
pub fn is_determined(index: i32) -> bool {
    !matches!(
        SpeedBin::from_index(index),
        None | Some(SpeedBin::Retransmission) | Some(SpeedBin::Unknown)
    )
}

/// Resolved link index for each of the four observed flows.
///
/// Flows that were never tested stay at `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkSpeeds {
    pub c2s_data: i32,
    pub c2s_ack: i32,
    pub s2c_data: i32,
    pub s2c_ack: i32,
}

impl LinkSpeeds {
    pub fn resolve(c2s: Option<&FlowPair>, s2c: Option<&FlowPair>) -> Self {
        let mut out = LinkSpeeds::default();
        if let Some(pair) = c2s {
            out.c2s_data = resolve_link(&pair.data);
            out.c2s_ack = resolve_link(&pair.ack);
        }
        if let Some(pair) = s2c {
            out.s2c_data = resolve_link(&pair.data);
            out.s2c_ack = resolve_link(&pair.ack);
        }
        tracing::debug!(
            c2s_data = out.c2s_data,
            c2s_ack = out.c2s_ack,
            s2c_data = out.s2c_data,
            s2c_ack = out.s2c_ack,
            "link speeds resolved"
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(bins: [i64; 12], ifspeed: i32) -> FlowReport {
        FlowReport {
            bins,
            ifspeed,
            ..FlowReport::unavailable()
        }
    }

    #[test]
    fn interface_speed_caps_search() {
        let r = report([0, 0, 0, 950, 0, 0, 0, 0, 0, 0, 5, 45], 3);
        assert_eq!(resolve_link(&r), 3);
        assert!(is_determined(3));
    }

    #[test]
    fn cap_hides_higher_bins() {
        let r = report([0, 0, 10, 5, 0, 0, 0, 900, 0, 0, 0, 0], 3);
        assert_eq!(resolve_link(&r), 2);
    }

    #[test]
    fn unknown_interface_searches_through_bin_ten() {
        let r = report([0, 0, 1, 5, 0, 0, 0, 0, 0, 0, 50, 999], -1);
        assert_eq!(resolve_link(&r), 10);
        assert!(!is_determined(10));
    }

    #[test]
    fn ties_keep_lower_bin() {
        let r = report([0, 0, 7, 7, 0, 0, 0, 0, 0, 0, 0, 0], 9);
        assert_eq!(resolve_link(&r), 2);
    }

    #[test]
    fn unavailable_resolves_to_minus_one() {
        assert_eq!(resolve_link(&FlowReport::unavailable()), -1);
        assert!(!is_determined(-1));
    }

    #[test]
    fn untested_flows_stay_zero() {
        let pair = FlowPair {
            data: report([0, 0, 0, 10, 0, 0, 0, 0, 0, 0, 0, 0], 5),
            ack: report([0, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0], 5),
        };
        let speeds = LinkSpeeds::resolve(None, Some(&pair));
        assert_eq!(speeds.c2s_data, 0);
        assert_eq!(speeds.s2c_data, 3);
        assert_eq!(speeds.s2c_ack, 4);
    }
}
