//! # Link Speed Bins
//!
//! Each packet pair's dispersion speed (Mbps) lands in exactly one of twelve
//! bins. Upper bounds are inclusive:
//!
//! ```text
//!  idx  range (Mbps)          label
//!  ───  ────────────────────  ─────────────────────
//!   0   (0, 0.01]             RTT
//!   1   (0.01, 0.064]         Dial-up modem
//!   2   (0.064, 1.5]          T1 / DSL
//!   3   (1.5, 10]             Ethernet / WiFi-11b
//!   4   (10, 40]              T3 / DS3
//!   5   (40, 100]             Fast Ethernet
//!   6   (100, 622]            OC-12
//!   7   (622, 1000]           Gigabit Ethernet
//!   8   (1000, 2400]          OC-48
//!   9   (2400, 10000]         10 Gigabit Ethernet
//!  10   == 0                  Retransmissions
//!  11   everything else       Unknown
//! ```

use serde::Serialize;
use std::fmt;

/// Number of histogram bins.
pub const BIN_COUNT: usize = 12;

/// Inclusive upper bounds for bins 0..=9.
pub const BREAKPOINTS_MBPS: [f64; 10] = [
    0.01, 0.064, 1.5, 10.0, 40.0, 100.0, 622.0, 1000.0, 2400.0, 10000.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum SpeedBin {
    Rtt = 0,
    DialUp = 1,
    T1 = 2,
    Ethernet = 3,
    T3 = 4,
    FastEthernet = 5,
    Oc12 = 6,
    GigabitEthernet = 7,
    Oc48 = 8,
    TenGigabitEthernet = 9,
    Retransmission = 10,
    Unknown = 11,
}

impl SpeedBin {
    pub const ALL: [SpeedBin; BIN_COUNT] = [
        SpeedBin::Rtt,
        SpeedBin::DialUp,
        SpeedBin::T1,
        SpeedBin::Ethernet,
        SpeedBin::T3,
        SpeedBin::FastEthernet,
        SpeedBin::Oc12,
        SpeedBin::GigabitEthernet,
        SpeedBin::Oc48,
        SpeedBin::TenGigabitEthernet,
        SpeedBin::Retransmission,
        SpeedBin::Unknown,
    ];

    /// Classify a speed in Mbps. Total over all `f64` values.
    pub fn classify(mbps: f64) -> SpeedBin {
        if mbps == 0.0 {
            return SpeedBin::Retransmission;
        }
        if mbps.is_nan() || mbps < 0.0 {
            return SpeedBin::Unknown;
        }
        BREAKPOINTS_MBPS
            .iter()
            .position(|&upper| mbps <= upper)
            .map_or(SpeedBin::Unknown, |i| SpeedBin::ALL[i])
    }

    /// Bin matching a nominal interface speed in Mbps, e.g. 1000 for a
    /// gigabit NIC. Non-positive values mean "not known".
    pub fn for_interface_mbps(mbps: i64) -> Option<SpeedBin> {
        if mbps <= 0 {
            return None;
        }
        match SpeedBin::classify(mbps as f64) {
            SpeedBin::Unknown | SpeedBin::Retransmission => None,
            bin => Some(bin),
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: i32) -> Option<SpeedBin> {
        usize::try_from(index)
            .ok()
            .and_then(|i| SpeedBin::ALL.get(i).copied())
    }

    pub fn label(self) -> &'static str {
        match self {
            SpeedBin::Rtt => "RTT",
            SpeedBin::DialUp => "Dial-up Modem",
            SpeedBin::T1 => "T1",
            SpeedBin::Ethernet => "Ethernet/WiFi-11b",
            SpeedBin::T3 => "T3/DS3",
            SpeedBin::FastEthernet => "FastEthernet",
            SpeedBin::Oc12 => "OC-12",
            SpeedBin::GigabitEthernet => "Gigabit Ethernet",
            SpeedBin::Oc48 => "OC-48",
            SpeedBin::TenGigabitEthernet => "10 Gigabit Enet",
            SpeedBin::Retransmission => "Retransmissions",
            SpeedBin::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for SpeedBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_fall_into_lower_bin() {
        assert_eq!(SpeedBin::classify(0.01), SpeedBin::Rtt);
        assert_eq!(SpeedBin::classify(0.064), SpeedBin::DialUp);
        assert_eq!(SpeedBin::classify(1.5), SpeedBin::T1);
        assert_eq!(SpeedBin::classify(10.0), SpeedBin::Ethernet);
        assert_eq!(SpeedBin::classify(100.0), SpeedBin::FastEthernet);
        assert_eq!(SpeedBin::classify(10000.0), SpeedBin::TenGigabitEthernet);
    }

    #[test]
    fn just_above_boundary() {
        assert_eq!(SpeedBin::classify(0.0100001), SpeedBin::DialUp);
        assert_eq!(SpeedBin::classify(10000.5), SpeedBin::Unknown);
    }

    #[test]
    fn zero_is_retransmission() {
        assert_eq!(SpeedBin::classify(0.0), SpeedBin::Retransmission);
        assert_eq!(SpeedBin::classify(-0.0), SpeedBin::Retransmission);
    }

    #[test]
    fn odd_values_are_unknown() {
        assert_eq!(SpeedBin::classify(f64::NAN), SpeedBin::Unknown);
        assert_eq!(SpeedBin::classify(f64::INFINITY), SpeedBin::Unknown);
        assert_eq!(SpeedBin::classify(-3.0), SpeedBin::Unknown);
    }

    #[test]
    fn interface_speed_bins() {
        assert_eq!(SpeedBin::for_interface_mbps(10), Some(SpeedBin::Ethernet));
        assert_eq!(SpeedBin::for_interface_mbps(100), Some(SpeedBin::FastEthernet));
        assert_eq!(SpeedBin::for_interface_mbps(1000), Some(SpeedBin::GigabitEthernet));
        assert_eq!(SpeedBin::for_interface_mbps(10000), Some(SpeedBin::TenGigabitEthernet));
        assert_eq!(SpeedBin::for_interface_mbps(-1), None);
        assert_eq!(SpeedBin::for_interface_mbps(40000), None);
    }

    #[test]
    fn index_round_trip() {
        for bin in SpeedBin::ALL {
            assert_eq!(SpeedBin::from_index(bin.index() as i32), Some(bin));
        }
        assert_eq!(SpeedBin::from_index(-1), None);
        assert_eq!(SpeedBin::from_index(12), None);
    }
}
