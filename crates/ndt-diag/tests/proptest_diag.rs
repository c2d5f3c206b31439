//! Property-based tests for speed classification, link resolution and the
//! heuristics engine.

use ndt_diag::counters::TcpCounters;
use ndt_diag::heuristics::{self, diagnose, DiagnosticInput, HeuristicVersion};
use ndt_diag::link::{resolve_link, LinkSpeeds};
use ndt_diag::report::FlowReport;
use ndt_diag::speed::{SpeedBin, BIN_COUNT, BREAKPOINTS_MBPS};
use proptest::prelude::*;

// ─── Strategies ──────────────────────────────────────────────────────────────

fn speed() -> impl Strategy<Value = f64> {
    prop_oneof![
        Just(0.0),
        Just(0.01),
        Just(0.064),
        Just(1.5),
        Just(10000.0),
        0.0f64..20000.0,
        any::<f64>(),
    ]
}

fn counters() -> impl Strategy<Value = TcpCounters> {
    (
        (-1i64..100_000, -1i64..1000, -1i64..100, -1i64..100_000),
        (-1i64..20_000_000, -1i64..20_000_000, -1i64..20_000_000),
        (-1i64..1_000, -1i64..1_000, -1i64..1_000),
        (-1i64..100_000_000, 500i64..9000, -1i64..1_000_000),
    )
        .prop_map(|(rtt, lim, trans, misc)| TcpCounters {
            sum_rtt: rtt.0,
            count_rtt: rtt.1,
            congestion_signals: rtt.2,
            pkts_out: rtt.3,
            snd_lim_time_rwin: lim.0,
            snd_lim_time_cwnd: lim.1,
            snd_lim_time_sender: lim.2,
            snd_lim_trans_rwin: trans.0,
            snd_lim_trans_cwnd: trans.1,
            snd_lim_trans_sender: trans.2,
            data_bytes_out: misc.0,
            current_mss: misc.1,
            max_cwnd: misc.2,
            ..TcpCounters::unavailable()
        })
}

// ─── Classification ──────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn classify_is_total_and_consistent(mbps in speed()) {
        let bin = SpeedBin::classify(mbps);
        let expected = if mbps == 0.0 {
            SpeedBin::Retransmission
        } else if mbps.is_nan() || mbps < 0.0 {
            SpeedBin::Unknown
        } else {
            BREAKPOINTS_MBPS
                .iter()
                .position(|&b| mbps <= b)
                .map_or(SpeedBin::Unknown, |i| SpeedBin::ALL[i])
        };
        prop_assert_eq!(bin, expected);
    }

    #[test]
    fn nonnegative_speed_hits_exactly_one_bin(mbps in 0.0f64..1e6) {
        let mut bins = [0i64; BIN_COUNT];
        bins[SpeedBin::classify(mbps).index()] += 1;
        prop_assert_eq!(bins.iter().sum::<i64>(), 1);
    }

    #[test]
    fn resolved_link_stays_under_interface_cap(
        bins in proptest::array::uniform12(0i64..1000),
        ifspeed in 1i32..=10,
    ) {
        let report = FlowReport { bins, ifspeed, ..FlowReport::unavailable() };
        let index = resolve_link(&report);
        prop_assert!(index >= 0 && index <= ifspeed);
    }
}

// ─── Heuristics ──────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn detectors_are_pure(c in counters(), s2c in 0.0f64..1e6, mid in 0.0f64..1e6, multiple in any::<bool>()) {
        let input = DiagnosticInput {
            counters: c.clone(),
            c2s_kbps: 1000.0,
            s2c_kbps: s2c,
            mid_kbps: mid,
            links: LinkSpeeds::default(),
            multiple,
            version: HeuristicVersion::SuppressInMultiClient,
        };
        let a = diagnose(&input);
        let b = diagnose(&input);
        prop_assert_eq!(a.link, b.link);
        prop_assert_eq!(a.mismatch, b.mismatch);
        prop_assert_eq!(a.bad_cable, b.bad_cable);
        prop_assert_eq!(a.half_duplex, b.half_duplex);
        prop_assert_eq!(a.congestion, b.congestion);

        let real = heuristics::real_throughput(c.data_bytes_out, heuristics::total_test_time(&c));
        prop_assert_eq!(
            heuristics::detect_ethernet_link(real, s2c, 0.001, 0.01, 100),
            heuristics::detect_ethernet_link(real, s2c, 0.001, 0.01, 100)
        );
    }

    #[test]
    fn zero_loss_floor_depends_on_link(pkts in 1i64..1_000_000, link in -1i32..12) {
        let loss = heuristics::packet_loss(0, pkts, link);
        if link > 5 {
            prop_assert_eq!(loss, 1e-10);
        } else {
            prop_assert_eq!(loss, 1e-6);
        }
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn zero_congestion_on_fast_link() {
    assert_eq!(heuristics::packet_loss(0, 1000, 6), 1e-10);
}

#[test]
fn histogram_capped_at_interface_speed() {
    let report = FlowReport {
        bins: [0, 0, 0, 950, 0, 0, 0, 0, 0, 0, 5, 45],
        ifspeed: 3,
        ..FlowReport::unavailable()
    };
    assert_eq!(resolve_link(&report), 3);
    assert_eq!(SpeedBin::from_index(3), Some(SpeedBin::Ethernet));
}
