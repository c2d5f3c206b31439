//! Property-based tests for queue ordering.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ndt_proto::SessionId;
use ndt_server::scheduler::{Action, Admission, Arrival, SchedulerState};
use proptest::prelude::*;

fn arrival(n: usize) -> Arrival {
    Arrival {
        id: SessionId::new(),
        client: SocketAddr::from(([10, 0, (n / 256) as u8, (n % 256) as u8], 40000)),
        status_capable: false,
    }
}

proptest! {
    /// Single mode runs sessions to completion strictly in arrival order.
    #[test]
    fn single_mode_is_fifo(count in 1usize..40, interleave in proptest::collection::vec(any::<bool>(), 0..80)) {
        let now = Instant::now();
        let mut s = SchedulerState::new(false, 200, true, Duration::from_secs(3600));
        let mut arrivals = Vec::new();
        let mut pending: Vec<Arrival> = (0..count).map(arrival).collect();
        pending.reverse();
        let mut running: Option<SessionId> = None;
        let mut finished = Vec::new();
        let mut steps = interleave.into_iter();

        while !pending.is_empty() || running.is_some() || !s.is_empty() {
            let submit_next = steps.next().unwrap_or(false);
            if submit_next || running.is_none() && s.is_empty() {
                if let Some(a) = pending.pop() {
                    arrivals.push(a.id.clone());
                    let id = a.id.clone();
                    if s.submit(a, now) == Admission::Dispatch {
                        prop_assert!(running.is_none());
                        running = Some(id);
                    }
                    continue;
                }
            }
            if let Some(id) = running.take() {
                prop_assert!(s.reap(&id));
                finished.push(id);
            }
            for action in s.tick(now) {
                if let Action::Dispatch(id) = action {
                    prop_assert!(running.is_none());
                    running = Some(id);
                }
            }
        }

        prop_assert_eq!(finished, arrivals);
    }

    /// Multi mode never runs more than `max_clients` sessions at once.
    #[test]
    fn multi_mode_respects_capacity(max in 1usize..6, count in 1usize..30) {
        let now = Instant::now();
        let mut s = SchedulerState::new(true, max, true, Duration::from_secs(3600));
        for n in 0..count {
            s.submit(arrival(n), now);
            prop_assert!(s.active() <= max);
        }
        s.tick(now);
        prop_assert_eq!(s.active(), count.min(max));
    }
}
