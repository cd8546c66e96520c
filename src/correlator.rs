use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    ledger::{day_span, Ledger, Observation, Ticket},
    router,
};

// Plenty for a burst of plates; the worker drains fast since a scan
// never touches the network.
const SUBMIT_BUFFER_SIZE: usize = 256;

/// Handle for feeding observations to the correlation worker
#[derive(Debug, Clone)]
pub struct Handle {
    sender: mpsc::Sender<Observation>,
}

impl Handle {
    pub async fn submit(&self, observation: Observation) {
        self.sender
            .send(observation)
            .await
            .expect("the correlation worker lives as long as its handles");
    }
}

/// Starts the correlation worker
///
/// Every observation in the process funnels through the returned handle.
/// A single worker serialises the rate-limit check against the day
/// marking done at emission, so a plate can never collect two tickets
/// covering the same day.
///
/// note: this function needs to be called from inside a tokio runtime context
pub fn start(ledger: Arc<Ledger>) -> Handle {
    let (tx, mut rx) = mpsc::channel(SUBMIT_BUFFER_SIZE);

    tokio::spawn(async move {
        while let Some(observation) = rx.recv().await {
            ingest(&ledger, observation);
        }
    });

    Handle { sender: tx }
}

fn ingest(ledger: &Ledger, observation: Observation) {
    ledger.insert_observation(observation.clone());

    let history = ledger.observations_for(&observation.plate);
    if let Some(ticket) = scan(ledger, &observation, &history) {
        tracing::debug!(
            plate = %ticket.plate,
            road = ticket.road,
            speed = ticket.speed,
            "speeding pair found"
        );
        router::emit(ledger, ticket);
    }
}

/// Compare a fresh observation against the plate's history and produce
/// at most one ticket
///
/// The history snapshot includes the observation itself; the `dt == 0`
/// filter keeps it from pairing with itself.
fn scan(ledger: &Ledger, observation: &Observation, history: &[Observation]) -> Option<Ticket> {
    for prior in history {
        if prior.road != observation.road {
            continue;
        }

        let dt = prior.timestamp.abs_diff(observation.timestamp);
        if dt == 0 {
            continue;
        }
        let distance = prior.mile.abs_diff(observation.mile);

        let avg_mph = f64::from(distance) * 3600.0 / f64::from(dt);
        // half an mph under the limit still rounds down to legal
        if avg_mph < f64::from(observation.limit) + 0.5 {
            continue;
        }

        // one ticket per plate per calendar day; a candidate whose days
        // are taken is dropped, the scan moves on
        let days = day_span(prior.timestamp, observation.timestamp);
        if ledger.any_day_ticketed(&observation.plate, days) {
            continue;
        }

        let (first, second) = if prior.timestamp <= observation.timestamp {
            (prior, observation)
        } else {
            (observation, prior)
        };

        return Some(Ticket {
            plate: observation.plate.clone(),
            road: observation.road,
            mile1: first.mile,
            timestamp1: first.timestamp,
            mile2: second.mile,
            timestamp2: second.timestamp,
            speed: (avg_mph * 100.0).round() as u16,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use crate::ledger::{Ledger, Observation, Ticket};

    use super::scan;

    fn observation(road: u16, mile: u16, timestamp: u32, limit: u16) -> Observation {
        Observation {
            plate: "UN1X".into(),
            timestamp,
            road,
            mile,
            limit,
        }
    }

    // insert the history and scan the last observation, the way the
    // worker does it
    fn scan_last(ledger: &Ledger, observations: &[Observation]) -> Option<Ticket> {
        for observation in observations {
            ledger.insert_observation(observation.clone());
        }
        let last = observations.last().unwrap();
        scan(ledger, last, &ledger.observations_for(&last.plate))
    }

    #[test]
    fn speeding_pair_produces_a_ticket() {
        let ledger = Ledger::new();

        // one mile in 45 seconds is 80 mph on a 60 mph road
        let ticket = scan_last(
            &ledger,
            &[observation(66, 8, 0, 60), observation(66, 9, 45, 60)],
        )
        .unwrap();

        assert_eq!(
            ticket,
            Ticket {
                plate: "UN1X".into(),
                road: 66,
                mile1: 8,
                timestamp1: 0,
                mile2: 9,
                timestamp2: 45,
                speed: 8000,
            }
        );
    }

    #[test]
    fn earlier_observation_is_always_side_one() {
        let ledger = Ledger::new();

        // the later sighting arrives first
        let ticket = scan_last(
            &ledger,
            &[observation(66, 9, 45, 60), observation(66, 8, 0, 60)],
        )
        .unwrap();

        assert_eq!((ticket.mile1, ticket.timestamp1), (8, 0));
        assert_eq!((ticket.mile2, ticket.timestamp2), (9, 45));
    }

    #[test]
    fn at_the_limit_is_not_speeding() {
        let ledger = Ledger::new();

        // 100 miles in 6000 seconds is exactly 60 mph
        let ticket = scan_last(
            &ledger,
            &[observation(42, 0, 0, 60), observation(42, 100, 6000, 60)],
        );
        assert!(ticket.is_none());
    }

    #[test]
    fn half_an_mph_over_rounds_into_a_ticket() {
        let ledger = Ledger::new();

        // 121 miles in 7200 seconds is exactly 60.5 mph
        let ticket = scan_last(
            &ledger,
            &[observation(42, 0, 0, 60), observation(42, 121, 7200, 60)],
        )
        .unwrap();
        assert_eq!(ticket.speed, 6050);
    }

    #[test]
    fn other_roads_do_not_pair() {
        let ledger = Ledger::new();

        let ticket = scan_last(
            &ledger,
            &[observation(1, 0, 0, 60), observation(2, 100, 45, 60)],
        );
        assert!(ticket.is_none());
    }

    #[test]
    fn simultaneous_sightings_do_not_pair() {
        let ledger = Ledger::new();

        let ticket = scan_last(
            &ledger,
            &[observation(42, 0, 1000, 60), observation(42, 100, 1000, 60)],
        );
        assert!(ticket.is_none());
    }

    #[test]
    fn a_ticketed_day_suppresses_further_candidates() {
        let ledger = Ledger::new();

        let first = scan_last(
            &ledger,
            &[observation(42, 0, 0, 60), observation(42, 50, 450, 60)],
        )
        .unwrap();
        ledger.mark_ticketed(&first.plate, first.days());

        // a distinct pair, but it covers the same day
        let second = scan_last(&ledger, &[observation(42, 100, 900, 60)]);
        assert!(second.is_none());
    }

    #[test]
    fn a_fresh_day_can_be_ticketed_again() {
        let ledger = Ledger::new();

        let first = scan_last(
            &ledger,
            &[observation(42, 0, 0, 60), observation(42, 50, 450, 60)],
        )
        .unwrap();
        ledger.mark_ticketed(&first.plate, first.days());

        // two days later the same plate speeds again
        let later = 86400 * 2;
        let second = scan_last(
            &ledger,
            &[
                observation(42, 0, later, 60),
                observation(42, 50, later + 450, 60),
            ],
        );
        assert!(second.is_some());
    }

    #[test]
    fn zero_limit_tickets_any_motion() {
        let ledger = Ledger::new();

        // one mile in an hour is 1 mph, over a limit of zero
        let ticket = scan_last(
            &ledger,
            &[observation(42, 0, 0, 0), observation(42, 1, 3600, 0)],
        )
        .unwrap();
        assert_eq!(ticket.speed, 100);
    }
}
