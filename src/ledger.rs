use std::{
    collections::{HashMap, HashSet, VecDeque},
    ops::RangeInclusive,
    sync::Mutex,
};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::message::ToClient;

pub type Road = u16;
pub type Mile = u16;
pub type Limit = u16;
pub type Timestamp = u32;
pub type Plate = String;
pub type Day = u32;
pub type SessionId = u64;

const DAY_IN_SECS: u32 = 86400;

/// Calendar days spanned by a pair of timestamps, inclusive on both ends.
pub fn day_span(t1: Timestamp, t2: Timestamp) -> RangeInclusive<Day> {
    (t1.min(t2) / DAY_IN_SECS)..=(t1.max(t2) / DAY_IN_SECS)
}

/// A single camera sighting
///
/// The road, mile and limit are attributes of the reporting camera,
/// copied in at ingest time. Observations are immutable facts: they
/// outlive the camera session that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub plate: Plate,
    pub timestamp: Timestamp,
    pub road: Road,
    pub mile: Mile,
    pub limit: Limit,
}

/// A speeding violation derived from two observations on the same road
///
/// The first side is always the earlier one; `speed` is hundredths of a
/// mile per hour, the wire width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub plate: Plate,
    pub road: Road,
    pub mile1: Mile,
    pub timestamp1: Timestamp,
    pub mile2: Mile,
    pub timestamp2: Timestamp,
    pub speed: u16,
}

impl Ticket {
    pub fn days(&self) -> RangeInclusive<Day> {
        day_span(self.timestamp1, self.timestamp2)
    }
}

impl From<Ticket> for ToClient {
    fn from(ticket: Ticket) -> Self {
        Self::Ticket {
            plate: ticket.plate,
            road: ticket.road,
            mile1: ticket.mile1,
            timestamp1: ticket.timestamp1,
            mile2: ticket.mile2,
            timestamp2: ticket.timestamp2,
            speed: ticket.speed,
        }
    }
}

/// A live dispatcher as the ledger sees it: enough to route a ticket
/// into its mailbox and, should that mailbox back up, to cancel the
/// session. The session itself is never stored here.
#[derive(Debug, Clone)]
pub struct DispatcherEntry {
    pub session: SessionId,
    pub mailbox: mpsc::Sender<ToClient>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RoadTable {
    // road -> live dispatchers, in registration order
    dispatchers: HashMap<Road, Vec<DispatcherEntry>>,
    // road -> tickets awaiting a dispatcher, oldest first
    parked: HashMap<Road, VecDeque<Ticket>>,
}

/// Process-wide observation log, ticket history and dispatcher registry
///
/// Built once at boot and threaded into every session behind an `Arc`.
/// The per-plate tables are concurrent maps; the two road tables share
/// one lock because registering, parking and draining must observe each
/// other atomically. Nothing here ever blocks on the network.
#[derive(Debug, Default)]
pub struct Ledger {
    observations: DashMap<Plate, Vec<Observation>>,
    ticketed_days: DashMap<Plate, HashSet<Day>>,
    roads: Mutex<RoadTable>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_observation(&self, observation: Observation) {
        self.observations
            .entry(observation.plate.clone())
            .or_default()
            .push(observation);
    }

    /// Snapshot of every observation recorded for a plate
    pub fn observations_for(&self, plate: &str) -> Vec<Observation> {
        self.observations
            .get(plate)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Record that a ticket covering `days` has been emitted. Idempotent.
    pub fn mark_ticketed(&self, plate: &str, days: impl IntoIterator<Item = Day>) {
        self.ticketed_days
            .entry(plate.to_owned())
            .or_default()
            .extend(days);
    }

    pub fn any_day_ticketed(&self, plate: &str, days: impl IntoIterator<Item = Day>) -> bool {
        match self.ticketed_days.get(plate) {
            Some(entry) => days.into_iter().any(|day| entry.value().contains(&day)),
            None => false,
        }
    }

    /// Register a dispatcher for its declared roads
    ///
    /// Returns the roads that had no dispatcher until now; only those can
    /// have parked tickets waiting to be drained.
    pub fn register_dispatcher(&self, entry: DispatcherEntry, roads: &[Road]) -> Vec<Road> {
        let mut table = self.roads.lock().unwrap();

        let mut newly_covered = Vec::new();
        for &road in roads {
            let dispatchers = table.dispatchers.entry(road).or_default();
            if dispatchers.is_empty() {
                newly_covered.push(road);
            }
            dispatchers.push(entry.clone());
        }

        newly_covered
    }

    /// Remove a session from every road it registered for
    pub fn deregister_dispatcher(&self, session: SessionId) {
        let mut table = self.roads.lock().unwrap();
        table.dispatchers.retain(|_, dispatchers| {
            dispatchers.retain(|entry| entry.session != session);
            !dispatchers.is_empty()
        });
    }

    /// Any live dispatcher covering `road`
    pub fn find_dispatcher(&self, road: Road) -> Option<DispatcherEntry> {
        let table = self.roads.lock().unwrap();
        table
            .dispatchers
            .get(&road)
            .and_then(|dispatchers| dispatchers.first().cloned())
    }

    pub fn park_ticket(&self, ticket: Ticket) {
        let mut table = self.roads.lock().unwrap();
        table
            .parked
            .entry(ticket.road)
            .or_default()
            .push_back(ticket);
    }

    /// Remove and return every ticket parked for `road`, oldest first
    pub fn drain_parked(&self, road: Road) -> Vec<Ticket> {
        let mut table = self.roads.lock().unwrap();
        table.parked.remove(&road).map(Vec::from).unwrap_or_default()
    }

    /// Put undelivered tickets back at the front of a road's queue,
    /// keeping their original order
    pub fn repark(&self, road: Road, tickets: Vec<Ticket>) {
        if tickets.is_empty() {
            return;
        }

        let mut table = self.roads.lock().unwrap();
        let parked = table.parked.entry(road).or_default();
        for ticket in tickets.into_iter().rev() {
            parked.push_front(ticket);
        }
    }
}
