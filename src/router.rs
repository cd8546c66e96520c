use std::collections::VecDeque;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    ledger::{Ledger, Road, Ticket},
    protocol::message::ToClient,
};

/// Route a freshly created ticket to a dispatcher, or park it
///
/// The covered days are marked before any delivery attempt, so a later
/// scan for the same plate already sees them as taken; parking counts as
/// emission. The dispatcher lookup happens under the ledger lock, the
/// delivery itself does not, and nothing here ever blocks on a foreign
/// mailbox.
pub fn emit(ledger: &Ledger, ticket: Ticket) {
    ledger.mark_ticketed(&ticket.plate, ticket.days());

    let mut pending = VecDeque::from([ticket]);
    while let Some(ticket) = pending.pop_front() {
        let Some(dispatcher) = ledger.find_dispatcher(ticket.road) else {
            let road = ticket.road;
            tracing::debug!(road, plate = %ticket.plate, "no dispatcher, parking ticket");
            ledger.park_ticket(ticket);

            // a dispatcher may have registered between the lookup and
            // the park; its drain saw an empty queue, so reclaim ours
            if ledger.find_dispatcher(road).is_some() {
                pending.extend(ledger.drain_parked(road));
            }
            continue;
        };

        match dispatcher.mailbox.try_send(ticket.clone().into()) {
            Ok(()) => {
                tracing::debug!(road = ticket.road, plate = %ticket.plate, "ticket dispatched");
            }
            Err(TrySendError::Full(_)) => {
                // the dispatcher stopped draining its mailbox; cut it
                // loose and offer the ticket to whoever is left
                tracing::warn!(session = dispatcher.session, "dispatcher mailbox full, closing it");
                dispatcher.cancel.cancel();
                ledger.deregister_dispatcher(dispatcher.session);
                pending.push_front(ticket);
            }
            Err(TrySendError::Closed(_)) => {
                ledger.deregister_dispatcher(dispatcher.session);
                pending.push_front(ticket);
            }
        }
    }
}

/// Deliver every ticket parked for `road` to a newly registered
/// dispatcher, in park order
///
/// Runs outside the ledger lock; the receiving session's own writer
/// empties the mailbox concurrently. If the dispatcher disappears
/// mid-drain, the undelivered tail goes back to the park queue in its
/// original order.
pub async fn drain_for(ledger: &Ledger, road: Road, mailbox: &mpsc::Sender<ToClient>) {
    let mut parked = ledger.drain_parked(road).into_iter();

    while let Some(ticket) = parked.next() {
        tracing::debug!(road, plate = %ticket.plate, "delivering parked ticket");
        if mailbox.send(ticket.clone().into()).await.is_err() {
            let mut undelivered = vec![ticket];
            undelivered.extend(parked);
            ledger.repark(road, undelivered);
            return;
        }
    }
}
