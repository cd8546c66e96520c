use std::{
    sync::{
        atomic::{self, AtomicU64},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWriteExt, BufReader, BufWriter},
    net::{
        tcp::{ReadHalf, WriteHalf},
        TcpStream,
    },
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    correlator,
    ledger::{DispatcherEntry, Ledger, Limit, Mile, Observation, Road, SessionId},
    protocol::{
        deserializer::{Deserialize, DeserializeError},
        message::{FromClient, ToClient},
        serializer::Serialize,
    },
    router,
};

// Tickets, heartbeats and errors all funnel through this mailbox. A
// dispatcher that stops reading hits the cap and gets cut loose by the
// router instead of buffering without bound.
const TO_CLIENT_BUFFER_SIZE: usize = 32;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

type ConnWriter<'a> = BufWriter<WriteHalf<'a>>;
type ConnReader<'a> = BufReader<ReadHalf<'a>>;

pub async fn handle(
    mut connection: TcpStream,
    ledger: Arc<Ledger>,
    correlator: correlator::Handle,
) -> anyhow::Result<()> {
    let (reader, writer) = connection.split();
    let reader = BufReader::new(reader);
    let writer = BufWriter::new(writer);

    let (to_client, rx) = mpsc::channel(TO_CLIENT_BUFFER_SIZE);

    let session = Session {
        id: NEXT_SESSION_ID.fetch_add(1, atomic::Ordering::SeqCst),
        role: Role::Unassigned,
        heartbeat_running: false,
        cancel: CancellationToken::new(),
        ledger,
        correlator,
    };

    // run reader and writer side by side; join (not select) so the writer
    // can still flush a final Error frame after the reader gives up
    let (write_result, read_result) = tokio::join!(
        managed_writer(writer, rx),
        from_client(reader, to_client, session),
    );
    write_result?;
    read_result
}

// forward every queued frame to the socket; one flush per frame keeps
// writes atomic per message
async fn managed_writer(
    mut writer: ConnWriter<'_>,
    mut from_server: mpsc::Receiver<ToClient>,
) -> anyhow::Result<()> {
    while let Some(message) = from_server.recv().await {
        message.serialize(&mut writer).await?;
        writer.flush().await?;
    }

    Ok(())
}

// emit one heartbeat frame per interval until the session goes away
async fn heartbeat(to_client: mpsc::Sender<ToClient>, every: Duration, cancel: CancellationToken) {
    let mut ticks = time::interval_at(Instant::now() + every, every);
    // a slow client gets at most one heartbeat per tick, with no catch-up
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticks.tick() => {
                if to_client.send(ToClient::heartbeat()).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Unassigned,
    Camera {
        road: Road,
        mile: Mile,
        limit: Limit,
    },
    Dispatcher,
}

struct Session {
    id: SessionId,
    role: Role,
    // set once a non-zero WantHeartbeat is accepted
    heartbeat_running: bool,
    cancel: CancellationToken,
    ledger: Arc<Ledger>,
    correlator: correlator::Handle,
}

impl Drop for Session {
    // every exit path releases the timer and the registry entry
    fn drop(&mut self) {
        self.cancel.cancel();
        self.ledger.deregister_dispatcher(self.id);
    }
}

// handle incoming messages from the client
async fn from_client(
    mut reader: ConnReader<'_>,
    to_client: mpsc::Sender<ToClient>,
    mut session: Session,
) -> anyhow::Result<()> {
    loop {
        let message = tokio::select! {
            // the router cancels sessions whose mailbox backed up
            () = session.cancel.cancelled() => return Ok(()),
            message = FromClient::deserialize(&mut reader) => message,
        };

        let message = match message {
            Ok(message) => message,
            Err(DeserializeError::Io(_)) => return Ok(()), // client disconnected
            Err(reason) => {
                to_client.send(ToClient::error(reason.to_string())).await?;
                return Ok(());
            }
        };

        tracing::debug!(session = session.id, ?message, "received");

        match message {
            FromClient::WantHeartbeat { interval } => {
                if session.heartbeat_running {
                    to_client.send(ToClient::error("duplicate heartbeat")).await?;
                    return Ok(());
                }

                // an interval of zero asks for no heartbeats at all
                if interval > 0 {
                    session.heartbeat_running = true;
                    let every = Duration::from_millis(u64::from(interval) * 100);
                    tokio::spawn(heartbeat(to_client.clone(), every, session.cancel.clone()));
                }
            }
            FromClient::IAmCamera { road, mile, limit } => {
                if !matches!(session.role, Role::Unassigned) {
                    to_client.send(ToClient::error("illegal role change")).await?;
                    return Ok(());
                }

                session.role = Role::Camera { road, mile, limit };
            }
            FromClient::IAmDispatcher { roads } => {
                if !matches!(session.role, Role::Unassigned) {
                    to_client.send(ToClient::error("illegal role change")).await?;
                    return Ok(());
                }

                session.role = Role::Dispatcher;
                let entry = DispatcherEntry {
                    session: session.id,
                    mailbox: to_client.clone(),
                    cancel: session.cancel.clone(),
                };
                let newly_covered = session.ledger.register_dispatcher(entry, &roads);
                tracing::info!(session = session.id, ?roads, "dispatcher registered");

                // the drain runs outside the ledger lock; our own writer
                // empties the mailbox as we fill it
                for road in newly_covered {
                    router::drain_for(&session.ledger, road, &to_client).await;
                }
            }
            FromClient::Plate { plate, timestamp } => {
                let Role::Camera { road, mile, limit } = session.role else {
                    to_client.send(ToClient::error("not a camera")).await?;
                    return Ok(());
                };

                session
                    .correlator
                    .submit(Observation {
                        plate,
                        timestamp,
                        road,
                        mile,
                        limit,
                    })
                    .await;
            }
        }
    }
}
