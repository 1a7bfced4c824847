use crate::cluster::Membership;
use crate::config::Config;
use crate::protocol::{Header, Opcode, Request, Response, Tuple, RC_NOK, RC_OK};
use crate::session::SessionRegistry;
use crate::stats::ServerInfo;
use crate::storage::{NumericOutcome, Store, NO_TTL};
use bytes::Bytes;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Pre-packed ACK frames; by far the most common replies
static ACK_OK_FRAME: Lazy<Bytes> = Lazy::new(|| Response::Ack(RC_OK).encode(Opcode::Ack, false));
static ACK_NOK_FRAME: Lazy<Bytes> = Lazy::new(|| Response::Ack(RC_NOK).encode(Opcode::Ack, false));

/// What the server should do with the connection after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Write this frame back to the client
    Reply(Bytes),
    /// Dismantle the session without replying (QUIT)
    Drop,
}

fn ack_ok() -> Outcome {
    Outcome::Reply(ACK_OK_FRAME.clone())
}

fn ack_nok() -> Outcome {
    Outcome::Reply(ACK_NOK_FRAME.clone())
}

/// Executes decoded requests against the store on behalf of a session.
///
/// One handler per opcode; every store access happens through [`Store`],
/// which serializes it under the store lock.
pub struct CommandExecutor {
    store: Arc<Store>,
    sessions: Arc<SessionRegistry>,
    stats: Arc<ServerInfo>,
    cluster: Option<Arc<Membership>>,
    config: Config,
}

impl CommandExecutor {
    pub fn new(
        store: Arc<Store>,
        sessions: Arc<SessionRegistry>,
        stats: Arc<ServerInfo>,
        cluster: Option<Arc<Membership>>,
        config: Config,
    ) -> Self {
        Self {
            store,
            sessions,
            stats,
            cluster,
            config,
        }
    }

    pub fn execute(&self, session: u128, header: Header, request: Request) -> Outcome {
        self.stats.request_served();
        self.sessions.touch(session);
        let db = self.sessions.selected_db(session);

        match request {
            Request::Put { ttl, key, value } => {
                // On the wire a non-positive TTL means "no expiration";
                // 0 is the placeholder clients send for persistent keys
                let ttl = if ttl > 0 { ttl } else { NO_TTL };
                if header.prefix {
                    self.store.prefix_set(&db, &key, value, ttl);
                } else {
                    self.store.insert(&db, &key, value, ttl);
                }
                ack_ok()
            }

            Request::Get { key } => {
                if header.prefix {
                    let hits = self.store.prefix_get(&db, &key);
                    if hits.is_empty() {
                        return ack_nok();
                    }
                    let tuples = hits
                        .into_iter()
                        .map(|(key, entry)| Tuple {
                            ttl: entry.ttl,
                            key,
                            value: entry.data,
                        })
                        .collect();
                    Outcome::Reply(Response::Tuples(tuples).encode(Opcode::Get, true))
                } else {
                    match self.store.get(&db, &key) {
                        Some(entry) => Outcome::Reply(
                            Response::Single(Tuple {
                                ttl: entry.ttl,
                                key,
                                value: entry.data,
                            })
                            .encode(Opcode::Get, false),
                        ),
                        None => ack_nok(),
                    }
                }
            }

            Request::Del { key } => {
                let removed = if header.prefix {
                    self.store.prefix_remove(&db, &key) > 0
                } else {
                    self.store.remove(&db, &key)
                };
                if removed {
                    ack_ok()
                } else {
                    ack_nok()
                }
            }

            Request::Ttl { ttl, key } => {
                let touched = if header.prefix {
                    self.store.prefix_ttl(&db, &key, ttl) > 0
                } else {
                    self.store.set_ttl(&db, &key, ttl)
                };
                if touched {
                    ack_ok()
                } else {
                    ack_nok()
                }
            }

            Request::Inc { key } => self.numeric(&db, header, &key, 1),
            Request::Dec { key } => self.numeric(&db, header, &key, -1),

            Request::Cnt { key } => {
                let count = if key.is_empty() {
                    self.store.count(&db)
                } else {
                    self.store.prefix_count(&db, &key)
                };
                Outcome::Reply(Response::Count(count).encode(Opcode::Cnt, false))
            }

            Request::Use { key } => {
                if key.is_empty() {
                    return ack_nok();
                }
                let name = String::from_utf8_lossy(&key).into_owned();
                self.store.select(&name);
                self.sessions.select_db(session, &name);
                ack_ok()
            }

            Request::Keys { key } => {
                let hits = self.store.prefix_get(&db, &key);
                if hits.is_empty() {
                    return ack_nok();
                }
                let tuples = hits
                    .into_iter()
                    .map(|(key, entry)| Tuple {
                        ttl: entry.ttl,
                        key,
                        value: Bytes::new(),
                    })
                    .collect();
                Outcome::Reply(Response::Tuples(tuples).encode(Opcode::Keys, true))
            }

            Request::Ping => ack_ok(),

            Request::Quit => Outcome::Drop,

            Request::Db => Outcome::Reply(
                Response::Single(Tuple {
                    ttl: NO_TTL,
                    key: Bytes::from_static(b"db"),
                    value: Bytes::copy_from_slice(db.as_bytes()),
                })
                .encode(Opcode::Db, false),
            ),

            Request::Info => {
                let text = self.stats.render(&self.store, &self.config);
                Outcome::Reply(
                    Response::Single(Tuple {
                        ttl: NO_TTL,
                        key: Bytes::from_static(b"info"),
                        value: Bytes::from(text.into_bytes()),
                    })
                    .encode(Opcode::Info, false),
                )
            }

            Request::Flush => {
                self.store.flush(&db);
                ack_ok()
            }

            Request::Join { host, port } => match &self.cluster {
                Some(membership) => {
                    if membership.add(&host, port) {
                        self.stats.node_seen();
                    }
                    ack_ok()
                }
                None => ack_nok(),
            },

            // ACK has no request semantics; dispatch to a no-op
            Request::Ack => ack_ok(),
        }
    }

    fn numeric(&self, db: &str, header: Header, key: &[u8], delta: i64) -> Outcome {
        if header.prefix {
            // Non-numeric entries are skipped, never an error
            self.store.prefix_incr(db, key, delta);
            ack_ok()
        } else {
            match self.store.incr(db, key, delta) {
                NumericOutcome::Updated => ack_ok(),
                NumericOutcome::Missing | NumericOutcome::NotNumeric => ack_nok(),
            }
        }
    }
}
