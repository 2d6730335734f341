//! Cooperative driver: fetch a batch of requests under the socket limit

use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::access::ProtocolApi;
use crate::protocols::{AccessError, Meta, ProtocolAccess, Request, Stage};
use crate::queue::{Admission, RequesterId};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{url}: {source}")]
    Access {
        url: String,
        #[source]
        source: AccessError,
    },

    #[error("{url}: no socket slot could ever be granted")]
    Starved { url: String },
}

/// A completed fetch
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: String,
    pub meta: Meta,
    pub body: Bytes,
}

struct Live {
    index: usize,
    session: Box<dyn ProtocolAccess>,
    meta: Option<Meta>,
    body: BytesMut,
}

enum Step {
    Pending,
    Finished,
}

/// Fetch every request, at most `sockets.max()` at a time, admitting in
/// request order. Results come back in request order.
pub fn fetch_all(
    api: &mut ProtocolApi,
    requests: &[Request],
    chunk_size: usize,
) -> Vec<Result<Fetched, FetchError>> {
    let admitted: Rc<RefCell<VecDeque<usize>>> = Rc::default();
    let ids: Vec<RequesterId> = requests.iter().map(|_| RequesterId::new()).collect();
    let mut results: Vec<Option<Result<Fetched, FetchError>>> =
        requests.iter().map(|_| None).collect();
    let mut live: Vec<Live> = Vec::new();

    for (index, id) in ids.iter().enumerate() {
        let slot = Rc::clone(&admitted);
        let outcome = api
            .sockets_mut()
            .request_slot(*id, Box::new(move || slot.borrow_mut().push_back(index)));
        if let Admission::Queued { position } = outcome {
            debug!(requester = %id, position, url = %requests[index].url, "Waiting for a socket");
        }
    }

    loop {
        // Admitted requests open first; a failed open hands its slot on.
        loop {
            let next = admitted.borrow_mut().pop_front();
            let Some(index) = next else { break };
            match api.protocol_access(&requests[index]) {
                Ok(session) => live.push(Live {
                    index,
                    session,
                    meta: None,
                    body: BytesMut::new(),
                }),
                Err(source) => {
                    results[index] = Some(Err(FetchError::Access {
                        url: requests[index].url.clone(),
                        source,
                    }));
                    api.sockets_mut().release_slot(ids[index]);
                }
            }
        }

        if live.is_empty() {
            break;
        }

        let mut still_live = Vec::with_capacity(live.len());
        for mut entry in live.drain(..) {
            match step(&mut entry, chunk_size, api) {
                Ok(Step::Pending) => {
                    still_live.push(entry);
                    continue;
                }
                Ok(Step::Finished) => {
                    let meta = entry.meta.take().unwrap_or_else(|| Meta {
                        status: 0,
                        reason: String::new(),
                        headers: Default::default(),
                    });
                    results[entry.index] = Some(Ok(Fetched {
                        url: requests[entry.index].url.clone(),
                        meta,
                        body: entry.body.split().freeze(),
                    }));
                }
                Err(source) => {
                    warn!(url = %requests[entry.index].url, error = %source, "Fetch failed");
                    results[entry.index] = Some(Err(FetchError::Access {
                        url: requests[entry.index].url.clone(),
                        source,
                    }));
                }
            }
            entry.session.close();
            api.sockets_mut().release_slot(ids[entry.index]);
        }
        live = still_live;
    }

    results
        .into_iter()
        .enumerate()
        .map(|(index, result)| {
            result.unwrap_or_else(|| {
                api.sockets_mut().release_slot(ids[index]);
                info!(url = %requests[index].url, "Request never admitted");
                Err(FetchError::Starved {
                    url: requests[index].url.clone(),
                })
            })
        })
        .collect()
}

/// Advance one session by a single poll/get pair.
fn step(entry: &mut Live, chunk_size: usize, api: &ProtocolApi) -> Result<Step, AccessError> {
    let session = entry.session.as_mut();
    match session.stage() {
        Stage::Meta => {
            if session.pollmeta()?.ready {
                entry.meta = Some(session.getmeta()?);
            }
            Ok(Step::Pending)
        }
        Stage::Data | Stage::Eof => {
            if !session.polldata()?.ready {
                return Ok(Step::Pending);
            }
            let chunk = session.getdata(chunk_size)?;
            if chunk.is_empty() {
                return Ok(Step::Finished);
            }
            api.metrics().bytes_delivered(chunk.len());
            entry.body.extend_from_slice(&chunk);
            Ok(Step::Pending)
        }
        Stage::Done => Ok(Step::Finished),
    }
}
