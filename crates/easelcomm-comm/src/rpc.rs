//! Blocking request/response over a pair of channels.
//!
//! A call arms a one-shot handler on the response channel, sends the request
//! record and waits, without a timeout, for the first record to come back.
//! The handler table holds one handler per channel, so only one call may be
//! outstanding per (endpoint, response channel); [`RpcClient`] queues
//! concurrent callers instead of letting them overwrite each other.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use easelcomm_frame::{ChannelId, Message};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::comm::{Comm, Handler};
use crate::error::{CommError, Result};

/// Send `request` on `request_channel` and block for the reply on
/// `response_channel`.
///
/// Must not be called from `comm`'s receive thread: the reply would be
/// queued behind the caller forever.
pub fn call<Req, Resp>(
    comm: &Comm,
    request_channel: ChannelId,
    request: &Req,
    response_channel: ChannelId,
) -> Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned + Send + 'static,
{
    if comm.is_receive_thread() {
        return Err(CommError::CalledFromReceiveThread);
    }

    let (tx, rx) = mpsc::sync_channel::<Result<Resp>>(1);
    let slot = Mutex::new(Some(tx));
    let handler: Handler = Arc::new(move |_comm: &Comm, message: &Message| {
        let Some(tx) = lock(&slot).take() else {
            debug!(channel = message.channel(), "late reply ignored");
            return;
        };
        let reply = message.to_record::<Resp>().ok_or(CommError::Decode {
            channel: message.channel(),
            expected: type_name::<Resp>(),
        });
        let _ = tx.send(reply);
    });
    comm.insert_handler(response_channel, Arc::clone(&handler));

    if let Err(err) = comm.send_record(request_channel, request, None) {
        comm.remove_handler_if(response_channel, &handler);
        return Err(err);
    }
    debug!(request_channel, response_channel, "waiting for reply");

    // Only unregistering the handler closes the channel, so this waits
    // for as long as the peer takes.
    let reply = rx.recv().map_err(|_| CommError::NotConnected);
    comm.remove_handler_if(response_channel, &handler);
    reply?
}

/// Serializes [`call`]s per response channel on one endpoint.
#[derive(Debug, Clone)]
pub struct RpcClient {
    comm: Comm,
    gates: Arc<Mutex<HashMap<ChannelId, Arc<Mutex<()>>>>>,
}

impl RpcClient {
    pub fn new(comm: Comm) -> Self {
        Self {
            comm,
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// Like [`call`], but waits for any call already outstanding on
    /// `response_channel` to finish first.
    pub fn call<Req, Resp>(
        &self,
        request_channel: ChannelId,
        request: &Req,
        response_channel: ChannelId,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        let gate = Arc::clone(lock(&self.gates).entry(response_channel).or_default());
        let _outstanding = lock(&gate);
        call(&self.comm, request_channel, request, response_channel)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
