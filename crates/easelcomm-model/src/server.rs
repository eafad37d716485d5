use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use easelcomm_comm::Comm;
use easelcomm_frame::{ChannelId, Message, MessageType};
use easelcomm_transport::HardwareBuffer;
use tracing::{debug, error, info, warn};

use crate::assembly::{protocol_violation, Assembly, Progress};
use crate::config::ModelServerConfig;
use crate::executor::{Executor, Model, Request};
use crate::protocol::{Command, Response, STATUS_OK};

/// Where the server is in the model/request protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Nothing loaded yet.
    Init,
    /// Model metadata in, pool buffers still arriving.
    MetadataReceived,
    /// Model loaded; ready for requests.
    PoolsReceived,
    /// Request metadata in, input buffers still arriving.
    RequestReceived,
    /// Request inputs complete, being handed to the worker.
    RequestPoolsReceived,
    Destroying,
    /// Torn down; a new model may be loaded.
    Destroyed,
}

/// Model execution service bound to one [`Comm`].
///
/// Commands and pool buffers are handled on the endpoint's receive thread,
/// under a single server lock. Completed requests go to a worker thread
/// that runs the [`Executor`] and ships the results back, so the receive
/// thread is never held up by execution.
#[derive(Clone)]
pub struct ModelServer {
    shared: Arc<Shared>,
}

struct Shared {
    config: ModelServerConfig,
    executor: Arc<dyn Executor>,
    core: Mutex<Core>,
}

struct Core {
    state: ServerState,
    loading: Option<(String, Assembly)>,
    request: Option<PendingRequest>,
    session: Option<Session>,
}

struct PendingRequest {
    id: u64,
    inputs: Assembly,
    output_sizes: Vec<usize>,
}

/// A loaded model and the worker serving it.
struct Session {
    model: Arc<Model>,
    queue: Arc<WorkQueue>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Request>,
    destroying: bool,
}

impl ModelServer {
    /// Register the command handler on `comm` and return the server.
    pub fn attach(comm: &Comm, executor: impl Executor, config: ModelServerConfig) -> Self {
        let command_channel = config.command_channel;
        let shared = Arc::new(Shared {
            config,
            executor: Arc::new(executor),
            core: Mutex::new(Core {
                state: ServerState::Init,
                loading: None,
                request: None,
                session: None,
            }),
        });

        let handler = Arc::clone(&shared);
        comm.register_handler(command_channel, move |comm: &Comm, message: &Message| {
            handler.handle(comm, message)
        });
        debug!(channel = command_channel, "model server attached");
        Self { shared }
    }

    pub fn config(&self) -> &ModelServerConfig {
        &self.shared.config
    }

    /// Waits for any command being handled to finish.
    pub fn state(&self) -> ServerState {
        lock(&self.shared.core).state
    }

    /// Name of the loaded model, if any.
    pub fn model_name(&self) -> Option<String> {
        lock(&self.shared.core)
            .session
            .as_ref()
            .map(|session| session.model.name.clone())
    }

    /// Unregister the command handler and stop the worker without telling
    /// the client. Queued requests are discarded.
    pub fn detach(&self, comm: &Comm) {
        comm.unregister_handler(self.shared.config.command_channel);
        let mut core = lock(&self.shared.core);
        core.loading = None;
        core.request = None;
        if let Some(session) = core.session.take() {
            session.stop();
        }
        core.state = ServerState::Destroyed;
    }
}

impl std::fmt::Debug for ModelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelServer")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn handle(&self, comm: &Comm, message: &Message) {
        let mut core = lock(&self.core);
        match message.message_type() {
            MessageType::Record => match message.to_record::<Command>() {
                Some(command) => self.handle_command(&mut core, comm, command),
                None => warn!(channel = message.channel(), "ignoring undecodable command"),
            },
            MessageType::Raw if message.has_payload() => {
                self.handle_buffer(&mut core, comm, message)
            }
            other => warn!(
                channel = message.channel(),
                message_type = ?other,
                "ignoring message on command channel"
            ),
        }
    }

    fn handle_command(&self, core: &mut Core, comm: &Comm, command: Command) {
        match command {
            Command::LoadModel { name, pool_sizes } => {
                if !matches!(core.state, ServerState::Init | ServerState::Destroyed) {
                    protocol_violation(format!("load_model in state {:?}", core.state));
                }
                check_sizes("pool", &pool_sizes);
                info!(model = %name, pools = pool_sizes.len(), "loading model");
                let assembly = Assembly::new(pool_sizes);
                let complete = assembly.is_complete();
                core.loading = Some((name, assembly));
                core.state = ServerState::MetadataReceived;
                if complete {
                    self.finish_model(core, comm);
                }
            }
            Command::SubmitRequest {
                request_id,
                input_sizes,
                output_sizes,
            } => {
                if core.state != ServerState::PoolsReceived {
                    protocol_violation(format!(
                        "submit_request {request_id} in state {:?}",
                        core.state
                    ));
                }
                check_sizes("input", &input_sizes);
                check_sizes("output", &output_sizes);
                debug!(
                    request_id,
                    inputs = input_sizes.len(),
                    outputs = output_sizes.len(),
                    "request announced"
                );
                let inputs = Assembly::new(input_sizes);
                let complete = inputs.is_complete();
                core.request = Some(PendingRequest {
                    id: request_id,
                    inputs,
                    output_sizes,
                });
                core.state = ServerState::RequestReceived;
                if complete {
                    self.finish_request(core, comm);
                }
            }
            Command::Destroy => self.destroy(core, comm),
        }
    }

    fn handle_buffer(&self, core: &mut Core, comm: &Comm, message: &Message) {
        let Some(descriptor) = message.payload() else {
            return;
        };
        let Some(id) = descriptor.id else {
            protocol_violation(format!(
                "buffer of {} bytes carries no id",
                descriptor.size
            ));
        };

        let state = core.state;
        let assembly = match (state, core.loading.as_mut(), core.request.as_mut()) {
            (ServerState::MetadataReceived, Some((_, assembly)), _) => assembly,
            (ServerState::RequestReceived, _, Some(pending)) => &mut pending.inputs,
            _ => protocol_violation(format!("buffer {id} received in state {state:?}")),
        };

        match assembly.accept(id, descriptor.size, |buffer| {
            comm.receive_payload(message, Some(buffer))
        }) {
            Ok(Progress::Pending) => debug!(id, size = descriptor.size, "buffer received"),
            Ok(Progress::Complete) if state == ServerState::MetadataReceived => {
                self.finish_model(core, comm)
            }
            Ok(Progress::Complete) => self.finish_request(core, comm),
            Err(err) => error!(id, error = %err, "failed to pull buffer"),
        }
    }

    fn finish_model(&self, core: &mut Core, comm: &Comm) {
        let Some((name, assembly)) = core.loading.take() else {
            protocol_violation("model completed without metadata".to_string());
        };
        let model = Arc::new(Model {
            name,
            pools: assembly.into_buffers(),
        });
        let queue = Arc::new(WorkQueue::default());
        let worker = self.spawn_worker(comm, Arc::clone(&model), Arc::clone(&queue));
        info!(model = %model.name, pools = model.pools.len(), "model loaded");

        core.session = Some(Session {
            model,
            queue,
            worker,
        });
        core.state = ServerState::PoolsReceived;
        self.respond(comm, &Response::ModelLoaded);
    }

    fn finish_request(&self, core: &mut Core, comm: &Comm) {
        let Some(pending) = core.request.take() else {
            protocol_violation("request completed without metadata".to_string());
        };
        core.state = ServerState::RequestPoolsReceived;
        let request_id = pending.id;
        let request = Request::new(request_id, pending.inputs.into_buffers(), pending.output_sizes);

        // Acknowledge before queueing so the client never sees results
        // ahead of the acceptance.
        self.respond(comm, &Response::RequestAccepted { request_id });
        match core.session.as_ref() {
            Some(session) if session.worker.is_some() => {
                session.queue.push(request);
                debug!(request_id, "request queued");
            }
            _ => {
                error!(request_id, "no worker thread to run request");
                self.respond(
                    comm,
                    &Response::RequestComplete {
                        request_id,
                        status: "no worker thread".to_string(),
                    },
                );
            }
        }
        core.state = ServerState::PoolsReceived;
    }

    fn destroy(&self, core: &mut Core, comm: &Comm) {
        info!(state = ?core.state, "destroying model");
        core.state = ServerState::Destroying;
        core.loading = None;
        core.request = None;
        if let Some(session) = core.session.take() {
            session.stop();
        }
        core.state = ServerState::Destroyed;
        self.respond(comm, &Response::Destroyed);
    }

    fn spawn_worker(
        &self,
        comm: &Comm,
        model: Arc<Model>,
        queue: Arc<WorkQueue>,
    ) -> Option<JoinHandle<()>> {
        let comm = comm.clone();
        let executor = Arc::clone(&self.executor);
        let channel = self.config.response_channel;
        thread::Builder::new()
            .name(self.config.worker_thread_name.clone())
            .spawn(move || run_worker(&comm, executor.as_ref(), &model, &queue, channel))
            .map_err(|err| error!(error = %err, "could not start worker thread"))
            .ok()
    }

    fn respond(&self, comm: &Comm, response: &Response) {
        if let Err(err) = comm.send_record(self.config.response_channel, response, None) {
            error!(response = response.name(), error = %err, "could not send response");
        }
    }
}

impl Session {
    /// Flag the worker down, discard queued requests and join it.
    fn stop(self) {
        for request in self.queue.shut_down() {
            warn!(request_id = request.id(), "discarding queued request");
        }
        if let Some(worker) = self.worker {
            if worker.join().is_err() {
                error!(model = %self.model.name, "worker thread panicked");
            }
        }
    }
}

impl WorkQueue {
    fn push(&self, request: Request) {
        lock(&self.state).jobs.push_back(request);
        self.ready.notify_one();
    }

    /// Block for the next request; `None` once the queue is shutting down.
    fn next(&self) -> Option<Request> {
        let mut state = lock(&self.state);
        loop {
            if state.destroying {
                return None;
            }
            if let Some(request) = state.jobs.pop_front() {
                return Some(request);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn shut_down(&self) -> Vec<Request> {
        let drained = {
            let mut state = lock(&self.state);
            state.destroying = true;
            state.jobs.drain(..).collect()
        };
        self.ready.notify_all();
        drained
    }
}

fn run_worker(
    comm: &Comm,
    executor: &dyn Executor,
    model: &Model,
    queue: &WorkQueue,
    channel: ChannelId,
) {
    debug!(model = %model.name, "worker started");
    while let Some(mut request) = queue.next() {
        let request_id = request.id();
        let status = match executor.execute(model, &mut request) {
            Ok(()) => STATUS_OK.to_string(),
            Err(err) => {
                warn!(request_id, error = %err, "request failed");
                err.to_string()
            }
        };
        let outputs = request.take_outputs();
        if let Err(err) = ship_results(comm, channel, request_id, &outputs, status) {
            error!(request_id, error = %err, "could not deliver results");
        }
    }
    debug!(model = %model.name, "worker stopped");
}

fn ship_results(
    comm: &Comm,
    channel: ChannelId,
    request_id: u64,
    outputs: &[HardwareBuffer],
    status: String,
) -> easelcomm_comm::Result<()> {
    let sizes = outputs.iter().map(HardwareBuffer::size).collect();
    comm.send_record(channel, &Response::Outputs { request_id, sizes }, None)?;
    comm.send_buffers(channel, outputs)?;
    comm.send_record(channel, &Response::RequestComplete { request_id, status }, None)?;
    debug!(request_id, outputs = outputs.len(), "results delivered");
    Ok(())
}

/// Zero-sized buffers cannot cross the link.
fn check_sizes(kind: &str, sizes: &[usize]) {
    if let Some(index) = sizes.iter().position(|&size| size == 0) {
        protocol_violation(format!("{kind} {index} declared with zero size"));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
