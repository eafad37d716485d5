use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use easelcomm_comm::{Comm, CommError};
use easelcomm_frame::{Message, MessageType};
use easelcomm_transport::HardwareBuffer;
use tracing::{debug, error, warn};

use crate::assembly::{protocol_violation, Assembly, Progress};
use crate::config::ModelServerConfig;
use crate::error::{ModelError, Result};
use crate::protocol::{Command, Response, STATUS_OK};

/// Results of one executed request.
#[derive(Debug)]
pub struct CompletedRequest {
    pub request_id: u64,
    /// Output buffers in id order.
    pub outputs: Vec<HardwareBuffer>,
}

/// What the response handler hands to a waiting operation.
enum Event {
    Response(Response),
    Outputs {
        request_id: u64,
        buffers: Vec<HardwareBuffer>,
    },
    Failed(CommError),
}

/// Blocking client for a [`ModelServer`](crate::ModelServer).
///
/// Operations run one at a time; concurrent callers queue. None of them may
/// be called from the endpoint's receive thread.
pub struct ModelClient {
    comm: Comm,
    config: ModelServerConfig,
    events: Mutex<Receiver<Event>>,
}

struct Collector {
    events: Sender<Event>,
    outputs: Mutex<Option<(u64, Assembly)>>,
}

impl ModelClient {
    /// Register the response handler on `comm`.
    pub fn new(comm: Comm, config: ModelServerConfig) -> Self {
        let (tx, rx) = mpsc::channel();
        let collector = Arc::new(Collector {
            events: tx,
            outputs: Mutex::new(None),
        });
        comm.register_handler(config.response_channel, move |comm: &Comm, message: &Message| {
            collector.handle(comm, message)
        });
        Self {
            comm,
            config,
            events: Mutex::new(rx),
        }
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// Ship a model: metadata, then `pools` as buffers `0..N`. Returns once
    /// the server has received every pool.
    pub fn load_model(&self, name: &str, mut pools: Vec<HardwareBuffer>) -> Result<()> {
        let events = self.begin()?;
        check_buffers("pool", &pools)?;
        for (id, pool) in pools.iter_mut().enumerate() {
            pool.set_id(Some(id as u32));
        }

        let command = Command::LoadModel {
            name: name.to_string(),
            pool_sizes: pools.iter().map(HardwareBuffer::size).collect(),
        };
        self.comm
            .send_record(self.config.command_channel, &command, None)?;
        self.comm.send_buffers(self.config.command_channel, &pools)?;

        match next_response(&events)? {
            Response::ModelLoaded => Ok(()),
            other => Err(unexpected("model_loaded", &other)),
        }
    }

    /// Submit a request and block until its outputs and completion status
    /// are back.
    pub fn execute(
        &self,
        request_id: u64,
        mut inputs: Vec<HardwareBuffer>,
        output_sizes: Vec<usize>,
    ) -> Result<CompletedRequest> {
        let events = self.begin()?;
        check_buffers("input", &inputs)?;
        if let Some(index) = output_sizes.iter().position(|&size| size == 0) {
            return Err(CommError::InvalidBuffer(format!("output {index} has zero size")).into());
        }
        for (id, input) in inputs.iter_mut().enumerate() {
            input.set_id(Some(id as u32));
        }

        let command = Command::SubmitRequest {
            request_id,
            input_sizes: inputs.iter().map(HardwareBuffer::size).collect(),
            output_sizes,
        };
        self.comm
            .send_record(self.config.command_channel, &command, None)?;
        self.comm
            .send_buffers(self.config.command_channel, &inputs)?;

        match next_response(&events)? {
            Response::RequestAccepted { request_id: id } if id == request_id => {}
            other => return Err(unexpected("request_accepted", &other)),
        }
        debug!(request_id, "request accepted");

        let outputs = match next_event(&events)? {
            Event::Outputs {
                request_id: id,
                buffers,
            } if id == request_id => buffers,
            Event::Outputs { request_id: id, .. } => {
                return Err(ModelError::UnexpectedResponse {
                    expected: "outputs",
                    actual: format!("outputs for request {id}"),
                })
            }
            Event::Response(Response::RequestComplete { status, .. }) => {
                return Err(ModelError::ExecutionFailed { request_id, status })
            }
            Event::Response(other) => return Err(unexpected("outputs", &other)),
            Event::Failed(err) => return Err(err.into()),
        };

        match next_response(&events)? {
            Response::RequestComplete { request_id: id, status } if id == request_id => {
                if status == STATUS_OK {
                    Ok(CompletedRequest {
                        request_id,
                        outputs,
                    })
                } else {
                    Err(ModelError::ExecutionFailed { request_id, status })
                }
            }
            other => Err(unexpected("request_complete", &other)),
        }
    }

    /// Tear the server's model down. Returns once the server has stopped
    /// its worker.
    pub fn destroy(&self) -> Result<()> {
        let events = self.begin()?;
        self.comm
            .send_record(self.config.command_channel, &Command::Destroy, None)?;
        match next_response(&events)? {
            Response::Destroyed => Ok(()),
            other => Err(unexpected("destroyed", &other)),
        }
    }

    /// Take the operation lock, dropping anything a failed earlier
    /// operation left behind.
    fn begin(&self) -> Result<MutexGuard<'_, Receiver<Event>>> {
        if self.comm.is_receive_thread() {
            return Err(CommError::CalledFromReceiveThread.into());
        }
        let events = lock(&self.events);
        while let Ok(stale) = events.try_recv() {
            if let Event::Response(response) = stale {
                debug!(response = response.name(), "dropping stale response");
            }
        }
        Ok(events)
    }
}

impl Drop for ModelClient {
    fn drop(&mut self) {
        self.comm.unregister_handler(self.config.response_channel);
    }
}

impl std::fmt::Debug for ModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Collector {
    fn handle(&self, comm: &Comm, message: &Message) {
        match message.message_type() {
            MessageType::Record => {
                let Some(response) = message.to_record::<Response>() else {
                    warn!(channel = message.channel(), "ignoring undecodable response");
                    return;
                };
                match response {
                    Response::Outputs { request_id, sizes } => {
                        let assembly = Assembly::new(sizes);
                        if assembly.is_complete() {
                            self.emit(Event::Outputs {
                                request_id,
                                buffers: Vec::new(),
                            });
                        } else {
                            *lock(&self.outputs) = Some((request_id, assembly));
                        }
                    }
                    other => self.emit(Event::Response(other)),
                }
            }
            MessageType::Raw if message.has_payload() => self.handle_output(comm, message),
            other => warn!(
                channel = message.channel(),
                message_type = ?other,
                "ignoring message on response channel"
            ),
        }
    }

    fn handle_output(&self, comm: &Comm, message: &Message) {
        let Some(descriptor) = message.payload() else {
            return;
        };
        let Some(id) = descriptor.id else {
            protocol_violation(format!(
                "output of {} bytes carries no id",
                descriptor.size
            ));
        };

        let mut slot = lock(&self.outputs);
        let Some((request_id, assembly)) = slot.as_mut() else {
            protocol_violation(format!("output {id} arrived without an outputs record"));
        };
        let request_id = *request_id;
        match assembly.accept(id, descriptor.size, |buffer| {
            comm.receive_payload(message, Some(buffer))
        }) {
            Ok(Progress::Pending) => {}
            Ok(Progress::Complete) => {
                if let Some((_, assembly)) = slot.take() {
                    self.emit(Event::Outputs {
                        request_id,
                        buffers: assembly.into_buffers(),
                    });
                }
            }
            Err(err) => {
                error!(request_id, id, error = %err, "failed to pull output");
                slot.take();
                self.emit(Event::Failed(err));
            }
        }
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("model client gone, dropping response");
        }
    }
}

fn next_event(events: &Receiver<Event>) -> Result<Event> {
    events.recv().map_err(|_| ModelError::ResponsesClosed)
}

fn next_response(events: &Receiver<Event>) -> Result<Response> {
    match next_event(events)? {
        Event::Response(response) => Ok(response),
        Event::Outputs { request_id, .. } => Err(ModelError::UnexpectedResponse {
            expected: "response record",
            actual: format!("outputs for request {request_id}"),
        }),
        Event::Failed(err) => Err(err.into()),
    }
}

fn unexpected(expected: &'static str, actual: &Response) -> ModelError {
    ModelError::UnexpectedResponse {
        expected,
        actual: actual.name().to_string(),
    }
}

/// Buffers must be sendable before any metadata goes out, or the server
/// would wait for pools that never come.
fn check_buffers(kind: &str, buffers: &[HardwareBuffer]) -> Result<()> {
    match buffers.iter().position(|buffer| !buffer.is_valid()) {
        Some(index) => {
            Err(CommError::InvalidBuffer(format!("{kind} {index} cannot be sent")).into())
        }
        None => Ok(()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
