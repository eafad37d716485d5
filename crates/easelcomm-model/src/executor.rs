use easelcomm_transport::HardwareBuffer;

/// A fully received model: its name and pool buffers in id order.
#[derive(Debug)]
pub struct Model {
    pub name: String,
    pub pools: Vec<HardwareBuffer>,
}

/// A fully received request, owned by the worker while it executes.
#[derive(Debug)]
pub struct Request {
    id: u64,
    inputs: Vec<HardwareBuffer>,
    output_sizes: Vec<usize>,
    outputs: Vec<Option<HardwareBuffer>>,
}

impl Request {
    pub fn new(id: u64, inputs: Vec<HardwareBuffer>, output_sizes: Vec<usize>) -> Self {
        let outputs = output_sizes.iter().map(|_| None).collect();
        Self {
            id,
            inputs,
            output_sizes,
            outputs,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn inputs(&self) -> &[HardwareBuffer] {
        &self.inputs
    }

    pub fn output_sizes(&self) -> &[usize] {
        &self.output_sizes
    }

    /// Store output `index`. Its size must match the declared output size.
    pub fn set_output(
        &mut self,
        index: usize,
        buffer: HardwareBuffer,
    ) -> Result<(), ExecutionError> {
        let Some(&declared) = self.output_sizes.get(index) else {
            return Err(ExecutionError::new(format!(
                "output {index} out of range, request declares {}",
                self.output_sizes.len()
            )));
        };
        if buffer.size() != declared {
            return Err(ExecutionError::new(format!(
                "output {index} holds {} bytes, {declared} declared",
                buffer.size()
            )));
        }
        self.outputs[index] = Some(buffer);
        Ok(())
    }

    /// Take the outputs in order, allocating zeroed buffers for any slot the
    /// executor left empty. Each output is tagged with its index as id.
    pub fn take_outputs(&mut self) -> Vec<HardwareBuffer> {
        let sizes = &self.output_sizes;
        self.outputs
            .iter_mut()
            .enumerate()
            .map(|(index, slot)| {
                let mut buffer = slot
                    .take()
                    .unwrap_or_else(|| HardwareBuffer::zeroed(sizes[index]));
                buffer.set_id(Some(index as u32));
                buffer
            })
            .collect()
    }
}

/// Failure reported by an [`Executor`]; its text becomes the completion
/// status sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionError(String);

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Runs requests against a loaded model. Runs on the server's worker
/// thread, never on the receive thread.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, model: &Model, request: &mut Request) -> Result<(), ExecutionError>;
}

impl<F> Executor for F
where
    F: Fn(&Model, &mut Request) -> Result<(), ExecutionError> + Send + Sync + 'static,
{
    fn execute(&self, model: &Model, request: &mut Request) -> Result<(), ExecutionError> {
        self(model, request)
    }
}
