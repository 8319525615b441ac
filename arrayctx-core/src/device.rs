//! A simulated compute device: an in-order command queue served by a worker thread,
//! and the completion events its commands produce.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// Describes the device a queue submits to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    name: String,
    kind: DeviceKind,
    compute_units: usize,
}

impl Device {
    pub fn cpu() -> Self {
        Self {
            name: "host".to_string(),
            kind: DeviceKind::Cpu,
            compute_units: num_cpus::get(),
        }
    }

    /// A GPU-class device. Contexts built on one without an allocator warn.
    pub fn gpu(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DeviceKind::Gpu,
            compute_units: num_cpus::get_physical(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn compute_units(&self) -> usize {
        self.compute_units
    }
}

#[derive(Debug, Clone)]
enum EventState {
    Queued,
    Complete,
    Failed(String),
}

struct EventInner {
    command: String,
    state: Mutex<EventState>,
    done: Condvar,
}

/// Completion token for one queued command.
#[derive(Clone)]
pub struct Event(Arc<EventInner>);

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("command", &self.0.command)
            .field("state", &*self.0.state.lock().unwrap())
            .finish()
    }
}

impl Event {
    fn queued(command: &str) -> Self {
        Self(Arc::new(EventInner {
            command: command.to_string(),
            state: Mutex::new(EventState::Queued),
            done: Condvar::new(),
        }))
    }

    /// An event that is already complete, for data that needs no device work.
    pub fn complete() -> Self {
        let ev = Self::queued("marker");
        ev.finish(Ok(()));
        ev
    }

    fn finish(&self, result: std::result::Result<(), String>) {
        let mut state = self.0.state.lock().unwrap();
        *state = match result {
            Ok(()) => EventState::Complete,
            Err(msg) => EventState::Failed(msg),
        };
        self.0.done.notify_all();
    }

    /// Block until the command has run. A failed command surfaces here as
    /// [`Error::Device`].
    pub fn wait(&self) -> Result<()> {
        let mut state = self.0.state.lock().unwrap();
        while matches!(*state, EventState::Queued) {
            state = self.0.done.wait(state).unwrap();
        }
        match &*state {
            EventState::Failed(message) => Err(Error::Device {
                command: self.0.command.clone(),
                message: message.clone(),
            }
            .bt()),
            _ => Ok(()),
        }
    }

    pub fn is_complete(&self) -> bool {
        !matches!(*self.0.state.lock().unwrap(), EventState::Queued)
    }

    pub fn command(&self) -> &str {
        &self.0.command
    }
}

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Command {
    job: Job,
    event: Event,
}

struct QueueInner {
    id: usize,
    device: Device,
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static QUEUE_ID: AtomicUsize = AtomicUsize::new(0);

/// An in-order command queue on a [`Device`].
///
/// Commands run one at a time on a dedicated worker thread in submission order.
/// Clones share the same queue; it shuts down once the last handle drops.
#[derive(Clone)]
pub struct CommandQueue(Arc<QueueInner>);

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.0.id)
            .field("device", &self.0.device.name)
            .finish()
    }
}

impl PartialEq for CommandQueue {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for CommandQueue {}

impl CommandQueue {
    pub fn new(device: Device) -> Result<Self> {
        let id = QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<Command>();
        let worker = thread::Builder::new()
            .name(format!("arrayctx-queue-{id}"))
            .spawn(move || {
                while let Ok(Command { job, event }) = receiver.recv() {
                    log::trace!("queue {id}: running `{}`", event.command());
                    let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(payload) => Err(panic_message(payload)),
                    };
                    event.finish(result);
                }
            })?;
        Ok(Self(Arc::new(QueueInner {
            id,
            device,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })))
    }

    pub fn device(&self) -> &Device {
        &self.0.device
    }

    pub fn id(&self) -> usize {
        self.0.id
    }

    /// Submit a command. Returns immediately with the command's event.
    pub fn enqueue<F>(&self, command: &str, job: F) -> Result<Event>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let event = Event::queued(command);
        let sender = self.0.sender.lock().unwrap();
        let Some(sender) = sender.as_ref() else {
            return Err(Error::msg(format!("queue {} is shut down", self.0.id)));
        };
        sender
            .send(Command {
                job: Box::new(job),
                event: event.clone(),
            })
            .map_err(|_| Error::msg(format!("queue {} worker exited", self.0.id)))?;
        Ok(event)
    }

    /// Block until everything submitted so far has run.
    pub fn finish(&self) -> Result<()> {
        self.enqueue("finish", || Ok(()))?.wait()
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.sender.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("kernel panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("kernel panicked: {s}")
    } else {
        "kernel panicked".to_string()
    }
}
