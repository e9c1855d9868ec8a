//! Worker-side collaborators.
//!
//! The orchestrator does not run tests itself. Each host gets a worker
//! process spawned over its gateway; the orchestrator talks to it through a
//! `Channel` and watches it through a `NodeHandle`. Both are produced by
//! pluggable factories so the teardown protocol can be driven with any
//! transport.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::config::FleetConfig;
use crate::error::Result;
use crate::events::EventSink;
use crate::rig::connection::GatewayConnection;
use crate::rig::host::HostIdentity;


// ---------------------------------------------------------------------------
// ControlMessage
// ---------------------------------------------------------------------------

/// Wire value of the force-kill signal.
pub const KILL_SIGNAL: u64 = 42;

/// Control values the orchestrator sends down a worker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Graceful stop: finish the current item, then exit.
    Stop,
    /// Abort immediately.
    Kill,
}

impl ControlMessage {
    /// Encode for the channel: `null` for stop, `42` for kill.
    pub fn to_wire(self) -> Value {
        match self {
            ControlMessage::Stop => Value::Null,
            ControlMessage::Kill => Value::from(KILL_SIGNAL),
        }
    }

    /// Decode a received value. Anything but `null` or `42` is not a control
    /// message.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(ControlMessage::Stop),
            v if v.as_u64() == Some(KILL_SIGNAL) => Some(ControlMessage::Kill),
            _ => None,
        }
    }
}


// ---------------------------------------------------------------------------
// Channel / NodeHandle
// ---------------------------------------------------------------------------

/// Bidirectional link to one host's worker.
pub trait Channel: Send + Sync {
    fn host(&self) -> &HostIdentity;

    fn send(&self, message: ControlMessage) -> Result<()>;

    /// Wait up to `timeout` for the remote side to close the channel.
    /// Expiry is reported as `FleetError::CloseTimeout`.
    fn wait_close(&self, timeout: Duration) -> Result<()>;

    /// Force the channel closed.
    fn close(&self);

    /// Shut down the gateway the channel runs over.
    fn exit_gateway(&self);
}

/// Local proxy for a remote worker. Only the drain flag is inspected.
pub trait NodeHandle: Send {
    fn host(&self) -> &HostIdentity;

    /// True while the worker still has work in flight.
    fn pending(&self) -> bool;
}

/// Starts the worker on a connected host.
pub trait WorkerSpawner {
    fn spawn(&self, conn: &GatewayConnection, config: &FleetConfig) -> Result<Arc<dyn Channel>>;
}

/// Wraps a fresh channel in a node handle that reports through `sink`.
pub trait NodeFactory {
    fn create(&self, channel: Arc<dyn Channel>, sink: Arc<dyn EventSink>) -> Box<dyn NodeHandle>;
}


// ---------------------------------------------------------------------------
// Waiter
// ---------------------------------------------------------------------------

/// Called between drain checks while nodes are still pending.
pub trait Waiter {
    fn wait(&mut self);
}

impl<F: FnMut()> Waiter for F {
    fn wait(&mut self) {
        self()
    }
}

/// Waiter that sleeps for a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct SleepWaiter {
    interval: Duration,
}

impl SleepWaiter {
    pub fn new(interval: Duration) -> Self {
        SleepWaiter { interval }
    }
}

impl Default for SleepWaiter {
    fn default() -> Self {
        SleepWaiter::new(Duration::from_millis(100))
    }
}

impl Waiter for SleepWaiter {
    fn wait(&mut self) {
        thread::sleep(self.interval);
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_values() {
        assert_eq!(ControlMessage::Stop.to_wire(), Value::Null);
        assert_eq!(ControlMessage::Kill.to_wire(), json!(42));
        assert_eq!(serde_json::to_string(&ControlMessage::Stop.to_wire()).unwrap(), "null");
    }

    #[test]
    fn decode_wire_values() {
        assert_eq!(ControlMessage::from_wire(&Value::Null), Some(ControlMessage::Stop));
        assert_eq!(ControlMessage::from_wire(&json!(42)), Some(ControlMessage::Kill));
        assert_eq!(ControlMessage::from_wire(&json!(41)), None);
        assert_eq!(ControlMessage::from_wire(&json!("stop")), None);
    }

    #[test]
    fn closure_is_a_waiter() {
        let mut calls = 0;
        {
            let mut waiter = || calls += 1;
            Waiter::wait(&mut waiter);
            Waiter::wait(&mut waiter);
        }
        assert_eq!(calls, 2);
    }

    #[test]
    fn sleep_waiter_default_interval() {
        let waiter = SleepWaiter::default();
        assert_eq!(waiter.interval, Duration::from_millis(100));
    }
}
