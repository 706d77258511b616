//! Completion queues and their event channels.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use slog::Logger;

use verbs::{self, CompChannel, Context, Cq, Wc};
use {Error, Result};

/// An event-channel-backed queue of work completions.
///
/// The channel is either owned by this queue or shared with its sibling
/// receive queue; at most one channel event is armed at any time, and the
/// queue rearms itself immediately after acknowledging one.
#[derive(Debug)]
pub struct CompletionQueue {
    log: Logger,
    channel: Option<Arc<dyn CompChannel>>,
    shared: bool,
    cq: Option<Box<dyn verbs::Cq>>,
}

impl CompletionQueue {
    pub(crate) fn new(
        log: Logger,
        ctx: &dyn Context,
        cqe: i32,
        shared_channel: Option<&Arc<dyn CompChannel>>,
    ) -> Result<CompletionQueue> {
        let (channel, shared) = match shared_channel {
            Some(channel) => (channel.clone(), true),
            None => {
                let channel = ctx.create_comp_channel().map_err(|e| {
                    error!(log, "creating the completion channel failed"; "err" => %e);
                    Error::Provider(e)
                })?;
                (Arc::from(channel), false)
            }
        };

        let cq = ctx.create_cq(cqe, Some(channel.as_ref())).map_err(|e| {
            error!(log, "creating the completion queue failed";
                   "cqe" => cqe, "err" => %e);
            Error::Provider(e)
        })?;

        // arm the first channel event
        cq.req_notify().map_err(|e| {
            error!(log, "arming the completion queue failed"; "err" => %e);
            Error::Provider(e)
        })?;

        Ok(CompletionQueue {
            log,
            channel: Some(channel),
            shared,
            cq: Some(cq),
        })
    }

    /// File descriptor of the completion channel, for event-loop parking.
    pub fn get_fd(&self) -> RawFd {
        self.channel().fd()
    }

    /// Block for one completion event, acknowledge it and rearm the queue.
    ///
    /// Refused on a queue served by a shared channel; events of a shared
    /// channel belong to the connection that owns it.
    ///
    /// # Errors
    ///
    /// - `SharedChannel` - the queue is served by a shared channel
    /// - `NoCompletion` - the channel yielded nothing
    /// - `Provider` - rearming the queue failed
    pub fn wait(&self) -> Result<()> {
        if self.shared {
            return Err(Error::SharedChannel);
        }
        if self.channel().get_cq_event().is_err() {
            return Err(Error::NoCompletion);
        }
        self.verbs_cq().ack_events(1);
        self.verbs_cq().req_notify().map_err(|e| {
            error!(self.log, "rearming the completion queue failed"; "err" => %e);
            Error::Provider(e)
        })
    }

    /// Poll up to `wc.len()` completions.
    ///
    /// Polling more than one completion requires `num_got` so the caller
    /// can learn how many entries were filled in.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the array is empty, or holds several entries and
    ///   `num_got` is absent
    /// - `NoCompletion` - the queue is drained
    /// - `Provider` - the poll failed
    /// - `Unknown` - the poll reported more completions than requested
    pub fn get_wc(&self, wc: &mut [Wc], num_got: Option<&mut usize>) -> Result<()> {
        let num = wc.len();
        if num < 1 {
            return Err(Error::InvalidArg("completion array is empty"));
        }
        if num > 1 && num_got.is_none() {
            return Err(Error::InvalidArg("polling several completions needs an output count"));
        }

        let got = self.verbs_cq().poll(wc).map_err(|e| {
            error!(self.log, "polling the completion queue failed"; "err" => %e);
            Error::Provider(e)
        })?;
        if got == 0 {
            // an extra channel event with no completion behind it is legal
            debug!(self.log, "no completion in the cq");
            return Err(Error::NoCompletion);
        }
        if got > num {
            error!(self.log, "the provider returned more completions than requested";
                   "got" => got, "requested" => num);
            return Err(Error::Unknown);
        }

        if let Some(num_got) = num_got {
            *num_got = got;
        }
        Ok(())
    }

    pub(crate) fn verbs_cq(&self) -> &dyn verbs::Cq {
        // present from construction until the sole consuming destructor
        self.cq.as_ref().unwrap().as_ref()
    }

    fn channel(&self) -> &dyn CompChannel {
        self.channel.as_ref().unwrap().as_ref()
    }

    pub(crate) fn delete(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first = Ok(());
        if let Some(cq) = self.cq.take() {
            if let Err(e) = cq.destroy() {
                error!(self.log, "destroying the completion queue failed"; "err" => %e);
                first = Err(Error::Provider(e));
            }
        }
        if let Some(channel) = self.channel.take() {
            // a shared channel is destroyed by the connection owning it
            if !self.shared {
                if let Err(e) = channel.destroy() {
                    if first.is_ok() {
                        first = Err(Error::Provider(e));
                    } else {
                        warn!(self.log, "destroying the completion channel failed"; "err" => %e);
                    }
                }
            }
        }
        first
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
